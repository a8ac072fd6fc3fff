use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;

use crate::metrics::Delivery;

/// One served request.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub peer: Option<SocketAddr>,
    pub url: String,
    pub offset: u64,
    pub status: u16,
    pub bytes: u64,
    pub elapsed: Duration,
    pub delivery: Delivery,
}

impl AccessRecord {
    fn to_line(&self) -> String {
        let peer = self.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        format!(
            "{} {} \"{}\" {} {} {} {}ms {}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%z"),
            peer,
            self.url,
            self.offset,
            self.status,
            self.bytes,
            self.elapsed.as_millis(),
            self.delivery.as_str(),
        )
    }
}

#[derive(Debug)]
enum Sink {
    File(File),
    Stdout(std::io::Stdout),
}

#[derive(Debug)]
struct State {
    sink: Sink,
    stamp: Option<String>,
}

/// Plain text access log, rotated whenever the wall clock minute changes.
#[derive(Debug)]
pub struct AccessLogger {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl AccessLogger {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let (sink, path) = match path.filter(|p| !p.trim().is_empty()) {
            Some(path) => {
                let path = Path::new(path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
                }
                (Sink::File(open_append(path)?), Some(path.to_path_buf()))
            }
            None => (Sink::Stdout(std::io::stdout()), None),
        };
        Ok(Self {
            state: Mutex::new(State { sink, stamp: None }),
            path,
        })
    }

    pub fn log(&self, record: &AccessRecord) {
        let line = record.to_line();
        let mut state = self.state.lock().expect("access log");
        self.rotate_if_needed(&mut state);
        let result = match &mut state.sink {
            Sink::File(file) => file.write_all(line.as_bytes()),
            Sink::Stdout(stdout) => stdout.write_all(line.as_bytes()),
        };
        if let Err(err) = result {
            log::warn!("write access log failed: {err}");
        }
    }

    fn rotate_if_needed(&self, state: &mut State) {
        let Some(path) = &self.path else { return };
        let stamp = Local::now().format("%Y%m%d%H%M").to_string();
        match &state.stamp {
            Some(last) if *last == stamp => return,
            None => {
                state.stamp = Some(stamp);
                return;
            }
            Some(_) => {}
        }
        let rotated = PathBuf::from(format!("{}.{}", path.display(), state.stamp.as_deref().unwrap_or_default()));
        if let Err(err) = fs::rename(path, &rotated) {
            log::warn!("rotate access log {} failed: {err}", path.display());
        }
        match open_append(path) {
            Ok(file) => {
                state.sink = Sink::File(file);
                state.stamp = Some(stamp);
            }
            Err(err) => log::warn!("reopen access log failed: {err}"),
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open access log {}", path.display()))
}
