use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::constants::TEMP_POSTFIX;
use crate::error::{ProxyCacheError, Result};
use crate::storage::lru::DiskUsage;
use crate::storage::Cache;

/// Disk backed [`Cache`].
///
/// While in progress the data lives in `<name>.download`; `complete()` renames
/// it to `<name>`. A cache opened over an existing final file is completed
/// from the start and never touches the network. After `close()` the cache
/// only serves reads; further writes fail with `Interrupted`.
pub struct FileCache {
    state: Mutex<FileState>,
    final_path: PathBuf,
    disk_usage: Arc<dyn DiskUsage>,
}

struct FileState {
    path: PathBuf,
    file: Option<File>,
    available: u64,
    completed: bool,
    closed: bool,
}

impl FileCache {
    pub fn new(path: impl AsRef<Path>, disk_usage: Arc<dyn DiskUsage>) -> Result<Self> {
        let final_path = final_path_of(path.as_ref());
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let state = if final_path.is_file() {
            let available = fs::metadata(&final_path)?.len();
            FileState {
                path: final_path.clone(),
                file: None,
                available,
                completed: true,
                closed: false,
            }
        } else {
            let temp = temp_path_of(&final_path);
            let available = match fs::metadata(&temp) {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            FileState {
                path: temp,
                file: None,
                available,
                completed: false,
                closed: false,
            }
        };

        Ok(Self {
            state: Mutex::new(state),
            final_path,
            disk_usage,
        })
    }
}

impl Cache for FileCache {
    fn available(&self) -> Result<u64> {
        let state = self.state.lock().expect("file cache");
        Ok(state.available)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock().expect("file cache");
        if offset >= state.available || buf.is_empty() {
            return Ok(0);
        }
        let len = (state.available - offset).min(buf.len() as u64) as usize;
        let file = state.handle()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..len])?;
        Ok(len)
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("file cache");
        if state.completed {
            return Err(ProxyCacheError::AlreadyCompleted);
        }
        if state.closed {
            return Err(ProxyCacheError::Interrupted);
        }
        let file = state.handle()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        state.available += data.len() as u64;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let completed = {
            let mut state = self.state.lock().expect("file cache");
            state.closed = true;
            if let Some(mut file) = state.file.take() {
                if !state.completed {
                    file.flush()?;
                }
            }
            state.completed
        };
        if completed {
            self.disk_usage.touch(&self.final_path);
        }
        Ok(())
    }

    fn complete(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("file cache");
            if state.completed {
                return Ok(());
            }
            if state.closed {
                return Err(ProxyCacheError::Interrupted);
            }
            if let Some(mut file) = state.file.take() {
                file.flush()?;
            }
            if state.path.exists() {
                fs::rename(&state.path, &self.final_path)?;
            } else {
                File::create(&self.final_path)?;
            }
            state.path = self.final_path.clone();
            state.completed = true;
        }
        log::debug!("cache file {} is completed", self.final_path.display());
        self.disk_usage.touch(&self.final_path);
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.state.lock().expect("file cache").completed
    }

    fn file(&self) -> Option<PathBuf> {
        Some(self.state.lock().expect("file cache").path.clone())
    }
}

impl FileState {
    fn handle(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None if self.completed => File::open(&self.path)?,
            None => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?,
        };
        Ok(self.file.insert(file))
    }
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(TEMP_POSTFIX))
        .unwrap_or(false)
}

pub fn temp_path_of(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(TEMP_POSTFIX);
    PathBuf::from(name)
}

fn final_path_of(path: &Path) -> PathBuf {
    if !is_temp_file(path) {
        return path.to_path_buf();
    }
    let raw = path.to_string_lossy();
    PathBuf::from(&raw[..raw.len() - TEMP_POSTFIX.len()])
}
