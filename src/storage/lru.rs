use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::time::SystemTime;

use crate::metrics;
use crate::storage::file::is_temp_file;

/// Retention policy for the cache folder.
pub trait DiskUsage: Send + Sync {
    /// Marks `file` as just used and trims its folder.
    fn touch(&self, file: &Path);
    fn trim(&self, folder: &Path);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruPolicy {
    TotalSize(u64),
    TotalCount(usize),
}

impl LruPolicy {
    pub fn accept(&self, total_size: u64, total_count: usize) -> bool {
        match *self {
            LruPolicy::TotalSize(max) => total_size <= max,
            LruPolicy::TotalCount(max) => total_count <= max,
        }
    }
}

enum Task {
    Touch(PathBuf),
    Trim(PathBuf),
    Flush(SyncSender<()>),
}

/// Least-recently-used eviction over file modification times.
///
/// All work runs on one background thread so deletions never race each other.
/// In-progress (`.download`) files are neither counted nor evicted.
pub struct LruDiskUsage {
    tasks: Sender<Task>,
}

impl LruDiskUsage {
    pub fn new(policy: LruPolicy) -> Self {
        let (tasks, rx) = mpsc::channel::<Task>();
        std::thread::spawn(move || {
            for task in rx {
                match task {
                    Task::Touch(file) => touch_in_background(&file, policy),
                    Task::Trim(folder) => trim_in_background(&folder, policy),
                    Task::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tasks }
    }

    pub fn total_size(max_bytes: u64) -> Self {
        Self::new(LruPolicy::TotalSize(max_bytes))
    }

    pub fn total_count(max_files: usize) -> Self {
        Self::new(LruPolicy::TotalCount(max_files))
    }

    /// Blocks until every task queued so far has been processed.
    pub fn flush(&self) {
        let (done, wait) = mpsc::sync_channel(1);
        if self.tasks.send(Task::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    fn submit(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            log::error!("disk usage worker is gone, task dropped");
        }
    }
}

impl DiskUsage for LruDiskUsage {
    fn touch(&self, file: &Path) {
        self.submit(Task::Touch(file.to_path_buf()));
    }

    fn trim(&self, folder: &Path) {
        self.submit(Task::Trim(folder.to_path_buf()));
    }
}

fn touch_in_background(file: &Path, policy: LruPolicy) {
    if let Err(err) = set_last_modified_now(file) {
        log::warn!("error touching cache file {}: {err}", file.display());
    }
    if let Some(folder) = file.parent() {
        trim_in_background(folder, policy);
    }
}

fn trim_in_background(folder: &Path, policy: LruPolicy) {
    match lru_list_files(folder) {
        Ok(files) => trim(files, policy),
        Err(err) => log::warn!("error listing cache folder {}: {err}", folder.display()),
    }
}

fn set_last_modified_now(file: &Path) -> std::io::Result<()> {
    let handle = File::options().write(true).open(file)?;
    handle.set_modified(SystemTime::now())
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Completed cache files of `folder`, oldest first.
fn lru_list_files(folder: &Path) -> std::io::Result<Vec<CachedFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        if is_temp_file(&path) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(CachedFile {
            path,
            size: meta.len(),
            modified,
        });
    }
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

fn trim(files: Vec<CachedFile>, policy: LruPolicy) {
    let mut total_size: u64 = files.iter().map(|f| f.size).sum();
    let mut total_count = files.len();
    for file in files {
        if policy.accept(total_size, total_count) {
            continue;
        }
        match fs::remove_file(&file.path) {
            Ok(()) => {
                total_count -= 1;
                total_size -= file.size;
                metrics::record_evicted();
                log::info!(
                    "cache file {} is deleted because it exceeds cache limit",
                    file.path.display()
                );
            }
            Err(err) => {
                log::error!("error deleting file {} for trimming cache: {err}", file.path.display());
            }
        }
    }
}
