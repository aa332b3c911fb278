//! File-backed resource loading.
//!
//! Every file is registered in a [`ResourceCache<Vec<u8>>`] under a GUID
//! derived from its path. A load is two stages: a read stage that hands the
//! path to the [`IoQueue`] thread and awaits it externally, and a publish
//! stage that hands the bytes (or the error) to the cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Sender};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::runtime::cache::{
    CacheResult, CacheStats, Guid, ListenerId, LoadOutcome, LoadRequest, ResourceCache, ResourceLoader,
};
use crate::runtime::identifier::Identifier;
use crate::runtime::scheduler::{
    Batch, ExternalCompletion, PoolHandle, Priority, Stage, StageOutcome, StatsSnapshot,
};

type ReadSlot = Arc<Mutex<Option<io::Result<Vec<u8>>>>>;

struct IoJob {
    path: PathBuf,
    slot: ReadSlot,
    completion: ExternalCompletion,
}

/// Dedicated blocking-I/O thread fed through a channel.
///
/// Reads happen off the runner threads; each finished read completes the
/// stage that submitted it.
pub struct IoQueue {
    sender: Option<Sender<IoJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl IoQueue {
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<IoJob>();
        let worker = thread::Builder::new()
            .name("jobgraph-io".to_string())
            .spawn(move || {
                for job in receiver {
                    let result = fs::read(&job.path);
                    if let Err(err) = &result {
                        debug!(path = %job.path.display(), %err, "read failed");
                    }
                    *job.slot.lock() = Some(result);
                    job.completion.finish();
                }
                debug!("I/O queue drained");
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn submit(
        &self,
        job: IoJob,
    ) -> Result<(), IoJob> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }
}

type PathIndex = Arc<RwLock<HashMap<Guid, PathBuf>>>;

/// [`ResourceLoader`] reading the file registered under a GUID.
pub struct FileLoader {
    index: PathIndex,
    io: Arc<IoQueue>,
}

impl ResourceLoader<Vec<u8>> for FileLoader {
    fn load(
        &self,
        request: LoadRequest<Vec<u8>>,
    ) -> Batch {
        let Some(path) = request
            .guid()
            .and_then(|guid| self.index.read().get(&guid).cloned())
        else {
            warn!(identifier = %request.identifier(), "no file registered for resource");
            if let Err(err) = request.fail() {
                warn!(%err, "could not fail load");
            }
            return Batch::default();
        };

        let slot: ReadSlot = Arc::new(Mutex::new(None));
        let read = {
            let io = self.io.clone();
            let slot = slot.clone();
            let path = path.clone();
            Stage::builder()
                .name(format!("read {}", path.display()))
                .priority(Priority::HIGH)
                .build_fn(move |ctx| {
                    let completion = ctx.await_external();
                    if let Err(job) = io.submit(IoJob {
                        path,
                        slot,
                        completion,
                    }) {
                        *job.slot.lock() = Some(Err(io::Error::other("I/O queue is closed")));
                        job.completion.finish();
                    }
                    StageOutcome::AwaitExternalFinish
                })
        };

        let publish = Stage::builder()
            .name(format!("publish {}", path.display()))
            .build_fn(move |_| {
                let result = slot
                    .lock()
                    .take()
                    .unwrap_or_else(|| Err(io::Error::other("read stage produced no result")));
                let completed = match result {
                    Ok(bytes) => request.finish(bytes),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to load file");
                        request.fail()
                    }
                };
                if let Err(err) = completed {
                    error!(%err, "could not complete load");
                }
                StageOutcome::Finished
            });

        let mut batch = Batch::new(read);
        if let Err(err) = batch.queue_as_new_finished_stage(publish) {
            error!(%err, "failed to wire load stages");
        }
        batch
    }
}

/// Byte cache over files on disk.
pub struct FileCache {
    cache: ResourceCache<Vec<u8>>,
    index: PathIndex,
}

impl FileCache {
    pub fn new(capacity: u32) -> io::Result<Self> {
        let index: PathIndex = Arc::new(RwLock::new(HashMap::new()));
        let loader = FileLoader {
            index: index.clone(),
            io: Arc::new(IoQueue::spawn()?),
        };
        Ok(Self {
            cache: ResourceCache::with_capacity(capacity, loader),
            index,
        })
    }

    /// GUID a path is registered under.
    pub fn guid_for(path: &Path) -> Guid {
        Guid::from_name(&path.to_string_lossy())
    }

    pub fn register(
        &self,
        path: &Path,
    ) -> CacheResult<Identifier> {
        let guid = Self::guid_for(path);
        self.index
            .write()
            .entry(guid)
            .or_insert_with(|| path.to_path_buf());
        self.cache.find_or_register(guid)
    }

    #[inline]
    pub fn cache(&self) -> &ResourceCache<Vec<u8>> {
        &self.cache
    }
}

/// Expand directories into the files below them.
///
/// With `extension`, only files carrying it are kept. Explicitly named files
/// are always kept.
pub fn collect_files(
    paths: &[PathBuf],
    extension: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
                let entry = entry
                    .with_context(|| format!("Failed to read directory entry in {}", path.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let matches = extension
                    .is_none_or(|ext| entry.path().extension().and_then(|s| s.to_str()) == Some(ext));
                if matches {
                    files.push(entry.into_path());
                }
            }
        } else {
            // Missing files are reported as failed loads, not here.
            files.push(path.clone());
        }
    }

    Ok(files)
}

/// Outcome of a `load` run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
    pub bytes: u64,
    pub elapsed_ms: u128,
    pub scheduler: StatsSnapshot,
    pub cache: CacheStats,
}

impl LoadReport {
    #[inline]
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Load every file through `cache`, lending this thread to `pool` until all
/// listeners have fired.
pub fn load_files(
    pool: &PoolHandle,
    cache: &FileCache,
    files: &[PathBuf],
) -> Result<LoadReport> {
    let started = Instant::now();
    let remaining = Arc::new(AtomicUsize::new(files.len()));
    let loaded = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let any_failed = Arc::new(AtomicBool::new(false));
    let bytes = Arc::new(AtomicU64::new(0));

    for path in files {
        let identifier = match cache.register(path) {
            Ok(identifier) => identifier,
            Err(err) => {
                error!(path = %path.display(), %err, "cannot register file");
                any_failed.store(true, Ordering::Release);
                failed.fetch_add(1, Ordering::Relaxed);
                remaining.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
        };

        let listener = {
            let remaining = remaining.clone();
            let loaded = loaded.clone();
            let failed = failed.clone();
            let any_failed = any_failed.clone();
            let bytes = bytes.clone();
            move |_: Identifier, outcome: LoadOutcome<Vec<u8>>| {
                match outcome {
                    LoadOutcome::Loaded(payload) => {
                        bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
                        loaded.fetch_add(1, Ordering::Relaxed);
                    }
                    LoadOutcome::Failed => {
                        any_failed.store(true, Ordering::Release);
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                remaining.fetch_sub(1, Ordering::AcqRel);
            }
        };

        let batch = cache
            .cache()
            .try_load(identifier, ListenerId::unique(), listener)
            .with_context(|| format!("Failed to request {}", path.display()))?;
        pool.queue_batch(batch)
            .with_context(|| format!("Failed to queue load of {}", path.display()))?;
    }

    pool.run_until(|| remaining.load(Ordering::Acquire) == 0);

    let report = LoadReport {
        requested: files.len(),
        loaded: loaded.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        bytes: bytes.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
        scheduler: pool.stats().snapshot(),
        cache: cache.cache().stats(),
    };
    if any_failed.load(Ordering::Acquire) {
        warn!(failed = report.failed, "some loads failed");
    } else {
        info!(loaded = report.loaded, bytes = report.bytes, "all loads finished");
    }
    Ok(report)
}
