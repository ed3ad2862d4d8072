//! Sound file cache
//!
//! Owned by the main thread. Every path is decoded (or, for streamed files,
//! header-parsed) at most once; repeat requests share the entry and bump its
//! reference count. Entries nobody references age on `update` and are flushed
//! once idle past the configured threshold, or earlier when the cache is over
//! its memory budget.
//!
//! ```text
//!   load_sound_file ──▶ Loading ──▶ Loaded ──┐
//!          │                │                ├──▶ (flushed)
//!          │                └─▶ HasError ────┘
//!   stream_sound_file ─────────▶ Streaming ──┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use vx_core::{EntityManager, SoundFileCacheConfig, SoundFileHandle, SoundFileKind};

use crate::reader::{SoundFileData, SoundFileDescription, load_sound_file_data, open_reader};
use crate::{FileError, FileResult};

/// How `load_sound_file` decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Decode before returning
    Sync,
    /// Decode on the loader thread; the entry stays `Loading` until `update`
    Async,
}

/// Cache entry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundFileState {
    Loading,
    Loaded,
    Streaming,
    HasError,
}

/// Where a voice gets its samples
#[derive(Debug, Clone)]
pub enum SoundSource {
    /// Decoded in memory
    Loaded(Arc<SoundFileData>),
    /// Decoded on demand from disk
    Streamed {
        path: PathBuf,
        description: SoundFileDescription,
    },
}

impl SoundSource {
    pub fn description(&self) -> &SoundFileDescription {
        match self {
            Self::Loaded(data) => &data.description,
            Self::Streamed { description, .. } => description,
        }
    }
}

#[derive(Debug)]
struct SoundFileEntry {
    handle: SoundFileHandle,
    path: PathBuf,
    state: SoundFileState,
    source: Option<SoundSource>,
    ref_count: u32,
    idle_secs: f64,
    byte_size: usize,
}

impl SoundFileEntry {
    fn is_evictable(&self) -> bool {
        self.ref_count == 0 && self.state != SoundFileState::Loading
    }
}

struct LoadJob {
    handle: SoundFileHandle,
    path: PathBuf,
}

struct LoadResult {
    handle: SoundFileHandle,
    result: FileResult<SoundFileData>,
}

/// Async load worker
struct Loader {
    jobs: Sender<LoadJob>,
    results: Receiver<LoadResult>,
    thread: JoinHandle<()>,
}

impl Loader {
    fn spawn() -> FileResult<Self> {
        let (jobs, job_rx) = unbounded::<LoadJob>();
        let (result_tx, results) = unbounded::<LoadResult>();

        let thread = std::thread::Builder::new()
            .name("vx-loader".into())
            .spawn(move || {
                // Exits once the manager drops its job sender
                for job in job_rx.iter() {
                    let result = load_sound_file_data(&job.path);
                    if result_tx
                        .send(LoadResult {
                            handle: job.handle,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
            .map_err(|e| FileError::LoaderUnavailable(e.to_string()))?;

        Ok(Self {
            jobs,
            results,
            thread,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOUND FILE MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SoundFileManager {
    config: SoundFileCacheConfig,
    handles: EntityManager<SoundFileKind>,
    /// Entries indexed by handle index
    entries: Vec<Option<SoundFileEntry>>,
    loaded_paths: HashMap<PathBuf, SoundFileHandle>,
    streamed_paths: HashMap<PathBuf, SoundFileHandle>,
    memory_usage: usize,
    loader: Option<Loader>,
    budget_warned: bool,
}

impl SoundFileManager {
    pub fn new(config: SoundFileCacheConfig) -> Self {
        Self {
            config,
            handles: EntityManager::new(0),
            entries: Vec::new(),
            loaded_paths: HashMap::new(),
            streamed_paths: HashMap::new(),
            memory_usage: 0,
            loader: None,
            budget_warned: false,
        }
    }

    pub fn config(&self) -> &SoundFileCacheConfig {
        &self.config
    }

    fn entry(&self, handle: SoundFileHandle) -> Option<&SoundFileEntry> {
        if !self.handles.is_valid(handle) {
            return None;
        }
        self.entries
            .get(handle.index() as usize)
            .and_then(|e| e.as_ref())
    }

    fn entry_mut(&mut self, handle: SoundFileHandle) -> Option<&mut SoundFileEntry> {
        if !self.handles.is_valid(handle) {
            return None;
        }
        self.entries
            .get_mut(handle.index() as usize)
            .and_then(|e| e.as_mut())
    }

    fn insert_entry(&mut self, mut entry: SoundFileEntry) -> FileResult<SoundFileHandle> {
        let handle = self.handles.create();
        if handle.is_invalid() {
            return Err(FileError::InvalidHandle);
        }
        entry.handle = handle;
        let index = handle.index() as usize;
        if self.entries.len() <= index {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index] = Some(entry);
        Ok(handle)
    }

    /// Bump the reference of an existing entry for a repeat request
    fn reuse(&mut self, handle: SoundFileHandle) -> Option<SoundFileHandle> {
        let entry = self.entry_mut(handle)?;
        entry.ref_count += 1;
        entry.idle_secs = 0.0;
        Some(handle)
    }

    /// Load (decode) a file into memory
    ///
    /// The returned handle carries one reference.
    pub fn load_sound_file(
        &mut self,
        path: impl AsRef<Path>,
        mode: LoadMode,
    ) -> FileResult<SoundFileHandle> {
        let path = path.as_ref().to_path_buf();
        if let Some(&handle) = self.loaded_paths.get(&path) {
            if let Some(handle) = self.reuse(handle) {
                return Ok(handle);
            }
        }

        match mode {
            LoadMode::Sync => {
                let data = load_sound_file_data(&path)?;
                let byte_size = data.byte_size();
                let handle = self.insert_entry(SoundFileEntry {
                    handle: SoundFileHandle::INVALID,
                    path: path.clone(),
                    state: SoundFileState::Loaded,
                    source: Some(SoundSource::Loaded(Arc::new(data))),
                    ref_count: 1,
                    idle_secs: 0.0,
                    byte_size,
                })?;
                self.memory_usage += byte_size;
                log::debug!("Loaded {} ({} bytes)", path.display(), byte_size);
                self.loaded_paths.insert(path, handle);
                Ok(handle)
            }
            LoadMode::Async => {
                if self.loader.is_none() {
                    self.loader = Some(Loader::spawn()?);
                }
                let handle = self.insert_entry(SoundFileEntry {
                    handle: SoundFileHandle::INVALID,
                    path: path.clone(),
                    state: SoundFileState::Loading,
                    source: None,
                    ref_count: 1,
                    idle_secs: 0.0,
                    byte_size: 0,
                })?;

                let queued = self.loader.as_ref().is_some_and(|loader| {
                    loader
                        .jobs
                        .send(LoadJob {
                            handle,
                            path: path.clone(),
                        })
                        .is_ok()
                });
                if !queued {
                    self.remove_entry(handle);
                    return Err(FileError::LoaderUnavailable("loader thread exited".into()));
                }

                self.loaded_paths.insert(path, handle);
                Ok(handle)
            }
        }
    }

    /// Register a file for streaming, parsing only its header
    ///
    /// The returned handle carries one reference.
    pub fn stream_sound_file(&mut self, path: impl AsRef<Path>) -> FileResult<SoundFileHandle> {
        let path = path.as_ref().to_path_buf();
        if let Some(&handle) = self.streamed_paths.get(&path) {
            if let Some(handle) = self.reuse(handle) {
                return Ok(handle);
            }
        }

        let description = open_reader(&path)?.description().clone();
        let handle = self.insert_entry(SoundFileEntry {
            handle: SoundFileHandle::INVALID,
            path: path.clone(),
            state: SoundFileState::Streaming,
            source: Some(SoundSource::Streamed {
                path: path.clone(),
                description,
            }),
            ref_count: 1,
            idle_secs: 0.0,
            byte_size: 0,
        })?;
        log::debug!("Streaming {}", path.display());
        self.streamed_paths.insert(path, handle);
        Ok(handle)
    }

    /// Take another reference on an entry
    pub fn add_reference(&mut self, handle: SoundFileHandle) -> bool {
        self.reuse(handle).is_some()
    }

    /// Drop one reference; the entry becomes evictable at zero
    pub fn release_sound_file(&mut self, handle: SoundFileHandle) -> bool {
        match self.entry_mut(handle) {
            Some(entry) => {
                debug_assert!(entry.ref_count > 0, "sound file released more than referenced");
                entry.ref_count = entry.ref_count.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn is_valid(&self, handle: SoundFileHandle) -> bool {
        self.entry(handle).is_some()
    }

    pub fn state(&self, handle: SoundFileHandle) -> Option<SoundFileState> {
        self.entry(handle).map(|e| e.state)
    }

    pub fn description(&self, handle: SoundFileHandle) -> Option<SoundFileDescription> {
        self.entry(handle)
            .and_then(|e| e.source.as_ref())
            .map(|s| s.description().clone())
    }

    /// Sample source for a loaded or streamed entry
    pub fn source(&self, handle: SoundFileHandle) -> Option<SoundSource> {
        self.entry(handle).and_then(|e| e.source.clone())
    }

    pub fn path(&self, handle: SoundFileHandle) -> Option<&Path> {
        self.entry(handle).map(|e| e.path.as_path())
    }

    pub fn ref_count(&self, handle: SoundFileHandle) -> u32 {
        self.entry(handle).map_or(0, |e| e.ref_count)
    }

    /// Bytes of decoded audio held by the cache
    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub fn num_entries(&self) -> usize {
        self.handles.len()
    }

    fn remove_entry(&mut self, handle: SoundFileHandle) {
        let Some(entry) = self
            .entries
            .get_mut(handle.index() as usize)
            .and_then(|e| e.take())
        else {
            return;
        };

        let paths = if entry.state == SoundFileState::Streaming {
            &mut self.streamed_paths
        } else {
            &mut self.loaded_paths
        };
        if paths.get(&entry.path) == Some(&handle) {
            paths.remove(&entry.path);
        }

        self.memory_usage = self.memory_usage.saturating_sub(entry.byte_size);
        self.handles.release(handle);
    }

    fn collect_load_results(&mut self) {
        let Some(loader) = self.loader.as_ref() else {
            return;
        };
        let results: Vec<LoadResult> = loader.results.try_iter().collect();

        for LoadResult { handle, result } in results {
            let Some(entry) = self.entry_mut(handle) else {
                continue;
            };
            match result {
                Ok(data) => {
                    let byte_size = data.byte_size();
                    entry.state = SoundFileState::Loaded;
                    entry.byte_size = byte_size;
                    entry.source = Some(SoundSource::Loaded(Arc::new(data)));
                    log::debug!("Loaded {} ({} bytes)", entry.path.display(), byte_size);
                    self.memory_usage += byte_size;
                }
                Err(e) => {
                    log::error!("Failed to load {}: {}", entry.path.display(), e);
                    entry.state = SoundFileState::HasError;
                }
            }
        }
    }

    /// Per-frame maintenance: finish async loads, age and flush entries
    pub fn update(&mut self, dt: f64) {
        self.collect_load_results();

        let mut expired = Vec::new();
        for (index, slot) in self.entries.iter_mut().enumerate() {
            let Some(entry) = slot.as_mut() else {
                continue;
            };
            if !entry.is_evictable() {
                continue;
            }
            entry.idle_secs += dt;
            if entry.idle_secs > self.config.flush_time_threshold_secs {
                expired.push(index);
            }
        }
        for index in expired {
            if let Some(handle) = self.handle_at(index) {
                log::debug!("Flushing idle sound file {:?}", handle);
                self.remove_entry(handle);
            }
        }

        self.enforce_memory_budget();
    }

    fn handle_at(&self, index: usize) -> Option<SoundFileHandle> {
        self.entries.get(index)?.as_ref().map(|e| e.handle)
    }

    fn enforce_memory_budget(&mut self) {
        let limit = self.config.target_memory_limit_bytes;
        if self.memory_usage <= limit {
            self.budget_warned = false;
            return;
        }

        // Oldest idle first
        let mut candidates: Vec<(usize, f64)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.as_ref()?;
                (entry.is_evictable() && entry.byte_size > 0).then_some((index, entry.idle_secs))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (index, _) in candidates {
            if self.memory_usage <= limit {
                break;
            }
            if let Some(handle) = self.handle_at(index) {
                log::debug!("Evicting sound file {:?} over memory budget", handle);
                self.remove_entry(handle);
            }
        }

        if self.memory_usage > limit && !self.budget_warned {
            log::warn!(
                "Sound file cache over budget: {} bytes in use, limit {} (all remaining entries referenced)",
                self.memory_usage,
                limit
            );
            self.budget_warned = true;
        }
    }

    /// Drop every entry nobody references
    pub fn flush_all_unreferenced(&mut self) {
        let indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|e| e.is_evictable()))
            .map(|(index, _)| index)
            .collect();

        for index in indices {
            if let Some(handle) = self.handle_at(index) {
                self.remove_entry(handle);
            }
        }
    }
}

impl Drop for SoundFileManager {
    fn drop(&mut self) {
        if let Some(Loader { jobs, thread, .. }) = self.loader.take() {
            drop(jobs);
            if thread.join().is_err() {
                log::error!("Sound file loader thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(dir: &Path, name: &str, frames: usize) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 100) as i16 * 100).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_dedup_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", 100);
        let mut manager = SoundFileManager::new(SoundFileCacheConfig::default());

        let a = manager.load_sound_file(&path, LoadMode::Sync).unwrap();
        let b = manager.load_sound_file(&path, LoadMode::Sync).unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.ref_count(a), 2);
        assert_eq!(manager.num_entries(), 1);
        assert_eq!(manager.memory_usage(), 100 * 4);

        // Streaming the same path is a separate entry
        let s = manager.stream_sound_file(&path).unwrap();
        assert_ne!(a, s);
        assert_eq!(manager.state(s), Some(SoundFileState::Streaming));
        assert_eq!(manager.description(s).unwrap().num_frames, 100);
    }

    #[test]
    fn test_idle_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "a.wav", 10);
        let mut manager = SoundFileManager::new(SoundFileCacheConfig {
            flush_time_threshold_secs: 1.0,
            ..Default::default()
        });

        let handle = manager.load_sound_file(&path, LoadMode::Sync).unwrap();
        manager.update(5.0);
        assert!(manager.is_valid(handle), "referenced entries never age");

        manager.release_sound_file(handle);
        manager.update(0.6);
        assert!(manager.is_valid(handle));
        manager.update(0.6);
        assert!(!manager.is_valid(handle));
        assert_eq!(manager.memory_usage(), 0);
        assert_eq!(manager.num_entries(), 0);
    }

    #[test]
    fn test_failed_sync_load_leaves_no_entry() {
        let mut manager = SoundFileManager::new(SoundFileCacheConfig::default());
        assert!(manager
            .load_sound_file("/nonexistent/x.wav", LoadMode::Sync)
            .is_err());
        assert_eq!(manager.num_entries(), 0);
    }
}
