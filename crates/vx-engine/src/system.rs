//! Audio System
//!
//! Main-thread facade. Owns the voice records, the sound file cache and the
//! emitter handles; everything else happens on the control thread, reached
//! through the command queue. Nothing here blocks on the other threads.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vx_audio::{DeviceBackend, DeviceInfo, NullBackend, StreamParams, open_backend};
use vx_core::{
    AudioSystemConfig, EmitterHandle, EntityManager, SoundFileHandle, VoiceHandle, VoiceKind,
};
use vx_file::{LoadMode, SoundFileManager, SoundFileState};

use crate::control::spawn_control_thread;
use crate::decode::DecodeWorker;
use crate::emitter::{EmitterManager, Vec3};
use crate::mixer::{MAX_SOURCE_CHANNELS, MixerHome, SharedVoiceState, VoiceMixer, mixer_callback};
use crate::queue::{CommandReceiver, CommandSender, command_queue};
use crate::voice_manager::{ControlCommand, VoiceInitParams, VoiceManager, VoiceNotification};
use crate::{EngineError, EngineResult};

/// Voice lifecycle as seen by the main thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Stopped,
    Playing,
    Pausing,
    Paused,
    Stopping,
    HasError,
}

/// Where the voice currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayingState {
    NotPlaying,
    PlayingReal,
    PlayingVirtual,
    Suspended,
}

#[derive(Debug)]
struct VoiceRecord {
    handle: VoiceHandle,
    params: VoiceInitParams,
    state: VoiceState,
    playing: PlayingState,
    /// Data slot last reported by the control thread
    slot: Option<usize>,
    /// Play not sent yet; the sound file is still loading
    pending: bool,
    holds_sound_ref: bool,
}

pub struct AudioSystem {
    config: AudioSystemConfig,
    voice_handles: EntityManager<VoiceKind>,
    voices: Vec<Option<VoiceRecord>>,
    pending_plays: Vec<VoiceHandle>,
    emitters: EmitterManager,
    sound_files: SoundFileManager,
    commands: CommandSender<ControlCommand>,
    notifications: CommandReceiver<VoiceNotification>,
    shared: Arc<SharedVoiceState>,
    backend: Option<Box<dyn DeviceBackend>>,
    device_info: Option<DeviceInfo>,
    running: Arc<AtomicBool>,
    control_thread: Option<JoinHandle<()>>,
    decode: Option<DecodeWorker>,
}

impl AudioSystem {
    /// Start on the configured output device, falling back to silent output
    pub fn new(config: AudioSystemConfig) -> EngineResult<Self> {
        Self::start(config, true)
    }

    /// Start on the silent timer-driven device
    pub fn with_null_device(config: AudioSystemConfig) -> EngineResult<Self> {
        Self::start(config, false)
    }

    fn start(config: AudioSystemConfig, platform_device: bool) -> EngineResult<Self> {
        config.validate()?;

        let shared = Arc::new(SharedVoiceState::new(config.total_voice_slots()));
        let (mixer, link) = VoiceMixer::new(
            config.max_voices,
            config.block_size_frames,
            Arc::clone(&shared),
        );
        let home: MixerHome = Arc::new(Mutex::new(Some(mixer)));

        let backend: Box<dyn DeviceBackend> = if platform_device {
            open_backend(config.device_index, config.block_size_frames, || {
                mixer_callback(&home)
            })
        } else {
            let mut null = NullBackend::new();
            null.initialize()?;
            null.create_stream(StreamParams {
                device_index: None,
                block_size_frames: config.block_size_frames,
                callback: mixer_callback(&home),
            })?;
            Box::new(null)
        };
        let device_info = backend.stream_info().cloned();
        if let Some(info) = &device_info {
            log::info!(
                "Audio output via {}: {} ({} ch @ {} Hz)",
                backend.name(),
                info.name,
                info.channels,
                info.frame_rate
            );
        }

        let (commands, command_rx) = command_queue(config.command_queue_capacity);
        let (notification_tx, notifications) = command_queue(config.command_queue_capacity);

        let decode = DecodeWorker::spawn()?;
        let mut voices = VoiceManager::new(&config, Arc::clone(&shared), link, notification_tx);
        voices.set_stream_jobs(decode.job_sender());

        let running = Arc::new(AtomicBool::new(true));
        let control_thread = spawn_control_thread(
            voices,
            command_rx,
            Arc::clone(&shared),
            Duration::from_millis(config.control_tick_ms),
            Arc::clone(&running),
        );

        let mut system = Self {
            voice_handles: EntityManager::new(config.min_free_handles),
            voices: Vec::new(),
            pending_plays: Vec::new(),
            emitters: EmitterManager::new(config.min_free_handles),
            sound_files: SoundFileManager::new(config.sound_file_cache.clone()),
            commands,
            notifications,
            shared,
            backend: Some(backend),
            device_info,
            running,
            control_thread: None,
            decode: Some(decode),
            config,
        };
        // Dropping `system` on any error below tears the rest down
        system.control_thread = Some(control_thread?);
        if let Some(backend) = system.backend.as_mut() {
            backend.start_stream()?;
        }

        log::info!(
            "Audio system started: {} real / {} virtual voices",
            system.config.max_voices,
            system.config.max_virtual_voices
        );
        Ok(system)
    }

    pub fn config(&self) -> &AudioSystemConfig {
        &self.config
    }

    /// Device the output stream runs on
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::ShutDown)
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SOUND FILES
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn load_sound_file(
        &mut self,
        path: impl AsRef<Path>,
        mode: LoadMode,
    ) -> EngineResult<SoundFileHandle> {
        Ok(self.sound_files.load_sound_file(path, mode)?)
    }

    pub fn stream_sound_file(&mut self, path: impl AsRef<Path>) -> EngineResult<SoundFileHandle> {
        Ok(self.sound_files.stream_sound_file(path)?)
    }

    pub fn release_sound_file(&mut self, handle: SoundFileHandle) -> bool {
        self.sound_files.release_sound_file(handle)
    }

    pub fn sound_file_state(&self, handle: SoundFileHandle) -> Option<SoundFileState> {
        self.sound_files.state(handle)
    }

    pub fn sound_files(&self) -> &SoundFileManager {
        &self.sound_files
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EMITTERS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn create_emitter(&mut self) -> EmitterHandle {
        self.emitters.create_emitter()
    }

    pub fn release_emitter(&mut self, emitter: EmitterHandle) -> bool {
        if !self.emitters.release_emitter(emitter) {
            return false;
        }
        self.commands.send(ControlCommand::ReleaseEmitter { emitter });
        true
    }

    pub fn set_emitter_position(&mut self, emitter: EmitterHandle, position: Vec3) -> EngineResult<()> {
        if !self.emitters.is_valid(emitter) {
            return Err(EngineError::InvalidEmitter);
        }
        self.commands
            .send(ControlCommand::SetEmitterPosition { emitter, position });
        Ok(())
    }

    pub fn set_listener_position(&mut self, position: Vec3) {
        self.commands
            .send(ControlCommand::SetListenerPosition { position });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // VOICES
    // ═══════════════════════════════════════════════════════════════════════════

    fn record(&self, handle: VoiceHandle) -> Option<&VoiceRecord> {
        if !self.voice_handles.is_valid(handle) {
            return None;
        }
        self.voices.get(handle.index() as usize)?.as_ref()
    }

    fn record_mut(&mut self, handle: VoiceHandle) -> EngineResult<&mut VoiceRecord> {
        if !self.voice_handles.is_valid(handle) {
            return Err(EngineError::InvalidVoice);
        }
        self.voices
            .get_mut(handle.index() as usize)
            .and_then(|record| record.as_mut())
            .ok_or(EngineError::InvalidVoice)
    }

    /// Start a voice; the control thread decides where it plays
    pub fn play_voice(&mut self, params: VoiceInitParams) -> EngineResult<VoiceHandle> {
        self.ensure_running()?;

        let state = self
            .sound_files
            .state(params.sound_file)
            .ok_or_else(|| EngineError::InvalidSoundFile("unknown sound file handle".into()))?;
        if state == SoundFileState::HasError {
            let path = self
                .sound_files
                .path(params.sound_file)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(EngineError::InvalidSoundFile(path));
        }
        if let Some(description) = self.sound_files.description(params.sound_file) {
            let channels = description.num_channels;
            if channels == 0 || channels > MAX_SOURCE_CHANNELS {
                return Err(EngineError::UnsupportedChannelCount(channels));
            }
        }
        if let Some(emitter) = params.emitter {
            if !self.emitters.is_valid(emitter) {
                return Err(EngineError::InvalidEmitter);
            }
        }

        let handle = self.voice_handles.create();
        if handle.is_invalid() {
            return Err(EngineError::HandlesExhausted);
        }
        self.sound_files.add_reference(params.sound_file);

        let index = handle.index() as usize;
        if self.voices.len() <= index {
            self.voices.resize_with(index + 1, || None);
        }
        self.voices[index] = Some(VoiceRecord {
            handle,
            params,
            state: VoiceState::Playing,
            playing: PlayingState::NotPlaying,
            slot: None,
            pending: state == SoundFileState::Loading,
            holds_sound_ref: true,
        });

        if state == SoundFileState::Loading {
            self.pending_plays.push(handle);
        } else {
            self.send_play(handle);
        }
        log::trace!("Play voice {:?}", handle);
        Ok(handle)
    }

    fn send_play(&mut self, handle: VoiceHandle) {
        let Some(record) = self.record(handle) else {
            return;
        };
        let params = record.params;
        let paused = record.state == VoiceState::Paused;

        match self.sound_files.source(params.sound_file) {
            Some(source) => {
                self.commands.send(ControlCommand::Play {
                    handle,
                    params,
                    source,
                });
                if paused {
                    self.commands.send(ControlCommand::Pause {
                        handle,
                        fade_time: 0.0,
                    });
                }
            }
            None => self.fail_voice(handle),
        }
    }

    fn fail_voice(&mut self, handle: VoiceHandle) {
        let mut release_ref = None;
        if let Ok(record) = self.record_mut(handle) {
            log::warn!("Voice {:?} cannot play: sound file unavailable", handle);
            record.state = VoiceState::HasError;
            record.playing = PlayingState::NotPlaying;
            if record.holds_sound_ref {
                record.holds_sound_ref = false;
                release_ref = Some(record.params.sound_file);
            }
        }
        if let Some(sound_file) = release_ref {
            self.sound_files.release_sound_file(sound_file);
        }
    }

    /// Drop the record, its sound file reference and its handle
    fn release_voice(&mut self, handle: VoiceHandle) {
        if !self.voice_handles.is_valid(handle) {
            return;
        }
        let Some(record) = self
            .voices
            .get_mut(handle.index() as usize)
            .and_then(|r| r.take())
        else {
            return;
        };
        if record.holds_sound_ref {
            self.sound_files.release_sound_file(record.params.sound_file);
        }
        self.pending_plays.retain(|&h| h != handle);
        self.voice_handles.release(record.handle);
    }

    /// Skip the control thread: the voice holds no slot there
    fn is_detached(record: &VoiceRecord) -> bool {
        record.pending
            || matches!(record.playing, PlayingState::Suspended)
            || record.state == VoiceState::HasError
    }

    pub fn pause_voice(&mut self, handle: VoiceHandle, fade_time: f64) -> EngineResult<()> {
        let record = self.record_mut(handle)?;
        if record.state != VoiceState::Playing {
            return Ok(());
        }
        if Self::is_detached(record) {
            record.state = VoiceState::Paused;
            return Ok(());
        }
        record.state = VoiceState::Pausing;
        self.commands.send(ControlCommand::Pause { handle, fade_time });
        Ok(())
    }

    pub fn resume_voice(&mut self, handle: VoiceHandle, fade_time: f64) -> EngineResult<()> {
        let record = self.record_mut(handle)?;
        if !matches!(record.state, VoiceState::Paused | VoiceState::Pausing) {
            return Ok(());
        }
        record.state = VoiceState::Playing;
        if !Self::is_detached(record) {
            self.commands.send(ControlCommand::Resume { handle, fade_time });
        }
        Ok(())
    }

    /// Stop a voice; its handle is released once the control thread reports `Done`
    pub fn stop_voice(&mut self, handle: VoiceHandle, fade_time: f64) -> EngineResult<()> {
        let record = self.record_mut(handle)?;
        if matches!(record.state, VoiceState::Stopping | VoiceState::Stopped) {
            return Ok(());
        }
        if Self::is_detached(record) {
            self.release_voice(handle);
            return Ok(());
        }
        record.state = VoiceState::Stopping;
        self.commands.send(ControlCommand::Stop { handle, fade_time });
        Ok(())
    }

    pub fn set_volume_scale(&mut self, handle: VoiceHandle, value: f32, ramp_time: f64) -> EngineResult<()> {
        let record = self.record_mut(handle)?;
        record.params.volume_scale = value;
        record.params.volume_scale_ramp_time = ramp_time;
        self.commands.send(ControlCommand::SetVolumeScale {
            handle,
            value,
            ramp_time,
        });
        Ok(())
    }

    pub fn set_pitch_scale(&mut self, handle: VoiceHandle, value: f32, ramp_time: f64) -> EngineResult<()> {
        let record = self.record_mut(handle)?;
        record.params.pitch_scale = value;
        record.params.pitch_scale_ramp_time = ramp_time;
        self.commands.send(ControlCommand::SetPitchScale {
            handle,
            value,
            ramp_time,
        });
        Ok(())
    }

    /// Attach a voice to an emitter (`None` detaches it)
    pub fn set_voice_emitter(
        &mut self,
        handle: VoiceHandle,
        emitter: Option<EmitterHandle>,
    ) -> EngineResult<()> {
        if let Some(emitter) = emitter {
            if !self.emitters.is_valid(emitter) {
                return Err(EngineError::InvalidEmitter);
            }
        }
        let record = self.record_mut(handle)?;
        record.params.emitter = emitter;
        self.commands
            .send(ControlCommand::SetEmitter { handle, emitter });
        Ok(())
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.shared.set_master_gain(gain);
    }

    pub fn master_gain(&self) -> f32 {
        self.shared.master_gain()
    }

    /// `Stopped` for handles that are no longer valid
    pub fn voice_state(&self, handle: VoiceHandle) -> VoiceState {
        self.record(handle).map_or(VoiceState::Stopped, |r| r.state)
    }

    pub fn playing_state(&self, handle: VoiceHandle) -> PlayingState {
        self.record(handle)
            .map_or(PlayingState::NotPlaying, |r| r.playing)
    }

    fn live_slot(&self, handle: VoiceHandle) -> Option<usize> {
        let record = self.record(handle)?;
        match record.playing {
            PlayingState::PlayingReal | PlayingState::PlayingVirtual => record.slot,
            PlayingState::NotPlaying | PlayingState::Suspended => None,
        }
    }

    /// Last published volume product
    pub fn volume_product(&self, handle: VoiceHandle) -> Option<f32> {
        self.live_slot(handle).map(|slot| self.shared.volume(slot))
    }

    /// Last published pitch product
    pub fn pitch_product(&self, handle: VoiceHandle) -> Option<f32> {
        self.live_slot(handle).map(|slot| self.shared.pitch(slot))
    }

    pub fn real_voice_count(&self) -> usize {
        self.shared.real_voice_count()
    }

    pub fn virtual_voice_count(&self) -> usize {
        self.shared.virtual_voice_count()
    }

    /// Voice handles currently held by the main thread
    pub fn voice_count(&self) -> usize {
        self.voice_handles.len()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // UPDATE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Apply control-thread notifications and tick the sound file cache
    ///
    /// Returns the notifications applied, oldest first.
    pub fn update(&mut self, dt: f64) -> Vec<VoiceNotification> {
        let notifications: Vec<VoiceNotification> = self.notifications.drain().collect();
        for &notification in &notifications {
            self.apply_notification(notification);
        }

        self.sound_files.update(dt);
        self.flush_pending_plays();
        notifications
    }

    fn apply_notification(&mut self, notification: VoiceNotification) {
        match notification {
            VoiceNotification::Real { handle, slot } => {
                if let Ok(record) = self.record_mut(handle) {
                    record.playing = PlayingState::PlayingReal;
                    record.slot = Some(slot);
                }
            }
            VoiceNotification::Virtual { handle, slot } => {
                if let Ok(record) = self.record_mut(handle) {
                    record.playing = PlayingState::PlayingVirtual;
                    record.slot = Some(slot);
                }
            }
            VoiceNotification::Suspended { handle } => {
                let Ok(record) = self.record_mut(handle) else {
                    return;
                };
                if record.state == VoiceState::Stopping {
                    self.release_voice(handle);
                } else {
                    record.playing = PlayingState::Suspended;
                    record.slot = None;
                }
            }
            VoiceNotification::Paused { handle } => {
                if let Ok(record) = self.record_mut(handle) {
                    if record.state == VoiceState::Pausing {
                        record.state = VoiceState::Paused;
                    }
                }
            }
            VoiceNotification::Done { handle } => self.release_voice(handle),
        }
    }

    fn flush_pending_plays(&mut self) {
        if self.pending_plays.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.pending_plays);
        for handle in pending {
            let Some(record) = self.record(handle) else {
                continue;
            };
            match self.sound_files.state(record.params.sound_file) {
                Some(SoundFileState::Loading) => self.pending_plays.push(handle),
                Some(SoundFileState::Loaded | SoundFileState::Streaming) => {
                    if let Ok(record) = self.record_mut(handle) {
                        record.pending = false;
                    }
                    self.send_play(handle);
                }
                Some(SoundFileState::HasError) | None => {
                    if let Ok(record) = self.record_mut(handle) {
                        record.pending = false;
                    }
                    self.fail_voice(handle);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SHUTDOWN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stop the stream and the worker threads
    ///
    /// Waits up to `shutdown_timeout_ms` for the threads; a thread that does
    /// not exit in time is logged and left behind.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.shutdown_stream() {
                log::warn!("Failed to shut down output stream: {}", e);
            }
        }
        if let Some(decode) = self.decode.as_ref() {
            decode.signal_shutdown();
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        join_before("vx-control", self.control_thread.take(), deadline);
        join_before(
            "vx-decode",
            self.decode.as_mut().and_then(|d| d.take_thread()),
            deadline,
        );

        self.sound_files.flush_all_unreferenced();
        log::info!("Audio system shut down");
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_before(name: &str, thread: Option<JoinHandle<()>>, deadline: Instant) {
    let Some(thread) = thread else {
        return;
    };
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            log::error!("Timed out waiting for the {} thread; leaving it behind", name);
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    if thread.join().is_err() {
        log::error!("The {} thread panicked", name);
    }
}
