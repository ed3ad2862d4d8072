//! Voice Manager
//!
//! Owned by the control thread. Every live voice holds a data slot shared
//! with the pitch and volume managers; its class says whether the mixer
//! renders it (real) or only its position is tracked (virtual). Voices that
//! lose out entirely are suspended: they keep their handle on the main
//! thread but hold no slot.
//!
//! ```text
//!   Play ──▶ admission ──▶ Real ◀──── rebalancing ────▶ Virtual
//!                │                                        │
//!                └──────────────▶ Suspended ◀── stolen ───┘
//! ```
//!
//! Admission compares `priority * initial volume product` against the
//! weakest voice of each class; rebalancing runs every tick over the
//! priority-sorted list from the volume manager.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use rtrb::{PushError, RingBuffer};

use vx_core::{AudioSystemConfig, EmitterHandle, SoundFileHandle, VoiceHandle};
use vx_file::{MemoryReader, SeekMode, SoundFileDescription, SoundFileReader, SoundSource};

use crate::decode::{StreamFlags, StreamJob};
use crate::emitter::{EmitterTable, Vec3};
use crate::mixer::{
    MixerCommand, MixerEvent, MixerLink, RetireReason, SampleSource, SharedVoiceState,
    StreamSource, VoiceStart,
};
use crate::pitch::PitchManager;
use crate::queue::{CommandReceiver, CommandSender};
use crate::volume::{VolumeInit, VolumeManager};

/// Everything needed to start a voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceInitParams {
    pub sound_file: SoundFileHandle,
    /// Spatialized voices follow an emitter's distance attenuation
    pub emitter: Option<EmitterHandle>,
    pub baseline_volume: f32,
    pub volume_scale: f32,
    pub volume_scale_ramp_time: f64,
    pub baseline_pitch: f32,
    pub pitch_scale: f32,
    pub pitch_scale_ramp_time: f64,
    pub priority: f32,
    pub looping: bool,
    pub fade_in_time: f64,
}

impl VoiceInitParams {
    pub fn new(sound_file: SoundFileHandle) -> Self {
        Self {
            sound_file,
            emitter: None,
            baseline_volume: 1.0,
            volume_scale: 1.0,
            volume_scale_ramp_time: 0.0,
            baseline_pitch: 1.0,
            pitch_scale: 1.0,
            pitch_scale_ramp_time: 0.0,
            priority: 1.0,
            looping: false,
            fade_in_time: 0.0,
        }
    }

    fn volume_init(&self, attenuation: f32) -> VolumeInit {
        VolumeInit {
            baseline: self.baseline_volume,
            dynamic_scale: self.volume_scale,
            dynamic_ramp_time: self.volume_scale_ramp_time,
            attenuation,
            priority: self.priority,
            fade_in_time: self.fade_in_time,
        }
    }
}

/// Main thread → control thread
#[derive(Debug)]
pub enum ControlCommand {
    Play {
        handle: VoiceHandle,
        params: VoiceInitParams,
        source: SoundSource,
    },
    Pause {
        handle: VoiceHandle,
        fade_time: f64,
    },
    Resume {
        handle: VoiceHandle,
        fade_time: f64,
    },
    Stop {
        handle: VoiceHandle,
        fade_time: f64,
    },
    SetVolumeScale {
        handle: VoiceHandle,
        value: f32,
        ramp_time: f64,
    },
    SetPitchScale {
        handle: VoiceHandle,
        value: f32,
        ramp_time: f64,
    },
    SetEmitter {
        handle: VoiceHandle,
        emitter: Option<EmitterHandle>,
    },
    SetEmitterPosition {
        emitter: EmitterHandle,
        position: Vec3,
    },
    ReleaseEmitter {
        emitter: EmitterHandle,
    },
    SetListenerPosition {
        position: Vec3,
    },
}

/// Control thread → main thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceNotification {
    /// Now rendered by the mixer from data slot `slot`
    Real { handle: VoiceHandle, slot: usize },
    /// Now tracked silently in data slot `slot`
    Virtual { handle: VoiceHandle, slot: usize },
    /// Lost its slot; only the main thread still knows it
    Suspended { handle: VoiceHandle },
    /// A pause fade completed
    Paused { handle: VoiceHandle },
    /// Finished or stopped; the handle may be released
    Done { handle: VoiceHandle },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceClass {
    Real,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotLifecycle {
    Playing,
    Pausing,
    Paused,
    Stopping,
}

struct VoiceSlot {
    handle: VoiceHandle,
    source: SoundSource,
    description: SoundFileDescription,
    emitter: Option<EmitterHandle>,
    looping: bool,
    class: VoiceClass,
    lifecycle: SlotLifecycle,
    /// Playback position in source frames
    position: f64,
}

pub struct VoiceManager {
    max_voices: usize,
    max_virtual_voices: usize,
    slots: Vec<Option<VoiceSlot>>,
    free_slots: VecDeque<usize>,
    handle_to_slot: HashMap<VoiceHandle, usize>,
    num_real: usize,
    num_virtual: usize,
    pitch: PitchManager,
    volume: VolumeManager,
    emitters: EmitterTable,
    shared: Arc<SharedVoiceState>,
    mixer: MixerLink,
    /// Mixer commands the command ring had no room for
    backlog: VecDeque<MixerCommand>,
    backlog_warned: bool,
    stream_jobs: Option<Sender<StreamJob>>,
    stream_ring_frames: usize,
    notifications: CommandSender<VoiceNotification>,
    /// Scratch lists reused every tick
    to_release: Vec<usize>,
    to_pause: Vec<usize>,
    to_demote: Vec<usize>,
    to_promote: Vec<usize>,
}

impl VoiceManager {
    pub fn new(
        config: &AudioSystemConfig,
        shared: Arc<SharedVoiceState>,
        mixer: MixerLink,
        notifications: CommandSender<VoiceNotification>,
    ) -> Self {
        let num_slots = config.total_voice_slots();
        debug_assert_eq!(shared.num_slots(), num_slots);

        Self {
            max_voices: config.max_voices,
            max_virtual_voices: config.max_virtual_voices,
            slots: (0..num_slots).map(|_| None).collect(),
            free_slots: (0..num_slots).collect(),
            handle_to_slot: HashMap::with_capacity(num_slots),
            num_real: 0,
            num_virtual: 0,
            pitch: PitchManager::new(num_slots),
            volume: VolumeManager::new(num_slots),
            emitters: EmitterTable::new(config.attenuation.into()),
            shared,
            mixer,
            backlog: VecDeque::new(),
            backlog_warned: false,
            stream_jobs: None,
            stream_ring_frames: config.stream_ring_frames,
            notifications,
            to_release: Vec::new(),
            to_pause: Vec::new(),
            to_demote: Vec::new(),
            to_promote: Vec::new(),
        }
    }

    /// Where streamed voices send their decode jobs
    pub fn set_stream_jobs(&mut self, jobs: Sender<StreamJob>) {
        self.stream_jobs = Some(jobs);
    }

    pub fn real_voice_count(&self) -> usize {
        self.num_real
    }

    pub fn virtual_voice_count(&self) -> usize {
        self.num_virtual
    }

    /// Voices holding a data slot
    pub fn live_voice_count(&self) -> usize {
        self.handle_to_slot.len()
    }

    pub fn slot_of(&self, handle: VoiceHandle) -> Option<usize> {
        self.handle_to_slot.get(&handle).copied()
    }

    pub fn class_of(&self, handle: VoiceHandle) -> Option<VoiceClass> {
        let index = self.slot_of(handle)?;
        self.slots[index].as_ref().map(|slot| slot.class)
    }

    /// Playback position in source frames as of the last update
    pub fn position_of(&self, handle: VoiceHandle) -> Option<f64> {
        let index = self.slot_of(handle)?;
        self.slots[index].as_ref().map(|slot| slot.position)
    }

    pub fn volume_manager(&self) -> &VolumeManager {
        &self.volume
    }

    pub fn pitch_manager(&self) -> &PitchManager {
        &self.pitch
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COMMANDS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Apply everything queued by the main thread
    pub fn process_commands(&mut self, commands: &mut CommandReceiver<ControlCommand>, now: f64) {
        while let Some(command) = commands.pop() {
            self.handle_command(command, now);
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand, now: f64) {
        match command {
            ControlCommand::Play {
                handle,
                params,
                source,
            } => self.play(handle, params, source, now),
            ControlCommand::Pause { handle, fade_time } => self.pause(handle, fade_time, now),
            ControlCommand::Resume { handle, fade_time } => self.resume(handle, fade_time, now),
            ControlCommand::Stop { handle, fade_time } => self.stop(handle, fade_time, now),
            ControlCommand::SetVolumeScale {
                handle,
                value,
                ramp_time,
            } => {
                if let Some(index) = self.live_slot(handle) {
                    self.volume.set_dynamic_scale(index, value, ramp_time, now);
                }
            }
            ControlCommand::SetPitchScale {
                handle,
                value,
                ramp_time,
            } => {
                if let Some(index) = self.live_slot(handle) {
                    self.pitch.set_dynamic_scale(index, value, ramp_time, now);
                }
            }
            ControlCommand::SetEmitter { handle, emitter } => {
                if let Some(index) = self.live_slot(handle) {
                    if let Some(slot) = self.slots[index].as_mut() {
                        slot.emitter = emitter;
                    }
                    if emitter.is_none() {
                        self.volume.set_attenuation(index, 1.0);
                    }
                }
            }
            ControlCommand::SetEmitterPosition { emitter, position } => {
                self.emitters.set_position(emitter, position);
            }
            ControlCommand::ReleaseEmitter { emitter } => self.emitters.remove(emitter),
            ControlCommand::SetListenerPosition { position } => {
                self.emitters.set_listener(position);
            }
        }
    }

    fn live_slot(&self, handle: VoiceHandle) -> Option<usize> {
        let index = self.slot_of(handle);
        if index.is_none() {
            log::trace!("Ignoring command for voice {:?} without a slot", handle);
        }
        index
    }

    fn play(&mut self, handle: VoiceHandle, params: VoiceInitParams, source: SoundSource, now: f64) {
        if self.handle_to_slot.contains_key(&handle) {
            debug_assert!(false, "voice {handle:?} played twice");
            return;
        }

        let attenuation = params
            .emitter
            .map_or(1.0, |emitter| self.emitters.attenuation_for(emitter));
        let init = params.volume_init(attenuation);

        let Some(class) = self.admit(init.initial_weighted_priority()) else {
            log::debug!("Voice {:?} suspended on admission", handle);
            self.notify(VoiceNotification::Suspended { handle });
            return;
        };

        let Some(index) = self.free_slots.pop_front() else {
            debug_assert!(false, "admission granted without a free slot");
            self.notify(VoiceNotification::Suspended { handle });
            return;
        };

        self.pitch.initialize_entry(
            index,
            params.baseline_pitch,
            params.pitch_scale,
            params.pitch_scale_ramp_time,
            now,
        );
        self.volume.initialize_entry(index, init, now);
        self.shared.set_volume(index, self.volume.product(index));
        self.shared.set_pitch(index, self.pitch.product(index));

        let description = source.description().clone();
        self.slots[index] = Some(VoiceSlot {
            handle,
            source,
            description,
            emitter: params.emitter,
            looping: params.looping,
            class,
            lifecycle: SlotLifecycle::Playing,
            position: 0.0,
        });
        self.handle_to_slot.insert(handle, index);

        match class {
            VoiceClass::Real => {
                self.num_real += 1;
                if self.start_in_mixer(index) {
                    self.notify(VoiceNotification::Real {
                        handle,
                        slot: index,
                    });
                } else {
                    self.finish(index);
                }
            }
            VoiceClass::Virtual => {
                self.num_virtual += 1;
                self.notify(VoiceNotification::Virtual {
                    handle,
                    slot: index,
                });
            }
        }
        log::trace!("Voice {:?} admitted as {:?} in slot {}", handle, class, index);
    }

    /// Decide the class of a new voice, making room if it wins
    ///
    /// `None` means the new voice is suspended.
    fn admit(&mut self, weighted: f32) -> Option<VoiceClass> {
        if self.num_real < self.max_voices {
            return Some(VoiceClass::Real);
        }

        if let Some((lowest, lowest_weight)) = self.lowest_voice(VoiceClass::Real) {
            if weighted > lowest_weight {
                self.demote(lowest);
                return Some(VoiceClass::Real);
            }
        }

        if self.num_virtual < self.max_virtual_voices {
            return Some(VoiceClass::Virtual);
        }
        if self.max_virtual_voices == 0 {
            return None;
        }

        let (lowest, lowest_weight) = self.lowest_voice(VoiceClass::Virtual)?;
        if weighted > lowest_weight {
            self.suspend(lowest);
            Some(VoiceClass::Virtual)
        } else {
            None
        }
    }

    /// Move a stolen real voice out of the way
    fn demote(&mut self, index: usize) {
        if self.num_virtual < self.max_virtual_voices {
            self.make_virtual(index);
        } else if self.max_virtual_voices == 0 {
            self.suspend(index);
        } else {
            if let Some((lowest, _)) = self.lowest_voice(VoiceClass::Virtual) {
                self.suspend(lowest);
            }
            self.make_virtual(index);
        }
    }

    /// Weakest voice of a class; equal weights pick the highest slot
    fn lowest_voice(&self, class: VoiceClass) -> Option<(usize, f32)> {
        let mut lowest: Option<(usize, f32)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            if slot.class != class {
                continue;
            }
            let weight = self.volume.weighted_priority(index);
            if lowest.is_none_or(|(_, w)| weight <= w) {
                lowest = Some((index, weight));
            }
        }
        lowest
    }

    fn pause(&mut self, handle: VoiceHandle, fade_time: f64, now: f64) {
        let Some(index) = self.live_slot(handle) else {
            return;
        };
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        match slot.lifecycle {
            SlotLifecycle::Playing => {}
            SlotLifecycle::Pausing | SlotLifecycle::Paused | SlotLifecycle::Stopping => return,
        }

        if fade_time > 0.0 {
            slot.lifecycle = SlotLifecycle::Pausing;
            self.volume.start_fade(index, 0.0, fade_time, now);
        } else {
            self.volume.start_fade(index, 0.0, 0.0, now);
            self.enter_paused(index);
        }
    }

    fn enter_paused(&mut self, index: usize) {
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        slot.lifecycle = SlotLifecycle::Paused;
        let handle = slot.handle;
        if slot.class == VoiceClass::Real {
            self.backlog.push_back(MixerCommand::Pause { slot: index, handle });
        }
        self.notify(VoiceNotification::Paused { handle });
    }

    fn resume(&mut self, handle: VoiceHandle, fade_time: f64, now: f64) {
        let Some(index) = self.live_slot(handle) else {
            return;
        };
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        let was_paused = match slot.lifecycle {
            SlotLifecycle::Paused => true,
            SlotLifecycle::Pausing => false,
            SlotLifecycle::Playing | SlotLifecycle::Stopping => return,
        };

        slot.lifecycle = SlotLifecycle::Playing;
        if was_paused && slot.class == VoiceClass::Real {
            self.backlog.push_back(MixerCommand::Resume { slot: index, handle });
        }
        self.volume.start_fade(index, 1.0, fade_time, now);
    }

    fn stop(&mut self, handle: VoiceHandle, fade_time: f64, now: f64) {
        let Some(index) = self.live_slot(handle) else {
            return;
        };
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };

        if fade_time > 0.0 && slot.lifecycle != SlotLifecycle::Paused {
            slot.lifecycle = SlotLifecycle::Stopping;
            self.volume.start_fade(index, 0.0, fade_time, now);
        } else {
            self.finish(index);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SLOT TRANSITIONS
    // ═══════════════════════════════════════════════════════════════════════════

    fn make_virtual(&mut self, index: usize) {
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        if slot.class == VoiceClass::Virtual {
            return;
        }
        slot.class = VoiceClass::Virtual;
        slot.position = self.shared.position(index) as f64;
        let handle = slot.handle;

        self.num_real -= 1;
        self.num_virtual += 1;
        self.backlog.push_back(MixerCommand::Stop { slot: index, handle });
        log::trace!("Voice {:?} demoted", handle);
        self.notify(VoiceNotification::Virtual {
            handle,
            slot: index,
        });
    }

    fn make_real(&mut self, index: usize) {
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };
        if slot.class == VoiceClass::Real {
            return;
        }
        slot.class = VoiceClass::Real;
        let handle = slot.handle;

        self.num_virtual -= 1;
        self.num_real += 1;
        if self.start_in_mixer(index) {
            log::trace!("Voice {:?} promoted", handle);
            self.notify(VoiceNotification::Real {
                handle,
                slot: index,
            });
        } else {
            self.finish(index);
        }
    }

    /// Queue a mixer start for a real voice from its current position
    fn start_in_mixer(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots[index].as_ref() else {
            return false;
        };

        let description = &slot.description;
        let start_frame = slot.position as u64;
        let source = match &slot.source {
            SoundSource::Loaded(data) => {
                let mut reader = MemoryReader::new(Arc::clone(data));
                if start_frame > 0 {
                    if let Err(e) = reader.seek_frames(start_frame as i64, SeekMode::FromStart) {
                        log::debug!("Voice {:?} resume seek failed: {}", slot.handle, e);
                    }
                }
                SampleSource::Memory(reader)
            }
            SoundSource::Streamed { path, .. } => {
                let Some(jobs) = self.stream_jobs.as_ref() else {
                    log::error!("No decode worker for streamed voice {:?}", slot.handle);
                    return false;
                };
                let ring_len = self.stream_ring_frames.max(1) * description.num_channels.max(1);
                let (producer, consumer) = RingBuffer::new(ring_len);
                let flags = Arc::new(StreamFlags::default());
                let job = StreamJob {
                    path: path.clone(),
                    start_frame,
                    looping: slot.looping,
                    producer,
                    flags: Arc::clone(&flags),
                };
                if jobs.send(job).is_err() {
                    log::error!("Decode worker gone; cannot stream voice {:?}", slot.handle);
                    return false;
                }
                SampleSource::Stream(StreamSource::new(consumer, flags))
            }
        };

        let start = VoiceStart {
            slot: index,
            handle: slot.handle,
            source,
            num_channels: description.num_channels,
            frame_rate: description.frame_rate,
            num_frames: description.num_frames,
            start_frame,
            looping: slot.looping,
            paused: slot.lifecycle == SlotLifecycle::Paused,
        };
        self.shared.set_position(index, start_frame);
        self.backlog.push_back(MixerCommand::Start(start));
        true
    }

    /// Empty a slot and return its index to the free queue
    fn release_slot(&mut self, index: usize) -> Option<VoiceHandle> {
        let slot = self.slots[index].take()?;
        match slot.class {
            VoiceClass::Real => {
                self.num_real -= 1;
                self.backlog.push_back(MixerCommand::Stop {
                    slot: index,
                    handle: slot.handle,
                });
            }
            VoiceClass::Virtual => self.num_virtual -= 1,
        }
        self.pitch.release_entry(index);
        self.volume.release_entry(index);
        self.shared.set_volume(index, 0.0);
        self.handle_to_slot.remove(&slot.handle);
        self.free_slots.push_back(index);
        Some(slot.handle)
    }

    fn suspend(&mut self, index: usize) {
        if let Some(handle) = self.release_slot(index) {
            log::debug!("Voice {:?} suspended", handle);
            self.notify(VoiceNotification::Suspended { handle });
        }
    }

    fn finish(&mut self, index: usize) {
        if let Some(handle) = self.release_slot(index) {
            log::trace!("Voice {:?} done", handle);
            self.notify(VoiceNotification::Done { handle });
        }
    }

    /// Finish every live voice
    pub fn stop_all(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].is_some() {
                self.finish(index);
            }
        }
        self.flush_mixer_commands();
    }

    fn notify(&self, notification: VoiceNotification) {
        self.notifications.send(notification);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TICK
    // ═══════════════════════════════════════════════════════════════════════════

    /// One control tick at time `now`, `dt` seconds after the previous one
    pub fn update(&mut self, now: f64, dt: f64) {
        self.drain_mixer_events();
        self.apply_attenuation();

        self.pitch.update(now);
        self.volume.update(now);

        self.complete_fades();
        self.advance_positions(dt);
        self.update_states();

        self.publish();
        self.flush_mixer_commands();
    }

    fn drain_mixer_events(&mut self) {
        while let Ok(event) = self.mixer.events.pop() {
            match event {
                MixerEvent::Retired {
                    slot,
                    handle,
                    source,
                    reason,
                    ..
                } => {
                    drop(source);
                    if reason != RetireReason::Finished {
                        continue;
                    }
                    let still_real = self.slots[slot]
                        .as_ref()
                        .is_some_and(|s| s.handle == handle && s.class == VoiceClass::Real);
                    if still_real {
                        self.finish(slot);
                    }
                }
            }
        }
    }

    fn apply_attenuation(&mut self) {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(emitter) = slot.as_ref().and_then(|s| s.emitter) {
                self.volume
                    .set_attenuation(index, self.emitters.attenuation_for(emitter));
            }
        }
    }

    fn complete_fades(&mut self) {
        self.to_release.clear();
        self.to_pause.clear();

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            match slot.lifecycle {
                SlotLifecycle::Stopping if self.volume.is_fade_done(index) => {
                    self.to_release.push(index);
                }
                SlotLifecycle::Pausing if self.volume.is_fade_done(index) => {
                    self.to_pause.push(index);
                }
                _ => {}
            }
        }

        for i in 0..self.to_pause.len() {
            self.enter_paused(self.to_pause[i]);
        }
        for i in 0..self.to_release.len() {
            self.finish(self.to_release[i]);
        }
    }

    fn advance_positions(&mut self, dt: f64) {
        self.to_release.clear();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            match slot.class {
                VoiceClass::Real => slot.position = self.shared.position(index) as f64,
                VoiceClass::Virtual => {
                    if slot.lifecycle == SlotLifecycle::Paused {
                        continue;
                    }
                    let rate = slot.description.frame_rate as f64;
                    slot.position += dt * rate * self.pitch.product(index) as f64;

                    // Unknown length: the decoder reports the end once the voice is real
                    let Some(total) = slot.description.known_frames() else {
                        continue;
                    };
                    let total = total as f64;
                    if slot.position >= total {
                        if slot.looping {
                            slot.position %= total;
                        } else {
                            self.to_release.push(index);
                        }
                    }
                }
            }
        }

        for i in 0..self.to_release.len() {
            self.finish(self.to_release[i]);
        }
    }

    /// Rebalance classes against the priority-sorted list
    fn update_states(&mut self) {
        self.to_demote.clear();
        self.to_promote.clear();

        let mut rank = 0;
        for entry in self.volume.sorted_voices() {
            let Some(slot) = self.slots[entry.index].as_ref() else {
                continue;
            };
            match (rank < self.max_voices, slot.class) {
                (true, VoiceClass::Virtual) => self.to_promote.push(entry.index),
                (false, VoiceClass::Real) => self.to_demote.push(entry.index),
                _ => {}
            }
            rank += 1;
        }

        for i in 0..self.to_demote.len() {
            self.make_virtual(self.to_demote[i]);
        }
        for i in 0..self.to_promote.len() {
            self.make_real(self.to_promote[i]);
        }
    }

    fn publish(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                self.shared.set_volume(index, self.volume.product(index));
                self.shared.set_pitch(index, self.pitch.product(index));
            }
        }
        self.shared.set_voice_counts(self.num_real, self.num_virtual);
    }

    fn flush_mixer_commands(&mut self) {
        while let Some(command) = self.backlog.pop_front() {
            if let Err(PushError::Full(command)) = self.mixer.commands.push(command) {
                self.backlog.push_front(command);
                if !self.backlog_warned {
                    log::warn!("Mixer command ring full, {} commands deferred", self.backlog.len());
                    self.backlog_warned = true;
                }
                return;
            }
        }
        self.backlog_warned = false;
    }
}
