//! Voice Mixer
//!
//! Runs inside the hardware callback. Real voices occupy mixer lanes; each
//! lane pulls frames from its sample source through its own resampler, maps
//! them onto the device channels and accumulates them with a per-sample gain
//! ramp. Volume and pitch come from atomics the control thread publishes.
//!
//! ```text
//!   control ──MixerCommand──▶ [rtrb] ──▶ VoiceMixer::process ──▶ output block
//!   control ◀──MixerEvent──── [rtrb] ◀──┘ (retired sources)
//! ```
//!
//! Nothing here allocates, frees or locks on the callback path: lanes,
//! scratch buffers and the retire backlog are sized up front, and sources
//! that are done go back to the control thread for disposal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use portable_atomic::AtomicF32;
use rtrb::{Consumer, Producer, PushError, RingBuffer};

use vx_audio::{AudioCallback, CallbackInfo, StreamStatus};
use vx_core::VoiceHandle;
use vx_file::{MemoryReader, SeekMode, SoundFileReader};

use crate::decode::StreamFlags;
use crate::src::SampleRateConverter;

/// Most channels a sound file may have
pub const MAX_SOURCE_CHANNELS: usize = 8;

/// Frames pulled from a source per refill
const INPUT_CHUNK_FRAMES: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Values the control thread publishes and the mixer (and main thread) read
///
/// Indexed by voice data slot.
pub struct SharedVoiceState {
    volume: Box<[AtomicF32]>,
    pitch: Box<[AtomicF32]>,
    position: Box<[AtomicU64]>,
    master_gain: AtomicF32,
    real_voices: AtomicUsize,
    virtual_voices: AtomicUsize,
    underflows: AtomicU64,
    overflows: AtomicU64,
    starved_blocks: AtomicU64,
    blocks_rendered: AtomicU64,
}

impl SharedVoiceState {
    pub fn new(num_slots: usize) -> Self {
        Self {
            volume: (0..num_slots).map(|_| AtomicF32::new(0.0)).collect(),
            pitch: (0..num_slots).map(|_| AtomicF32::new(1.0)).collect(),
            position: (0..num_slots).map(|_| AtomicU64::new(0)).collect(),
            master_gain: AtomicF32::new(1.0),
            real_voices: AtomicUsize::new(0),
            virtual_voices: AtomicUsize::new(0),
            underflows: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            starved_blocks: AtomicU64::new(0),
            blocks_rendered: AtomicU64::new(0),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.volume.len()
    }

    pub fn set_volume(&self, slot: usize, value: f32) {
        self.volume[slot].store(value, Ordering::Relaxed);
    }

    pub fn volume(&self, slot: usize) -> f32 {
        self.volume[slot].load(Ordering::Relaxed)
    }

    pub fn set_pitch(&self, slot: usize, value: f32) {
        self.pitch[slot].store(value, Ordering::Relaxed);
    }

    pub fn pitch(&self, slot: usize) -> f32 {
        self.pitch[slot].load(Ordering::Relaxed)
    }

    /// Last frame position the mixer reported for a real voice
    pub fn position(&self, slot: usize) -> u64 {
        self.position[slot].load(Ordering::Relaxed)
    }

    pub(crate) fn set_position(&self, slot: usize, frame: u64) {
        self.position[slot].store(frame, Ordering::Relaxed);
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master_gain.store(gain.max(0.0), Ordering::Relaxed);
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain.load(Ordering::Relaxed)
    }

    pub fn set_voice_counts(&self, real: usize, virtual_: usize) {
        self.real_voices.store(real, Ordering::Relaxed);
        self.virtual_voices.store(virtual_, Ordering::Relaxed);
    }

    pub fn real_voice_count(&self) -> usize {
        self.real_voices.load(Ordering::Relaxed)
    }

    pub fn virtual_voice_count(&self) -> usize {
        self.virtual_voices.load(Ordering::Relaxed)
    }

    pub(crate) fn record_status(&self, status: StreamStatus) {
        if status.contains(StreamStatus::OUTPUT_UNDERFLOW) {
            self.underflows.fetch_add(1, Ordering::Relaxed);
        }
        if status.contains(StreamStatus::OUTPUT_OVERFLOW) {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Blocks the device reported an output underflow for
    pub fn underflow_count(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Voice-blocks that were short of streamed data
    pub fn starved_block_count(&self) -> u64 {
        self.starved_blocks.load(Ordering::Relaxed)
    }

    pub fn blocks_rendered(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCES, COMMANDS, EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer end of a decode ring
pub struct StreamSource {
    consumer: Consumer<f32>,
    flags: Arc<StreamFlags>,
}

impl StreamSource {
    pub fn new(consumer: Consumer<f32>, flags: Arc<StreamFlags>) -> Self {
        Self { consumer, flags }
    }

    pub fn flags(&self) -> &Arc<StreamFlags> {
        &self.flags
    }
}

/// Where a real voice reads its frames from
pub enum SampleSource {
    Memory(MemoryReader),
    Stream(StreamSource),
}

/// Everything a lane needs to start a voice
pub struct VoiceStart {
    pub slot: usize,
    pub handle: VoiceHandle,
    pub source: SampleSource,
    pub num_channels: usize,
    pub frame_rate: u32,
    /// Total frames, 0 when unknown
    pub num_frames: u64,
    /// Source frame the source is positioned at
    pub start_frame: u64,
    pub looping: bool,
    pub paused: bool,
}

pub enum MixerCommand {
    Start(VoiceStart),
    Pause { slot: usize, handle: VoiceHandle },
    Resume { slot: usize, handle: VoiceHandle },
    Stop { slot: usize, handle: VoiceHandle },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// The source ran out
    Finished,
    /// The control thread took the voice away
    Stopped,
}

pub enum MixerEvent {
    /// A lane gave up its voice; the source is handed back for disposal
    Retired {
        slot: usize,
        handle: VoiceHandle,
        source: SampleSource,
        reason: RetireReason,
        frame_position: u64,
    },
}

/// Control thread ends of the mixer rings
pub struct MixerLink {
    pub commands: Producer<MixerCommand>,
    pub events: Consumer<MixerEvent>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LANES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct SourceStatus {
    exhausted: bool,
    starved: bool,
}

/// Chunk of interleaved frames pulled from a source
struct InputBuffer {
    samples: Box<[f32]>,
    pos: usize,
    len: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            samples: vec![0.0; INPUT_CHUNK_FRAMES * MAX_SOURCE_CHANNELS].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    fn next_frame(
        &mut self,
        source: &mut SampleSource,
        channels: usize,
        looping: bool,
        status: &mut SourceStatus,
        frame: &mut [f32],
    ) -> bool {
        if self.pos + channels > self.len && !self.refill(source, channels, looping, status) {
            return false;
        }
        frame.copy_from_slice(&self.samples[self.pos..self.pos + channels]);
        self.pos += channels;
        true
    }

    fn refill(
        &mut self,
        source: &mut SampleSource,
        channels: usize,
        looping: bool,
        status: &mut SourceStatus,
    ) -> bool {
        let capacity = INPUT_CHUNK_FRAMES * channels;
        let count = match source {
            SampleSource::Memory(reader) => {
                let mut count = reader.read_samples(&mut self.samples[..capacity]).unwrap_or(0);
                if count == 0 && looping && reader.seek_frames(0, SeekMode::FromStart).is_ok() {
                    count = reader.read_samples(&mut self.samples[..capacity]).unwrap_or(0);
                }
                if count == 0 {
                    status.exhausted = true;
                    return false;
                }
                count
            }
            SampleSource::Stream(stream) => {
                let frames = (stream.consumer.slots() / channels).min(INPUT_CHUNK_FRAMES);
                if frames == 0 {
                    // Re-check after the flag: data pushed before end-of-stream must not be lost
                    if stream.flags.is_end_of_stream() && stream.consumer.slots() < channels {
                        status.exhausted = true;
                    } else {
                        status.starved = true;
                    }
                    return false;
                }
                let count = frames * channels;
                let Ok(chunk) = stream.consumer.read_chunk(count) else {
                    status.starved = true;
                    return false;
                };
                let (first, second) = chunk.as_slices();
                self.samples[..first.len()].copy_from_slice(first);
                self.samples[first.len()..count].copy_from_slice(second);
                chunk.commit_all();
                count
            }
        };
        self.pos = 0;
        self.len = count;
        true
    }
}

struct MixerLane {
    slot: usize,
    handle: VoiceHandle,
    source: Option<SampleSource>,
    src: SampleRateConverter,
    input: InputBuffer,
    num_channels: usize,
    frame_rate: u32,
    num_frames: u64,
    start_frame: u64,
    looping: bool,
    paused: bool,
    /// Gain reached at the end of the last block
    gain: f32,
    /// Ratio not yet applied; the first block jumps instead of gliding
    fresh: bool,
    finished: bool,
}

impl MixerLane {
    fn new() -> Self {
        Self {
            slot: 0,
            handle: VoiceHandle::INVALID,
            source: None,
            src: SampleRateConverter::new(1),
            input: InputBuffer::new(),
            num_channels: 1,
            frame_rate: 0,
            num_frames: 0,
            start_frame: 0,
            looping: false,
            paused: false,
            gain: 0.0,
            fresh: true,
            finished: false,
        }
    }

    fn start(&mut self, start: VoiceStart) {
        self.slot = start.slot;
        self.handle = start.handle;
        self.source = Some(start.source);
        self.src = SampleRateConverter::new(start.num_channels);
        self.input.clear();
        self.num_channels = start.num_channels;
        self.frame_rate = start.frame_rate;
        self.num_frames = start.num_frames;
        self.start_frame = start.start_frame;
        self.looping = start.looping;
        self.paused = start.paused;
        self.gain = 0.0;
        self.fresh = true;
        self.finished = false;
    }

    fn frame_position(&self) -> u64 {
        let position = self.start_frame + self.src.prev_frame_index();
        match self.num_frames {
            // Length not reported by the container
            0 => position,
            total if self.looping => position % total,
            total => position.min(total),
        }
    }

    /// Mix one chunk into `output`; returns the source status
    fn render(
        &mut self,
        scratch: &mut [f32],
        output: &mut [f32],
        out_channels: usize,
        device_rate: f32,
        target_gain: f32,
        pitch: f32,
    ) -> SourceStatus {
        let mut status = SourceStatus::default();
        let Some(source) = self.source.as_mut() else {
            status.exhausted = true;
            return status;
        };

        let channels = self.num_channels;
        let frames = output.len() / out_channels;
        let ratio = pitch * self.frame_rate as f32 / device_rate;
        if self.fresh {
            self.src.set_rate_ratio_immediate(ratio);
            self.fresh = false;
        } else {
            self.src.set_rate_ratio(ratio);
        }

        let looping = self.looping;
        let input = &mut self.input;
        let mut produced = self.src.render(
            |frame| input.next_frame(source, channels, looping, &mut status, frame),
            &mut scratch[..frames * channels],
        );
        if produced < frames && status.exhausted && !self.src.is_input_ended() {
            // Source is done: release the frames the resampler holds back
            self.src.end_input();
            produced += self
                .src
                .render(|_| false, &mut scratch[produced * channels..frames * channels]);
        }

        let start_gain = self.gain;
        let step = (target_gain - start_gain) / frames.max(1) as f32;
        for (i, (src_frame, out_frame)) in scratch[..produced * channels]
            .chunks_exact(channels)
            .zip(output.chunks_exact_mut(out_channels))
            .enumerate()
        {
            mix_frame(src_frame, out_frame, start_gain + step * (i + 1) as f32);
        }
        self.gain = target_gain;

        // Finished only once the resampler has emitted its tail
        status.exhausted = produced < frames && self.src.is_input_ended();
        status
    }
}

/// Accumulate one source frame onto one device frame
fn mix_frame(source: &[f32], output: &mut [f32], gain: f32) {
    match (source.len(), output.len()) {
        (1, _) => {
            let value = source[0] * gain;
            for out in output.iter_mut() {
                *out += value;
            }
        }
        (2, 1) => output[0] += (source[0] + source[1]) * 0.5 * gain,
        _ => {
            for (out, &value) in output.iter_mut().zip(source) {
                *out += value * gain;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIXER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct VoiceMixer {
    shared: Arc<SharedVoiceState>,
    commands: Consumer<MixerCommand>,
    events: Producer<MixerEvent>,
    lanes: Vec<MixerLane>,
    free_lanes: Vec<usize>,
    active: Vec<usize>,
    slot_to_lane: Vec<Option<usize>>,
    /// Retire events the event ring had no room for
    backlog: VecDeque<MixerEvent>,
    scratch: Box<[f32]>,
    block_frames: usize,
    master_gain: f32,
}

impl VoiceMixer {
    /// Build a mixer with `num_lanes` real voice lanes
    pub fn new(
        num_lanes: usize,
        block_size_frames: usize,
        shared: Arc<SharedVoiceState>,
    ) -> (Self, MixerLink) {
        let num_slots = shared.num_slots();
        let (command_tx, command_rx) = RingBuffer::new(num_slots * 4 + 64);
        let (event_tx, event_rx) = RingBuffer::new(num_slots * 2 + 64);
        let block_frames = block_size_frames.max(1);

        let mixer = Self {
            shared,
            commands: command_rx,
            events: event_tx,
            lanes: (0..num_lanes).map(|_| MixerLane::new()).collect(),
            free_lanes: (0..num_lanes).rev().collect(),
            active: Vec::with_capacity(num_lanes),
            slot_to_lane: vec![None; num_slots],
            backlog: VecDeque::with_capacity(num_lanes * 2 + 16),
            scratch: vec![0.0; block_frames * MAX_SOURCE_CHANNELS].into_boxed_slice(),
            block_frames,
            master_gain: 1.0,
        };
        let link = MixerLink {
            commands: command_tx,
            events: event_rx,
        };
        (mixer, link)
    }

    pub fn active_lanes(&self) -> usize {
        self.active.len()
    }

    /// Render one hardware block
    pub fn process(&mut self, info: &mut CallbackInfo<'_>) -> bool {
        self.shared.record_status(info.status);
        self.flush_backlog();
        self.apply_commands();

        let out_channels = info.num_channels;
        if out_channels == 0 {
            return true;
        }
        let device_rate = info.frame_rate.max(1) as f32;
        let frames = info.num_frames();

        let mut offset = 0;
        while offset < frames {
            let count = (frames - offset).min(self.block_frames);
            let chunk = &mut info.output[offset * out_channels..(offset + count) * out_channels];
            self.render_chunk(chunk, out_channels, device_rate);
            offset += count;
        }

        let target = self.shared.master_gain();
        let start = self.master_gain;
        let step = (target - start) / frames.max(1) as f32;
        for (i, frame) in info.output.chunks_exact_mut(out_channels).enumerate() {
            let gain = start + step * (i + 1) as f32;
            for sample in frame {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }
        self.master_gain = target;

        self.shared.blocks_rendered.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn render_chunk(&mut self, output: &mut [f32], out_channels: usize, device_rate: f32) {
        let mut any_finished = false;

        for &lane_index in &self.active {
            let lane = &mut self.lanes[lane_index];
            if lane.paused {
                continue;
            }
            let slot = lane.slot;
            let status = lane.render(
                &mut self.scratch,
                output,
                out_channels,
                device_rate,
                self.shared.volume(slot),
                self.shared.pitch(slot),
            );
            self.shared.set_position(slot, lane.frame_position());

            if status.starved {
                self.shared.starved_blocks.fetch_add(1, Ordering::Relaxed);
            }
            if status.exhausted {
                lane.finished = true;
                any_finished = true;
            }
        }

        if any_finished {
            for i in 0..self.active.len() {
                let lane_index = self.active[i];
                if self.lanes[lane_index].finished {
                    self.retire_lane(lane_index, RetireReason::Finished);
                }
            }
            self.compact_active();
        }
    }

    fn apply_commands(&mut self) {
        let mut stopped_any = false;
        while let Ok(command) = self.commands.pop() {
            match command {
                MixerCommand::Start(start) => {
                    if let Some(existing) = self.slot_to_lane[start.slot] {
                        self.retire_lane(existing, RetireReason::Stopped);
                        stopped_any = true;
                    }
                    self.start_voice(start);
                }
                MixerCommand::Pause { slot, handle } => {
                    if let Some(lane) = self.lane_for(slot, handle) {
                        self.lanes[lane].paused = true;
                        self.lanes[lane].gain = 0.0;
                    }
                }
                MixerCommand::Resume { slot, handle } => {
                    if let Some(lane) = self.lane_for(slot, handle) {
                        self.lanes[lane].paused = false;
                    }
                }
                MixerCommand::Stop { slot, handle } => {
                    if let Some(lane) = self.lane_for(slot, handle) {
                        self.retire_lane(lane, RetireReason::Stopped);
                        stopped_any = true;
                    }
                }
            }
        }
        if stopped_any {
            self.compact_active();
        }
    }

    fn start_voice(&mut self, start: VoiceStart) {
        let Some(lane_index) = self.free_lanes.pop() else {
            // No lane left: hand the source straight back
            let event = MixerEvent::Retired {
                slot: start.slot,
                handle: start.handle,
                frame_position: start.start_frame,
                source: start.source,
                reason: RetireReason::Stopped,
            };
            self.send_event(event);
            return;
        };

        let slot = start.slot;
        self.lanes[lane_index].start(start);
        self.slot_to_lane[slot] = Some(lane_index);
        self.active.push(lane_index);
    }

    fn lane_for(&self, slot: usize, handle: VoiceHandle) -> Option<usize> {
        let lane = self.slot_to_lane.get(slot).copied().flatten()?;
        (self.lanes[lane].handle == handle).then_some(lane)
    }

    /// Free a lane and post its source back; callers compact `active` afterwards
    fn retire_lane(&mut self, lane_index: usize, reason: RetireReason) {
        let lane = &mut self.lanes[lane_index];
        let Some(source) = lane.source.take() else {
            return;
        };
        let event = MixerEvent::Retired {
            slot: lane.slot,
            handle: lane.handle,
            frame_position: lane.frame_position(),
            source,
            reason,
        };
        lane.finished = true;
        self.slot_to_lane[lane.slot] = None;
        self.free_lanes.push(lane_index);
        self.send_event(event);
    }

    fn compact_active(&mut self) {
        let lanes = &self.lanes;
        self.active.retain(|&lane| lanes[lane].source.is_some());
    }

    fn send_event(&mut self, event: MixerEvent) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(event);
            return;
        }
        if let Err(PushError::Full(event)) = self.events.push(event) {
            self.backlog.push_back(event);
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            if let Err(PushError::Full(event)) = self.events.push(event) {
                self.backlog.push_front(event);
                break;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Parking spot for the mixer while no stream owns it
pub type MixerHome = Arc<Mutex<Option<VoiceMixer>>>;

/// Moves the mixer back home when a callback is dropped
struct MixerGuard {
    mixer: Option<VoiceMixer>,
    home: MixerHome,
}

impl Drop for MixerGuard {
    fn drop(&mut self) {
        if let Some(mixer) = self.mixer.take() {
            *self.home.lock() = Some(mixer);
        }
    }
}

/// Hardware callback that takes the mixer out of `home`
///
/// A backend that fails to open drops its callback, which parks the mixer
/// again for the next attempt.
pub fn mixer_callback(home: &MixerHome) -> AudioCallback {
    let mut guard = MixerGuard {
        mixer: home.lock().take(),
        home: Arc::clone(home),
    };
    Box::new(move |info: &mut CallbackInfo<'_>| match guard.mixer.as_mut() {
        Some(mixer) => mixer.process(info),
        None => false,
    })
}
