//! Sample Rate Converter
//!
//! Streaming linear-interpolation resampler. Input arrives in arbitrary
//! chunks; the two frames bracketing the read position are cached across
//! calls, so splitting the input differently never changes the output.
//!
//! The rate ratio is input frames consumed per output frame
//! (`pitch * file_rate / device_rate` in the mixer). Ratio changes glide
//! exponentially instead of jumping, which keeps pitch sweeps click-free.

use smallvec::SmallVec;

/// Smallest ratio magnitude accepted
pub const MIN_RATE_RATIO: f32 = 0.001;

/// Fraction of the remaining ratio distance covered per output frame
const RATIO_SMOOTHING: f32 = 0.002;

type Frame = SmallVec<[f32; 8]>;

pub struct SampleRateConverter {
    num_channels: usize,
    current_ratio: f32,
    target_ratio: f32,
    /// Read position between `prev_frame` and `next_frame`, in [0, 1) when emitting
    frame_fraction: f64,
    prev_frame: Frame,
    next_frame: Frame,
    /// Source index of `prev_frame`
    prev_frame_index: u64,
    /// Source index of `next_frame`
    next_frame_index: u64,
    /// Frames pulled from the source so far
    frames_consumed: u64,
    /// How many of prev/next hold valid data (0..=2)
    loaded: u8,
    /// The source will supply no more frames
    input_ended: bool,
    /// `next_frame` repeats the last source frame
    holding_tail: bool,
}

impl SampleRateConverter {
    pub fn new(num_channels: usize) -> Self {
        let num_channels = num_channels.max(1);
        Self {
            num_channels,
            current_ratio: 1.0,
            target_ratio: 1.0,
            frame_fraction: 0.0,
            prev_frame: SmallVec::from_elem(0.0, num_channels),
            next_frame: SmallVec::from_elem(0.0, num_channels),
            prev_frame_index: 0,
            next_frame_index: 0,
            frames_consumed: 0,
            loaded: 0,
            input_ended: false,
            holding_tail: false,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn current_ratio(&self) -> f32 {
        self.current_ratio
    }

    pub fn target_ratio(&self) -> f32 {
        self.target_ratio
    }

    /// Source frames pulled so far
    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed
    }

    /// Source index the next output frame starts from
    pub fn prev_frame_index(&self) -> u64 {
        self.prev_frame_index
    }

    pub fn next_frame_index(&self) -> u64 {
        self.next_frame_index
    }

    fn clamp_ratio(ratio: f32) -> f32 {
        if !ratio.is_finite() {
            return 1.0;
        }
        ratio.abs().max(MIN_RATE_RATIO)
    }

    /// Glide toward a new ratio
    pub fn set_rate_ratio(&mut self, ratio: f32) {
        self.target_ratio = Self::clamp_ratio(ratio);
    }

    /// Jump to a new ratio
    pub fn set_rate_ratio_immediate(&mut self, ratio: f32) {
        self.target_ratio = Self::clamp_ratio(ratio);
        self.current_ratio = self.target_ratio;
    }

    /// Forget cached frames and position; the ratio jumps to its target
    pub fn reset(&mut self) {
        self.frame_fraction = 0.0;
        self.prev_frame.fill(0.0);
        self.next_frame.fill(0.0);
        self.prev_frame_index = 0;
        self.next_frame_index = 0;
        self.frames_consumed = 0;
        self.loaded = 0;
        self.input_ended = false;
        self.holding_tail = false;
        self.current_ratio = self.target_ratio;
    }

    /// Mark the source as finished so the last frame can be emitted
    ///
    /// Until then the last frame waits for its right neighbour.
    pub fn end_input(&mut self) {
        self.input_ended = true;
    }

    pub fn is_input_ended(&self) -> bool {
        self.input_ended
    }

    /// Produce one output frame into `out`
    ///
    /// `fetch` fills one source frame and returns `false` when none is
    /// available. Returns `false` (leaving `out` untouched) if the source ran
    /// dry first; nothing is lost and the next call picks up where this left.
    fn next_output<F>(&mut self, fetch: &mut F, out: &mut [f32]) -> bool
    where
        F: FnMut(&mut [f32]) -> bool,
    {
        loop {
            if self.loaded == 0 {
                if !fetch(&mut self.prev_frame[..]) {
                    return false;
                }
                self.prev_frame_index = self.frames_consumed;
                self.frames_consumed += 1;
                self.loaded = 1;
            } else if self.loaded == 1 {
                if fetch(&mut self.next_frame[..]) {
                    self.next_frame_index = self.frames_consumed;
                    self.frames_consumed += 1;
                } else if self.input_ended {
                    self.next_frame.copy_from_slice(&self.prev_frame);
                    self.next_frame_index = self.frames_consumed;
                    self.holding_tail = true;
                } else {
                    return false;
                }
                self.loaded = 2;
            } else if self.frame_fraction >= 1.0 {
                if self.holding_tail {
                    return false;
                }
                std::mem::swap(&mut self.prev_frame, &mut self.next_frame);
                self.prev_frame_index = self.next_frame_index;
                self.frame_fraction -= 1.0;
                self.loaded = 1;
            } else {
                break;
            }
        }

        let fraction = self.frame_fraction as f32;
        for ((o, &prev), &next) in out
            .iter_mut()
            .zip(self.prev_frame.iter())
            .zip(self.next_frame.iter())
        {
            *o = prev + (next - prev) * fraction;
        }

        self.current_ratio += (self.target_ratio - self.current_ratio) * RATIO_SMOOTHING;
        self.frame_fraction += self.current_ratio as f64;
        true
    }

    /// Pull-based conversion into a fixed buffer
    ///
    /// Returns the number of frames written; fewer than requested means the
    /// source ran dry.
    pub fn render<F>(&mut self, mut fetch: F, output: &mut [f32]) -> usize
    where
        F: FnMut(&mut [f32]) -> bool,
    {
        let channels = self.num_channels;
        let mut produced = 0;
        for frame in output.chunks_exact_mut(channels) {
            if !self.next_output(&mut fetch, frame) {
                break;
            }
            produced += 1;
        }
        produced
    }

    /// Consume every frame of `input`, appending converted frames to `output`
    ///
    /// Returns the number of frames appended.
    pub fn process_block(&mut self, input: &[f32], output: &mut Vec<f32>) -> usize {
        let channels = self.num_channels;
        let mut frames = input.chunks_exact(channels);
        let mut fetch = |dest: &mut [f32]| match frames.next() {
            Some(frame) => {
                dest.copy_from_slice(frame);
                true
            }
            None => false,
        };

        let mut produced = 0;
        loop {
            let start = output.len();
            output.resize(start + channels, 0.0);
            if !self.next_output(&mut fetch, &mut output[start..]) {
                output.truncate(start);
                break;
            }
            produced += 1;
        }
        produced
    }

    /// End the input and append the frames still held back
    ///
    /// Returns the number of frames appended.
    pub fn flush(&mut self, output: &mut Vec<f32>) -> usize {
        self.end_input();
        self.process_block(&[], output)
    }
}
