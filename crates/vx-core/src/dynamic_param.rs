//! Dynamic Parameter Interpolation
//!
//! Linear ramp-to-target evaluator shared by the volume, pitch and fade
//! systems. Each index holds one independently animating scalar.
//!
//! Values are computed once per control tick and cached, so the mixer never
//! re-evaluates ramps inside its sample loop.

/// State of one linear ramp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRamp {
    /// Value at the start of the current ramp
    pub start_value: f32,
    /// Target value
    pub end_value: f32,
    /// Last computed value
    pub current_value: f32,
    /// Time the ramp started (seconds)
    pub start_time: f64,
    /// Ramp duration (seconds)
    pub delta_time: f64,
    /// Ramp has reached its target
    pub is_done: bool,
}

impl ParamRamp {
    /// Settled ramp resting on `value`
    pub fn settled(value: f32) -> Self {
        Self {
            start_value: value,
            end_value: value,
            current_value: value,
            start_time: 0.0,
            delta_time: 0.0,
            is_done: true,
        }
    }

    /// Retarget the ramp
    ///
    /// A request for the value the ramp already sits on is ignored, so
    /// redundant commands never restart a ramp. A zero ramp time always
    /// lands on `target`, even mid-ramp toward it.
    pub fn set_target(&mut self, target: f32, now: f64, ramp_time: f64) {
        let settled_on_target = self.is_done && target == self.current_value;
        let heading_to_target = ramp_time > 0.0 && !self.is_done && target == self.end_value;
        if settled_on_target || heading_to_target {
            return;
        }

        if ramp_time <= 0.0 {
            *self = Self::settled(target);
            return;
        }

        self.start_value = self.current_value;
        self.end_value = target;
        self.start_time = now;
        self.delta_time = ramp_time;
        self.is_done = false;
    }

    /// Evaluate the ramp at `now` and cache the result
    pub fn compute(&mut self, now: f64) -> f32 {
        if self.is_done {
            return self.current_value;
        }

        let fraction = if self.delta_time > 0.0 {
            ((now - self.start_time) / self.delta_time).clamp(0.0, 1.0)
        } else {
            1.0
        };

        if fraction >= 1.0 {
            self.current_value = self.end_value;
            self.is_done = true;
        } else {
            self.current_value =
                self.start_value + (self.end_value - self.start_value) * fraction as f32;
        }

        self.current_value
    }
}

impl Default for ParamRamp {
    fn default() -> Self {
        Self::settled(1.0)
    }
}

/// Bank of N independently ramping parameters
#[derive(Debug, Clone)]
pub struct DynamicParamData {
    ramps: Vec<ParamRamp>,
}

impl DynamicParamData {
    /// Create `count` ramps settled on `initial_value`
    pub fn new(count: usize, initial_value: f32) -> Self {
        Self {
            ramps: vec![ParamRamp::settled(initial_value); count],
        }
    }

    /// Reset a ramp to a settled value
    #[inline]
    pub fn init(&mut self, index: usize, value: f32) {
        self.ramps[index] = ParamRamp::settled(value);
    }

    /// Start a ramp toward `target` (no-op if already there)
    #[inline]
    pub fn set_value(&mut self, index: usize, target: f32, now: f64, ramp_time: f64) {
        self.ramps[index].set_target(target, now, ramp_time);
    }

    /// Evaluate and cache the value at `now`
    #[inline]
    pub fn compute(&mut self, index: usize, now: f64) -> f32 {
        self.ramps[index].compute(now)
    }

    /// Last computed value
    #[inline]
    pub fn current(&self, index: usize) -> f32 {
        self.ramps[index].current_value
    }

    /// Target of the active ramp
    #[inline]
    pub fn target(&self, index: usize) -> f32 {
        self.ramps[index].end_value
    }

    #[inline]
    pub fn is_done(&self, index: usize) -> bool {
        self.ramps[index].is_done
    }

    /// Full ramp state (diagnostics and tests)
    pub fn ramp(&self, index: usize) -> &ParamRamp {
        &self.ramps[index]
    }

    pub fn len(&self) -> usize {
        self.ramps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ramps.is_empty()
    }
}
