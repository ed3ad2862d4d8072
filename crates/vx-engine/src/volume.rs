//! Volume Manager
//!
//! Per-slot volume is the product of four factors:
//!
//! ```text
//! product = baseline * attenuation * dynamic(now) * fade(now)
//! ```
//!
//! `dynamic` is the user-controlled scale, `fade` drives fade-in, pause and
//! stop fades. After every update the manager rebuilds `sorted_voices`, the
//! live slots ordered by `priority * product`, which drives rebalancing.

use vx_core::DynamicParamData;

/// Initial volume state of a voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeInit {
    pub baseline: f32,
    pub dynamic_scale: f32,
    pub dynamic_ramp_time: f64,
    pub attenuation: f32,
    pub priority: f32,
    /// Fade in from silence over this many seconds (0 = start at full level)
    pub fade_in_time: f64,
}

impl VolumeInit {
    /// Product the voice will have right after initialization
    ///
    /// A ramping dynamic scale starts from 1.0. Fade-in is ignored so a
    /// fading voice competes with the level it is heading for.
    pub fn initial_product(&self) -> f32 {
        let dynamic = if self.dynamic_ramp_time <= 0.0 {
            self.dynamic_scale
        } else {
            1.0
        };
        self.baseline * dynamic * self.attenuation
    }

    pub fn initial_weighted_priority(&self) -> f32 {
        self.priority * self.initial_product()
    }
}

impl Default for VolumeInit {
    fn default() -> Self {
        Self {
            baseline: 1.0,
            dynamic_scale: 1.0,
            dynamic_ramp_time: 0.0,
            attenuation: 1.0,
            priority: 1.0,
            fade_in_time: 0.0,
        }
    }
}

/// One row of the priority-sorted voice list
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortedVoiceEntry {
    pub index: usize,
    pub weighted_priority: f32,
}

#[derive(Debug, Clone, Copy)]
struct VolumeEntry {
    baseline: f32,
    attenuation: f32,
    priority: f32,
    product: f32,
}

pub struct VolumeManager {
    entries: Vec<Option<VolumeEntry>>,
    dynamic: DynamicParamData,
    fade: DynamicParamData,
    sorted_voices: Vec<SortedVoiceEntry>,
}

impl VolumeManager {
    pub fn new(num_slots: usize) -> Self {
        Self {
            entries: vec![None; num_slots],
            dynamic: DynamicParamData::new(num_slots, 1.0),
            fade: DynamicParamData::new(num_slots, 1.0),
            sorted_voices: Vec::with_capacity(num_slots),
        }
    }

    /// Set up a slot and compute its first product
    pub fn initialize_entry(&mut self, index: usize, init: VolumeInit, now: f64) {
        debug_assert!(
            self.entries[index].is_none(),
            "volume slot {index} initialized twice"
        );

        self.dynamic.init(index, 1.0);
        self.dynamic
            .set_value(index, init.dynamic_scale, now, init.dynamic_ramp_time);

        if init.fade_in_time > 0.0 {
            self.fade.init(index, 0.0);
            self.fade.set_value(index, 1.0, now, init.fade_in_time);
        } else {
            self.fade.init(index, 1.0);
        }

        let mut entry = VolumeEntry {
            baseline: init.baseline,
            attenuation: init.attenuation,
            priority: init.priority,
            product: 0.0,
        };
        entry.product = entry.baseline
            * entry.attenuation
            * self.dynamic.compute(index, now)
            * self.fade.compute(index, now);
        self.entries[index] = Some(entry);
    }

    pub fn release_entry(&mut self, index: usize) {
        debug_assert!(self.entries[index].is_some(), "volume slot {index} not live");
        self.entries[index] = None;
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.is_some())
    }

    fn entry(&self, index: usize) -> Option<&VolumeEntry> {
        let entry = self.entries[index].as_ref();
        debug_assert!(entry.is_some(), "volume slot {index} not live");
        entry
    }

    pub fn set_dynamic_scale(&mut self, index: usize, value: f32, ramp_time: f64, now: f64) {
        debug_assert!(self.is_live(index), "volume slot {index} not live");
        self.dynamic.set_value(index, value, now, ramp_time);
    }

    pub fn set_attenuation(&mut self, index: usize, value: f32) {
        if let Some(entry) = self.entries[index].as_mut() {
            entry.attenuation = value;
        } else {
            debug_assert!(false, "volume slot {index} not live");
        }
    }

    /// Ramp the fade factor toward `target` over `fade_time` seconds
    pub fn start_fade(&mut self, index: usize, target: f32, fade_time: f64, now: f64) {
        debug_assert!(self.is_live(index), "volume slot {index} not live");
        self.fade.set_value(index, target, now, fade_time);
    }

    pub fn is_fade_done(&self, index: usize) -> bool {
        self.fade.is_done(index)
    }

    /// Current fade factor
    pub fn fade_level(&self, index: usize) -> f32 {
        self.fade.current(index)
    }

    /// Recompute every live product and rebuild the sorted list
    pub fn update(&mut self, now: f64) {
        self.sorted_voices.clear();

        for (index, slot) in self.entries.iter_mut().enumerate() {
            let Some(entry) = slot else {
                continue;
            };
            entry.product = entry.baseline
                * entry.attenuation
                * self.dynamic.compute(index, now)
                * self.fade.compute(index, now);
            self.sorted_voices.push(SortedVoiceEntry {
                index,
                weighted_priority: entry.priority * entry.product,
            });
        }

        // Highest first; equal weights keep slot order
        self.sorted_voices.sort_by(|a, b| {
            b.weighted_priority
                .total_cmp(&a.weighted_priority)
                .then(a.index.cmp(&b.index))
        });
    }

    pub fn product(&self, index: usize) -> f32 {
        self.entry(index).map_or(0.0, |e| e.product)
    }

    pub fn priority(&self, index: usize) -> f32 {
        self.entry(index).map_or(0.0, |e| e.priority)
    }

    pub fn weighted_priority(&self, index: usize) -> f32 {
        self.entry(index).map_or(0.0, |e| e.priority * e.product)
    }

    /// Live slots by descending weighted priority, as of the last `update`
    pub fn sorted_voices(&self) -> &[SortedVoiceEntry] {
        &self.sorted_voices
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn init(baseline: f32, priority: f32) -> VolumeInit {
        VolumeInit {
            baseline,
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn test_product_factors() {
        let mut volume = VolumeManager::new(4);
        volume.initialize_entry(
            0,
            VolumeInit {
                baseline: 0.5,
                dynamic_scale: 0.5,
                attenuation: 0.8,
                ..Default::default()
            },
            0.0,
        );
        assert_relative_eq!(volume.product(0), 0.2);

        volume.set_attenuation(0, 0.4);
        volume.update(0.0);
        assert_relative_eq!(volume.product(0), 0.1);
    }

    #[test]
    fn test_initial_weighted_priority() {
        let ramping = VolumeInit {
            baseline: 0.5,
            dynamic_scale: 0.1,
            dynamic_ramp_time: 2.0,
            priority: 4.0,
            ..Default::default()
        };
        // Ramping dynamic counts as 1.0 at admission
        assert_relative_eq!(ramping.initial_weighted_priority(), 2.0);

        let immediate = VolumeInit {
            dynamic_ramp_time: 0.0,
            ..ramping
        };
        assert_relative_eq!(immediate.initial_weighted_priority(), 0.2);
    }

    #[test]
    fn test_sorted_descending() {
        let mut volume = VolumeManager::new(8);
        volume.initialize_entry(3, init(0.5, 1.0), 0.0);
        volume.initialize_entry(1, init(1.0, 1.0), 0.0);
        volume.initialize_entry(6, init(1.0, 10.0), 0.0);
        volume.initialize_entry(2, init(0.5, 1.0), 0.0);
        volume.update(0.0);

        let order: Vec<usize> = volume.sorted_voices().iter().map(|e| e.index).collect();
        assert_eq!(order, vec![6, 1, 2, 3]);
        assert_relative_eq!(volume.sorted_voices()[0].weighted_priority, 10.0);
    }

    #[test]
    fn test_fade_out() {
        let mut volume = VolumeManager::new(1);
        volume.initialize_entry(0, init(1.0, 1.0), 0.0);
        volume.start_fade(0, 0.0, 1.0, 0.0);
        assert!(!volume.is_fade_done(0));

        volume.update(0.5);
        assert_relative_eq!(volume.product(0), 0.5);
        volume.update(1.0);
        assert_relative_eq!(volume.product(0), 0.0);
        assert!(volume.is_fade_done(0));
    }

    #[test]
    fn test_fade_in_on_init() {
        let mut volume = VolumeManager::new(1);
        volume.initialize_entry(
            0,
            VolumeInit {
                fade_in_time: 2.0,
                ..Default::default()
            },
            0.0,
        );
        assert_relative_eq!(volume.product(0), 0.0);
        volume.update(1.0);
        assert_relative_eq!(volume.product(0), 0.5);
    }

    #[test]
    fn test_released_slots_leave_sorted_list() {
        let mut volume = VolumeManager::new(2);
        volume.initialize_entry(0, init(1.0, 1.0), 0.0);
        volume.initialize_entry(1, init(1.0, 1.0), 0.0);
        volume.release_entry(0);
        volume.update(0.0);
        assert_eq!(volume.sorted_voices().len(), 1);
        assert_eq!(volume.sorted_voices()[0].index, 1);
    }
}
