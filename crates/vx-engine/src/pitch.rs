//! Pitch Manager
//!
//! Per-slot pitch: a fixed baseline times a ramping dynamic scale. Indexed
//! by voice data slot, sized for real plus virtual voices.

use vx_core::DynamicParamData;

#[derive(Debug, Clone, Copy)]
struct PitchEntry {
    baseline: f32,
    product: f32,
}

pub struct PitchManager {
    entries: Vec<Option<PitchEntry>>,
    dynamic: DynamicParamData,
}

impl PitchManager {
    pub fn new(num_slots: usize) -> Self {
        Self {
            entries: vec![None; num_slots],
            dynamic: DynamicParamData::new(num_slots, 1.0),
        }
    }

    /// Set up a slot and compute its first product
    ///
    /// The dynamic scale ramps from 1.0 toward `dynamic_scale` over `ramp_time`.
    pub fn initialize_entry(
        &mut self,
        index: usize,
        baseline: f32,
        dynamic_scale: f32,
        ramp_time: f64,
        now: f64,
    ) {
        debug_assert!(
            self.entries[index].is_none(),
            "pitch slot {index} initialized twice"
        );

        self.dynamic.init(index, 1.0);
        self.dynamic.set_value(index, dynamic_scale, now, ramp_time);
        let product = baseline * self.dynamic.compute(index, now);
        self.entries[index] = Some(PitchEntry { baseline, product });
    }

    pub fn release_entry(&mut self, index: usize) {
        debug_assert!(self.entries[index].is_some(), "pitch slot {index} not live");
        self.entries[index] = None;
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.is_some())
    }

    pub fn set_dynamic_scale(&mut self, index: usize, value: f32, ramp_time: f64, now: f64) {
        debug_assert!(self.is_live(index), "pitch slot {index} not live");
        self.dynamic.set_value(index, value, now, ramp_time);
    }

    /// Recompute every live product
    pub fn update(&mut self, now: f64) {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if let Some(entry) = slot {
                entry.product = entry.baseline * self.dynamic.compute(index, now);
            }
        }
    }

    /// Last computed pitch product
    pub fn product(&self, index: usize) -> f32 {
        match self.entries[index] {
            Some(entry) => entry.product,
            None => {
                debug_assert!(false, "pitch slot {index} not live");
                1.0
            }
        }
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

    #[test]
    fn test_initial_product_without_lag() {
        let mut pitch = PitchManager::new(4);
        pitch.initialize_entry(1, 2.0, 0.5, 0.0, 0.0);
        assert_relative_eq!(pitch.product(1), 1.0);
    }

    #[test]
    fn test_ramped_scale() {
        let mut pitch = PitchManager::new(2);
        pitch.initialize_entry(0, 1.0, 2.0, 1.0, 10.0);
        assert_relative_eq!(pitch.product(0), 1.0);

        pitch.update(10.5);
        assert_relative_eq!(pitch.product(0), 1.5);
        pitch.update(11.0);
        assert_relative_eq!(pitch.product(0), 2.0);

        pitch.set_dynamic_scale(0, 1.0, 0.0, 11.0);
        pitch.update(11.0);
        assert_relative_eq!(pitch.product(0), 1.0);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut pitch = PitchManager::new(2);
        pitch.initialize_entry(0, 1.0, 1.0, 0.0, 0.0);
        assert!(pitch.is_live(0));
        pitch.release_entry(0);
        assert!(!pitch.is_live(0));

        // A released slot starts clean
        pitch.initialize_entry(0, 0.5, 1.0, 0.0, 1.0);
        assert_relative_eq!(pitch.product(0), 0.5);
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    #[cfg(debug_assertions)]
    fn test_double_init_asserts() {
        let mut pitch = PitchManager::new(1);
        pitch.initialize_entry(0, 1.0, 1.0, 0.0, 0.0);
        pitch.initialize_entry(0, 1.0, 1.0, 0.0, 0.0);
    }
}
