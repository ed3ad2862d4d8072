//! Emitters and distance attenuation
//!
//! Emitter handles are allocated on the main thread; positions live on the
//! control thread, which turns emitter-listener distance into the volume
//! attenuation factor of every voice attached to an emitter.

use std::collections::HashMap;

use vx_core::{AttenuationConfig, EmitterHandle, EmitterKind, EntityManager};

/// Position in world space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(self, other: Self) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Linear falloff between a minimum and maximum distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceAttenuation {
    pub min_distance: f32,
    pub max_distance: f32,
}

impl DistanceAttenuation {
    pub fn gain(&self, distance: f32) -> f32 {
        if distance <= self.min_distance {
            1.0
        } else if distance >= self.max_distance {
            0.0
        } else {
            1.0 - (distance - self.min_distance) / (self.max_distance - self.min_distance)
        }
    }
}

impl From<AttenuationConfig> for DistanceAttenuation {
    fn from(config: AttenuationConfig) -> Self {
        Self {
            min_distance: config.min_distance,
            max_distance: config.max_distance,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN THREAD
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitter handle allocator
pub struct EmitterManager {
    handles: EntityManager<EmitterKind>,
}

impl EmitterManager {
    pub fn new(min_free_handles: usize) -> Self {
        Self {
            handles: EntityManager::new(min_free_handles),
        }
    }

    pub fn create_emitter(&mut self) -> EmitterHandle {
        self.handles.create()
    }

    pub fn release_emitter(&mut self, emitter: EmitterHandle) -> bool {
        self.handles.release(emitter)
    }

    pub fn is_valid(&self, emitter: EmitterHandle) -> bool {
        self.handles.is_valid(emitter)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROL THREAD
// ═══════════════════════════════════════════════════════════════════════════════

/// Emitter and listener positions
pub struct EmitterTable {
    positions: HashMap<EmitterHandle, Vec3>,
    listener: Vec3,
    attenuation: DistanceAttenuation,
}

impl EmitterTable {
    pub fn new(attenuation: DistanceAttenuation) -> Self {
        Self {
            positions: HashMap::new(),
            listener: Vec3::ZERO,
            attenuation,
        }
    }

    pub fn set_position(&mut self, emitter: EmitterHandle, position: Vec3) {
        self.positions.insert(emitter, position);
    }

    pub fn remove(&mut self, emitter: EmitterHandle) {
        self.positions.remove(&emitter);
    }

    pub fn set_listener(&mut self, position: Vec3) {
        self.listener = position;
    }

    pub fn listener(&self) -> Vec3 {
        self.listener
    }

    pub fn position(&self, emitter: EmitterHandle) -> Option<Vec3> {
        self.positions.get(&emitter).copied()
    }

    /// Attenuation for a voice on `emitter`; emitters without a position sit on the listener
    pub fn attenuation_for(&self, emitter: EmitterHandle) -> f32 {
        match self.positions.get(&emitter) {
            Some(&position) => self.attenuation.gain(position.distance(self.listener)),
            None => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_falloff() {
        let attenuation = DistanceAttenuation {
            min_distance: 10.0,
            max_distance: 20.0,
        };
        assert_relative_eq!(attenuation.gain(0.0), 1.0);
        assert_relative_eq!(attenuation.gain(10.0), 1.0);
        assert_relative_eq!(attenuation.gain(15.0), 0.5);
        assert_relative_eq!(attenuation.gain(25.0), 0.0);
    }

    #[test]
    fn test_table_distance() {
        let mut manager = EmitterManager::new(0);
        let emitter = manager.create_emitter();

        let mut table = EmitterTable::new(AttenuationConfig::default().into());
        assert_relative_eq!(table.attenuation_for(emitter), 1.0);

        table.set_position(emitter, Vec3::new(3.0, 4.0, 0.0));
        table.set_listener(Vec3::new(0.0, 0.0, 0.0));
        // distance 5 with default 1..100 falloff
        assert_relative_eq!(table.attenuation_for(emitter), 1.0 - 4.0 / 99.0);

        table.remove(emitter);
        assert!(table.position(emitter).is_none());
        assert!(manager.release_emitter(emitter));
        assert!(!manager.is_valid(emitter));
    }
}
