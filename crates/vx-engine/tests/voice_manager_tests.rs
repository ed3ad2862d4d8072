//! Voice manager scenarios
//!
//! The control-thread side is driven synchronously: commands go straight
//! into `handle_command` and every tick is an explicit `update`.

use std::sync::Arc;

use approx::assert_relative_eq;
use vx_audio::{CallbackInfo, StreamStatus};
use vx_core::{AudioSystemConfig, SampleFormat, SoundFileHandle, VoiceHandle};
use vx_engine::{
    CommandReceiver, ControlCommand, SharedVoiceState, Vec3, VoiceClass, VoiceInitParams,
    VoiceManager, VoiceMixer, VoiceNotification, command_queue,
};
use vx_file::{SoundFileData, SoundFileDescription, SoundSource};

const TICK: f64 = 0.033;
const RATE: u32 = 48_000;

struct Harness {
    voices: VoiceManager,
    notifications: CommandReceiver<VoiceNotification>,
    mixer: VoiceMixer,
    shared: Arc<SharedVoiceState>,
    config: AudioSystemConfig,
    next_handle: u32,
    now: f64,
}

fn sound(frames: usize, value: f32) -> SoundSource {
    let description = SoundFileDescription {
        num_frames: frames as u64,
        num_channels: 1,
        frame_rate: RATE,
        sample_format: SampleFormat::F32,
    };
    SoundSource::Loaded(Arc::new(SoundFileData::new(description, vec![value; frames])))
}

fn params(priority: f32) -> VoiceInitParams {
    VoiceInitParams {
        priority,
        ..VoiceInitParams::new(SoundFileHandle::new(0, 0))
    }
}

impl Harness {
    fn new(max_voices: usize, max_virtual_voices: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = AudioSystemConfig {
            max_voices,
            max_virtual_voices,
            ..Default::default()
        };
        let shared = Arc::new(SharedVoiceState::new(config.total_voice_slots()));
        let (mixer, link) = VoiceMixer::new(max_voices, 256, Arc::clone(&shared));
        let (notification_tx, notifications) = command_queue(4096);
        let voices = VoiceManager::new(&config, Arc::clone(&shared), link, notification_tx);

        Self {
            voices,
            notifications,
            mixer,
            shared,
            config,
            next_handle: 0,
            now: 0.0,
        }
    }

    fn play_source(&mut self, params: VoiceInitParams, source: SoundSource) -> VoiceHandle {
        let handle = VoiceHandle::new(self.next_handle, 0);
        self.next_handle += 1;
        self.voices.handle_command(
            ControlCommand::Play {
                handle,
                params,
                source,
            },
            self.now,
        );
        handle
    }

    /// Ten seconds of audio at the given priority
    fn play(&mut self, priority: f32) -> VoiceHandle {
        self.play_source(params(priority), sound(RATE as usize * 10, 0.1))
    }

    fn command(&mut self, command: ControlCommand) {
        self.voices.handle_command(command, self.now);
    }

    fn tick(&mut self, dt: f64) {
        self.now += dt;
        self.voices.update(self.now, dt);
    }

    fn drain(&mut self) -> Vec<VoiceNotification> {
        self.notifications.drain().collect()
    }

    fn render_block(&mut self) {
        let mut output = vec![0.0f32; 256 * 2];
        let mut info = CallbackInfo {
            output: &mut output,
            frame_rate: RATE,
            num_channels: 2,
            speakers: &[],
            stream_time: 0.0,
            status: StreamStatus::NONE,
        };
        self.mixer.process(&mut info);
    }

    fn assert_capacity(&self) {
        let real = self.voices.real_voice_count();
        let virtual_ = self.voices.virtual_voice_count();
        assert!(real <= self.config.max_voices, "{real} real voices");
        assert!(virtual_ <= self.config.max_virtual_voices, "{virtual_} virtual voices");
        assert_eq!(real + virtual_, self.voices.live_voice_count());
    }

    fn weight(&self, handle: VoiceHandle) -> f32 {
        let slot = self.voices.slot_of(handle).unwrap();
        self.voices.volume_manager().weighted_priority(slot)
    }
}

fn count(notes: &[VoiceNotification], pred: impl Fn(&VoiceNotification) -> bool) -> usize {
    notes.iter().filter(|n| pred(n)).count()
}

#[test]
fn forty_voices_fill_real_then_virtual() {
    let mut h = Harness::new(32, 1000);
    let handles: Vec<_> = (0..40).map(|_| h.play(1.0)).collect();
    h.tick(TICK);

    assert_eq!(h.voices.real_voice_count(), 32);
    assert_eq!(h.voices.virtual_voice_count(), 8);
    assert_eq!(h.shared.real_voice_count(), 32);
    assert_eq!(h.shared.virtual_voice_count(), 8);

    let notes = h.drain();
    assert_eq!(count(&notes, |n| matches!(n, VoiceNotification::Real { .. })), 32);
    assert_eq!(count(&notes, |n| matches!(n, VoiceNotification::Virtual { .. })), 8);
    assert_eq!(h.voices.class_of(handles[0]), Some(VoiceClass::Real));
    assert_eq!(h.voices.class_of(handles[39]), Some(VoiceClass::Virtual));

    // Equal priorities: nothing moves on later ticks
    h.tick(TICK);
    assert!(h.drain().is_empty());
}

#[test]
fn high_priority_voice_steals_one_real_slot() {
    let mut h = Harness::new(32, 1000);
    let handles: Vec<_> = (0..40).map(|_| h.play(1.0)).collect();
    h.tick(TICK);
    h.drain();

    let vip = h.play(1000.0);
    let notes = h.drain();

    let demoted: Vec<_> = notes
        .iter()
        .filter_map(|n| match n {
            VoiceNotification::Virtual { handle, .. } => Some(*handle),
            _ => None,
        })
        .collect();
    assert_eq!(demoted.len(), 1);
    assert!(handles.contains(&demoted[0]));
    assert!(notes.contains(&VoiceNotification::Real {
        handle: vip,
        slot: h.voices.slot_of(vip).unwrap(),
    }));

    assert_eq!(h.voices.real_voice_count(), 32);
    assert_eq!(h.voices.virtual_voice_count(), 9);
    assert_eq!(h.voices.class_of(vip), Some(VoiceClass::Real));

    h.tick(TICK);
    assert!(h.drain().is_empty());
    assert_eq!(h.voices.real_voice_count(), 32);
}

#[test]
fn no_virtual_pool_suspends_the_loser() {
    let mut h = Harness::new(32, 0);
    let handles: Vec<_> = (0..33).map(|_| h.play(1.0)).collect();
    h.tick(TICK);

    let notes = h.drain();
    let suspended: Vec<_> = notes
        .iter()
        .filter(|n| matches!(n, VoiceNotification::Suspended { .. }))
        .collect();
    assert_eq!(
        suspended,
        vec![&VoiceNotification::Suspended {
            handle: handles[32]
        }]
    );
    assert_eq!(h.voices.real_voice_count(), 32);
    assert_eq!(h.voices.virtual_voice_count(), 0);
    assert_eq!(h.voices.slot_of(handles[32]), None);
}

#[test]
fn stolen_voice_is_suspended_without_virtual_pool() {
    let mut h = Harness::new(4, 0);
    let handles: Vec<_> = (0..4).map(|_| h.play(1.0)).collect();
    h.drain();

    let vip = h.play(10.0);
    let notes = h.drain();
    assert_eq!(
        notes,
        vec![
            VoiceNotification::Suspended {
                handle: handles[3]
            },
            VoiceNotification::Real {
                handle: vip,
                slot: h.voices.slot_of(vip).unwrap()
            },
        ]
    );
    h.assert_capacity();
}

#[test]
fn full_virtual_pool_gives_way_to_stronger_voices() {
    let mut h = Harness::new(2, 2);
    let handles: Vec<_> = (0..4).map(|_| h.play(1.0)).collect();
    h.drain();

    // Beats the weakest real voice; the weakest virtual voice makes room
    let strong = h.play(1.5);
    let notes = h.drain();
    assert_eq!(notes.len(), 3);
    assert_eq!(
        notes[0],
        VoiceNotification::Suspended {
            handle: handles[3]
        }
    );
    assert!(matches!(notes[1], VoiceNotification::Virtual { handle, .. } if handle == handles[1]));
    assert!(matches!(notes[2], VoiceNotification::Real { handle, .. } if handle == strong));
    h.assert_capacity();

    // Loses to everything: suspended on admission
    let weak = h.play(0.5);
    assert_eq!(h.drain(), vec![VoiceNotification::Suspended { handle: weak }]);
    h.assert_capacity();
}

#[test]
fn capacity_and_monotonicity_hold_under_churn() {
    let mut h = Harness::new(8, 16);
    let mut live = Vec::new();
    let mut seed = 0x2545_f491_u32;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    for step in 0..400 {
        match next() % 4 {
            0 | 1 => {
                let priority = 0.1 + (next() % 100) as f32 / 10.0;
                live.push(h.play(priority));
            }
            2 if !live.is_empty() => {
                let handle = live.swap_remove(next() as usize % live.len());
                h.command(ControlCommand::Stop {
                    handle,
                    fade_time: 0.0,
                });
            }
            _ => {
                let pick = next() as usize % live.len().max(1);
                let handle = live.get(pick).copied().unwrap_or(VoiceHandle::INVALID);
                h.command(ControlCommand::SetVolumeScale {
                    handle,
                    value: (next() % 10) as f32 / 10.0,
                    ramp_time: 0.0,
                });
            }
        }
        h.assert_capacity();

        if step % 5 == 0 {
            h.tick(TICK);
            h.assert_capacity();

            for note in h.drain() {
                if let VoiceNotification::Suspended { handle }
                | VoiceNotification::Done { handle } = note
                {
                    live.retain(|&l| l != handle);
                }
            }

            // Every real voice outranks every virtual voice
            let mut lowest_real = f32::INFINITY;
            let mut highest_virtual = f32::NEG_INFINITY;
            for &handle in &live {
                match h.voices.class_of(handle) {
                    Some(VoiceClass::Real) => lowest_real = lowest_real.min(h.weight(handle)),
                    Some(VoiceClass::Virtual) => {
                        highest_virtual = highest_virtual.max(h.weight(handle))
                    }
                    None => {}
                }
            }
            assert!(
                lowest_real >= highest_virtual,
                "real {lowest_real} < virtual {highest_virtual} at step {step}"
            );
        }
    }
}

#[test]
fn stopping_a_real_voice_promotes_a_virtual_one() {
    let mut h = Harness::new(2, 4);
    let a = h.play(3.0);
    let _b = h.play(2.0);
    let c = h.play(1.0);
    h.tick(TICK);
    assert_eq!(h.voices.class_of(c), Some(VoiceClass::Virtual));
    h.drain();

    h.command(ControlCommand::Stop {
        handle: a,
        fade_time: 0.0,
    });
    assert_eq!(h.drain(), vec![VoiceNotification::Done { handle: a }]);

    h.tick(TICK);
    let notes = h.drain();
    assert!(matches!(notes.as_slice(), [VoiceNotification::Real { handle, .. }] if *handle == c));
    assert_eq!(h.voices.real_voice_count(), 2);
    assert_eq!(h.voices.virtual_voice_count(), 0);
}

#[test]
fn virtual_voice_ends_on_the_control_clock() {
    let mut h = Harness::new(1, 1);
    h.play(1.0);
    // 0.1 s long
    let short = h.play_source(params(1.0), sound(4800, 0.1));
    h.tick(0.05);
    assert_eq!(h.voices.class_of(short), Some(VoiceClass::Virtual));
    assert_relative_eq!(h.voices.position_of(short).unwrap(), 2400.0, epsilon = 1e-6);
    h.drain();

    h.tick(0.06);
    assert_eq!(h.drain(), vec![VoiceNotification::Done { handle: short }]);
    assert_eq!(h.voices.virtual_voice_count(), 0);
}

#[test]
fn looping_virtual_voice_wraps() {
    let mut h = Harness::new(1, 1);
    h.play(1.0);
    let looped = h.play_source(
        VoiceInitParams {
            looping: true,
            ..params(1.0)
        },
        sound(4800, 0.1),
    );
    for _ in 0..10 {
        h.tick(0.05);
    }
    let position = h.voices.position_of(looped).unwrap();
    assert!(position < 4800.0);
    assert_eq!(h.voices.class_of(looped), Some(VoiceClass::Virtual));
}

/// Streamed file whose container does not report a length
fn unsized_stream() -> SoundSource {
    SoundSource::Streamed {
        path: "radio.mp3".into(),
        description: SoundFileDescription {
            num_frames: 0,
            num_channels: 2,
            frame_rate: RATE,
            sample_format: SampleFormat::F32,
        },
    }
}

#[test]
fn virtual_stream_of_unknown_length_keeps_playing() {
    let mut h = Harness::new(1, 2);
    h.play(1.0);
    let looped = h.play_source(
        VoiceInitParams {
            looping: true,
            ..params(1.0)
        },
        unsized_stream(),
    );
    let once = h.play_source(params(1.0), unsized_stream());
    assert_eq!(h.voices.class_of(looped), Some(VoiceClass::Virtual));
    h.drain();

    for _ in 0..10 {
        h.tick(TICK);
    }
    assert!(h.drain().is_empty());
    assert_eq!(h.voices.class_of(looped), Some(VoiceClass::Virtual));
    assert_eq!(h.voices.class_of(once), Some(VoiceClass::Virtual));
    assert_relative_eq!(
        h.voices.position_of(looped).unwrap(),
        10.0 * TICK * RATE as f64,
        epsilon = 1e-6
    );
}

#[test]
fn zero_time_scale_snaps_a_running_ramp() {
    let mut h = Harness::new(4, 4);
    let voice = h.play(1.0);
    h.tick(TICK);
    let slot = h.voices.slot_of(voice).unwrap();

    h.command(ControlCommand::SetVolumeScale {
        handle: voice,
        value: 0.5,
        ramp_time: 2.0,
    });
    h.tick(0.5);
    assert_relative_eq!(h.shared.volume(slot), 0.875, epsilon = 1e-4);

    h.command(ControlCommand::SetVolumeScale {
        handle: voice,
        value: 0.5,
        ramp_time: 0.0,
    });
    h.tick(TICK);
    assert_relative_eq!(h.shared.volume(slot), 0.5);
}

#[test]
fn pitch_scales_virtual_advance() {
    let mut h = Harness::new(1, 1);
    h.play(1.0);
    let fast = h.play_source(
        VoiceInitParams {
            pitch_scale: 2.0,
            ..params(1.0)
        },
        sound(48_000, 0.1),
    );
    h.tick(0.1);
    assert_relative_eq!(h.voices.position_of(fast).unwrap(), 9600.0, epsilon = 1e-6);
    let slot = h.voices.slot_of(fast).unwrap();
    assert_relative_eq!(h.shared.pitch(slot), 2.0);
}

#[test]
fn stop_fade_releases_when_done() {
    let mut h = Harness::new(4, 4);
    let voice = h.play(1.0);
    h.tick(TICK);
    h.drain();
    let slot = h.voices.slot_of(voice).unwrap();

    h.command(ControlCommand::Stop {
        handle: voice,
        fade_time: 0.1,
    });
    h.tick(0.05);
    assert_relative_eq!(h.shared.volume(slot), 0.5, epsilon = 1e-4);
    assert!(h.drain().is_empty());

    h.tick(0.06);
    assert_eq!(h.drain(), vec![VoiceNotification::Done { handle: voice }]);
    assert_eq!(h.voices.live_voice_count(), 0);
}

#[test]
fn pause_fade_then_resume() {
    let mut h = Harness::new(4, 4);
    let voice = h.play(1.0);
    h.tick(TICK);
    h.drain();
    let slot = h.voices.slot_of(voice).unwrap();

    h.command(ControlCommand::Pause {
        handle: voice,
        fade_time: 0.1,
    });
    h.tick(0.05);
    assert!(h.drain().is_empty());
    h.tick(0.06);
    assert_eq!(h.drain(), vec![VoiceNotification::Paused { handle: voice }]);
    assert_relative_eq!(h.shared.volume(slot), 0.0);

    h.command(ControlCommand::Resume {
        handle: voice,
        fade_time: 0.0,
    });
    h.tick(TICK);
    assert_relative_eq!(h.shared.volume(slot), 1.0);
}

#[test]
fn volume_scale_and_attenuation_are_published() {
    let mut h = Harness::new(4, 4);
    let emitter = vx_engine::EmitterHandle::new(0, 0);
    let voice = h.play_source(
        VoiceInitParams {
            emitter: Some(emitter),
            ..params(1.0)
        },
        sound(48_000, 0.1),
    );
    h.tick(TICK);
    let slot = h.voices.slot_of(voice).unwrap();
    assert_relative_eq!(h.shared.volume(slot), 1.0);

    h.command(ControlCommand::SetVolumeScale {
        handle: voice,
        value: 0.5,
        ramp_time: 0.0,
    });
    h.tick(TICK);
    assert_relative_eq!(h.shared.volume(slot), 0.5);

    // Beyond the default 100 unit max distance
    h.command(ControlCommand::SetEmitterPosition {
        emitter,
        position: Vec3::new(500.0, 0.0, 0.0),
    });
    h.tick(TICK);
    assert_relative_eq!(h.shared.volume(slot), 0.0);

    h.command(ControlCommand::SetEmitter {
        handle: voice,
        emitter: None,
    });
    h.tick(TICK);
    assert_relative_eq!(h.shared.volume(slot), 0.5);
}

#[test]
fn real_voice_finishes_when_the_mixer_runs_dry() {
    let mut h = Harness::new(2, 2);
    let voice = h.play_source(params(1.0), sound(100, 0.25));
    h.tick(TICK);
    h.drain();

    h.render_block();
    h.render_block();
    h.tick(TICK);
    assert_eq!(h.drain(), vec![VoiceNotification::Done { handle: voice }]);
    assert_eq!(h.voices.real_voice_count(), 0);
    assert_eq!(h.mixer.active_lanes(), 0);
}

#[test]
fn demoted_voice_resumes_from_mixer_position() {
    let mut h = Harness::new(1, 1);
    let first = h.play(1.0);
    h.tick(TICK);
    for _ in 0..4 {
        h.render_block();
    }
    h.tick(TICK);
    let played = h.voices.position_of(first).unwrap();
    assert!(played > 0.0);

    h.play(5.0);
    assert_eq!(h.voices.class_of(first), Some(VoiceClass::Virtual));
    assert!(h.voices.position_of(first).unwrap() >= played);
}

#[test]
fn commands_for_unknown_voices_are_ignored() {
    let mut h = Harness::new(2, 2);
    let ghost = VoiceHandle::new(77, 3);
    h.command(ControlCommand::Stop {
        handle: ghost,
        fade_time: 0.0,
    });
    h.command(ControlCommand::SetPitchScale {
        handle: ghost,
        value: 2.0,
        ramp_time: 0.0,
    });
    h.tick(TICK);
    assert!(h.drain().is_empty());
    assert_eq!(h.voices.live_voice_count(), 0);
}

#[test]
fn stop_all_finishes_everything() {
    let mut h = Harness::new(2, 2);
    for _ in 0..3 {
        h.play(1.0);
    }
    h.drain();
    h.voices.stop_all();
    let notes = h.drain();
    assert_eq!(count(&notes, |n| matches!(n, VoiceNotification::Done { .. })), 3);
    assert_eq!(h.voices.live_voice_count(), 0);
}
