//! Control thread
//!
//! Fixed-rate loop between the main thread and the mixer: apply queued
//! commands, run the voice manager tick, watch the device counters, then
//! sleep out the rest of the tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mixer::SharedVoiceState;
use crate::queue::CommandReceiver;
use crate::voice_manager::{ControlCommand, VoiceManager};
use crate::{EngineError, EngineResult};

/// Device counters already reported
#[derive(Debug, Default)]
struct DeviceStatusWatch {
    underflows: u64,
    overflows: u64,
    starved_blocks: u64,
}

impl DeviceStatusWatch {
    fn check(&mut self, shared: &SharedVoiceState) {
        let underflows = shared.underflow_count();
        if underflows > self.underflows {
            log::warn!(
                "Audio device reported {} output underflow(s)",
                underflows - self.underflows
            );
            self.underflows = underflows;
        }

        let overflows = shared.overflow_count();
        if overflows > self.overflows {
            log::warn!(
                "Audio device reported {} output overflow(s)",
                overflows - self.overflows
            );
            self.overflows = overflows;
        }

        let starved = shared.starved_block_count();
        if starved > self.starved_blocks {
            log::debug!(
                "{} voice block(s) short of streamed data",
                starved - self.starved_blocks
            );
            self.starved_blocks = starved;
        }
    }
}

pub(crate) fn spawn_control_thread(
    mut voices: VoiceManager,
    mut commands: CommandReceiver<ControlCommand>,
    shared: Arc<SharedVoiceState>,
    tick: Duration,
    running: Arc<AtomicBool>,
) -> EngineResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("vx-control".into())
        .spawn(move || {
            log::debug!("Control thread started ({:?} tick)", tick);
            let epoch = Instant::now();
            let mut last = 0.0;
            let mut watch = DeviceStatusWatch::default();

            while running.load(Ordering::Acquire) {
                let tick_start = Instant::now();
                let now = epoch.elapsed().as_secs_f64();
                let dt = now - last;
                last = now;

                voices.process_commands(&mut commands, now);
                voices.update(now, dt);
                watch.check(&shared);

                let elapsed = tick_start.elapsed();
                if elapsed > tick {
                    log::warn!("Control tick overran: {:?} (budget {:?})", elapsed, tick);
                } else {
                    std::thread::sleep(tick - elapsed);
                }
            }

            voices.stop_all();
            log::debug!("Control thread exiting");
        })
        .map_err(|e| EngineError::ThreadSpawn {
            name: "vx-control",
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vx_audio::StreamStatus;

    #[test]
    fn test_status_watch_tracks_counters() {
        let shared = SharedVoiceState::new(1);
        let mut watch = DeviceStatusWatch::default();
        watch.check(&shared);
        assert_eq!(watch.underflows, 0);

        shared.record_status(StreamStatus::OUTPUT_UNDERFLOW);
        shared.record_status(StreamStatus::OUTPUT_UNDERFLOW | StreamStatus::OUTPUT_OVERFLOW);
        watch.check(&shared);
        assert_eq!(watch.underflows, 2);
        assert_eq!(watch.overflows, 1);

        watch.check(&shared);
        assert_eq!(watch.underflows, 2);
    }
}
