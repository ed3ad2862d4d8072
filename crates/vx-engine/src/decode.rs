//! Stream decode worker
//!
//! Streamed voices read from an `rtrb` ring that this worker keeps topped up.
//! The control thread creates the ring when a streamed voice becomes real,
//! hands the producer end here and the consumer end to the mixer. When the
//! mixer's source is disposed, the ring is abandoned and the worker drops the
//! stream on its next pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use rtrb::Producer;

use vx_file::{SeekMode, SoundFileReader, open_reader};

use crate::{EngineError, EngineResult, MAX_SOURCE_CHANNELS};

/// Frames decoded per pass per stream
const DECODE_CHUNK_FRAMES: usize = 2048;
/// Wait for new jobs when no stream is active
const IDLE_WAIT: Duration = Duration::from_millis(20);
/// Pause between passes when every ring is full
const FULL_WAIT: Duration = Duration::from_millis(2);

/// State shared between a stream's decoder and its mixer voice
#[derive(Debug, Default)]
pub struct StreamFlags {
    end_of_stream: AtomicBool,
    failed: AtomicBool,
}

impl StreamFlags {
    /// Everything the stream will ever produce has been pushed
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    /// The file could not be opened or decoded
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn finish(&self, failed: bool) {
        if failed {
            self.failed.store(true, Ordering::Release);
        }
        self.end_of_stream.store(true, Ordering::Release);
    }
}

/// Request to start decoding a file into a ring
pub struct StreamJob {
    pub path: PathBuf,
    pub start_frame: u64,
    pub looping: bool,
    pub producer: Producer<f32>,
    pub flags: Arc<StreamFlags>,
}

struct ActiveStream {
    reader: Box<dyn SoundFileReader>,
    producer: Producer<f32>,
    flags: Arc<StreamFlags>,
    looping: bool,
}

impl ActiveStream {
    fn open(job: StreamJob) -> Option<Self> {
        let mut reader = match open_reader(&job.path) {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("Failed to open stream {}: {}", job.path.display(), e);
                job.flags.finish(true);
                return None;
            }
        };

        let channels = reader.description().num_channels;
        if channels == 0 || channels > MAX_SOURCE_CHANNELS {
            log::warn!(
                "Stream {} has unsupported channel count {}",
                job.path.display(),
                channels
            );
            job.flags.finish(true);
            return None;
        }

        if job.start_frame > 0 {
            let total = reader.description().num_frames;
            let start = if job.looping && total > 0 {
                job.start_frame % total
            } else {
                job.start_frame
            };
            if let Err(e) = reader.seek_frames(start as i64, SeekMode::FromStart) {
                log::debug!("Stream {} seek to {} failed: {}", job.path.display(), start, e);
                // A looping stream of unknown length may have been tracked past its end
                let restarted =
                    job.looping && reader.seek_frames(0, SeekMode::FromStart).is_ok();
                if !restarted {
                    job.flags.finish(false);
                    return None;
                }
            }
        }

        Some(Self {
            reader,
            producer: job.producer,
            flags: job.flags,
            looping: job.looping,
        })
    }

    /// Decode into free ring space
    ///
    /// Returns `(keep, did_work)`.
    fn fill(&mut self, scratch: &mut [f32]) -> (bool, bool) {
        if self.producer.is_abandoned() {
            return (false, false);
        }

        let channels = self.reader.description().num_channels;
        let free_frames = (self.producer.slots() / channels).min(DECODE_CHUNK_FRAMES);
        if free_frames == 0 {
            return (true, false);
        }

        let want = free_frames * channels;
        let mut count = match self.reader.read_samples(&mut scratch[..want]) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Stream decode failed: {}", e);
                self.flags.finish(true);
                return (false, true);
            }
        };

        if count == 0 && self.looping {
            count = match self
                .reader
                .seek_frames(0, SeekMode::FromStart)
                .and_then(|_| self.reader.read_samples(&mut scratch[..want]))
            {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("Stream loop failed: {}", e);
                    0
                }
            };
        }

        if count == 0 {
            self.flags.finish(false);
            return (false, true);
        }

        if let Ok(chunk) = self.producer.write_chunk_uninit(count) {
            chunk.fill_from_iter(scratch[..count].iter().copied());
        }
        (true, true)
    }
}

/// Handle to the `vx-decode` thread
pub struct DecodeWorker {
    jobs: Sender<StreamJob>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn() -> EngineResult<Self> {
        let (jobs, job_rx) = unbounded::<StreamJob>();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("vx-decode".into())
            .spawn(move || decode_loop(job_rx, thread_running))
            .map_err(|e| EngineError::ThreadSpawn {
                name: "vx-decode",
                reason: e.to_string(),
            })?;

        Ok(Self {
            jobs,
            running,
            thread: Some(thread),
        })
    }

    /// Sender for the control thread
    pub fn job_sender(&self) -> Sender<StreamJob> {
        self.jobs.clone()
    }

    pub fn signal_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

fn decode_loop(jobs: Receiver<StreamJob>, running: Arc<AtomicBool>) {
    let mut active: Vec<ActiveStream> = Vec::new();
    let mut scratch = vec![0.0f32; DECODE_CHUNK_FRAMES * MAX_SOURCE_CHANNELS];

    while running.load(Ordering::Acquire) {
        if active.is_empty() {
            match jobs.recv_timeout(IDLE_WAIT) {
                Ok(job) => active.extend(ActiveStream::open(job)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for job in jobs.try_iter() {
            active.extend(ActiveStream::open(job));
        }

        let mut did_work = false;
        active.retain_mut(|stream| {
            let (keep, worked) = stream.fill(&mut scratch);
            did_work |= worked;
            keep
        });

        if !did_work {
            std::thread::sleep(FULL_WAIT);
        }
    }

    log::debug!("Decode worker exiting with {} open streams", active.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_missing_file_fails_stream() {
        let mut worker = DecodeWorker::spawn().unwrap();
        let (producer, _consumer) = rtrb::RingBuffer::new(64);
        let flags = Arc::new(StreamFlags::default());

        worker
            .job_sender()
            .send(StreamJob {
                path: "/nonexistent/stream.ogg".into(),
                start_frame: 0,
                looping: false,
                producer,
                flags: Arc::clone(&flags),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !flags.is_end_of_stream() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flags.is_end_of_stream());
        assert!(flags.has_failed());

        worker.signal_shutdown();
        worker.take_thread().unwrap().join().unwrap();
    }
}
