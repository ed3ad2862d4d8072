//! Sound file cache integration tests
//!
//! Fixtures are written with hound into a temp directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use vx_core::{SampleFormat, SoundFileCacheConfig};
use vx_file::{
    LoadMode, SeekMode, SoundFileManager, SoundFileReader, SoundFileState, SoundSource,
    WavFileReader, load_sound_file_data, open_reader,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mono 16-bit ramp: sample i = i / 1000 (wrapping at 1000)
fn write_ramp_wav(dir: &Path, name: &str, frames: usize, channels: u16) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..frames {
        let value = ((i % 1000) as i32 * 32) as i16;
        for _ in 0..channels {
            writer.write_sample(value).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

fn write_float_wav(dir: &Path, name: &str, samples: &[f32]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 48_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    path
}

#[test]
fn wav_reader_decodes_and_seeks() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp_wav(dir.path(), "ramp.wav", 500, 2);

    let mut reader = WavFileReader::open(&path).unwrap();
    let desc = reader.description().clone();
    assert_eq!(desc.num_frames, 500);
    assert_eq!(desc.num_channels, 2);
    assert_eq!(desc.frame_rate, 22_050);
    assert_eq!(desc.sample_format, SampleFormat::I16);

    let mut buf = [0.0f32; 8];
    assert_eq!(reader.read_samples(&mut buf).unwrap(), 8);
    assert_relative_eq!(buf[2], 32.0 / 32_768.0);
    assert_relative_eq!(buf[3], 32.0 / 32_768.0);

    assert_eq!(reader.seek_frames(-10, SeekMode::FromEnd).unwrap(), 490);
    let mut rest = [0.0f32; 64];
    assert_eq!(reader.read_samples(&mut rest).unwrap(), 20);
    assert_relative_eq!(rest[0], (490.0 * 32.0) / 32_768.0);
    assert_eq!(reader.read_samples(&mut rest).unwrap(), 0);
}

#[test]
fn float_wav_round_trips_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let samples = [0.0, 0.25, -0.5, 1.0];
    let path = write_float_wav(dir.path(), "f.wav", &samples);

    let data = load_sound_file_data(&path).unwrap();
    assert_eq!(data.description.sample_format, SampleFormat::F32);
    assert_eq!(data.samples, samples);
}

#[test]
fn open_reader_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.wav");
    std::fs::write(&path, b"definitely not audio").unwrap();
    assert!(open_reader(&path).is_err());
}

#[test]
fn async_load_completes_on_update() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp_wav(dir.path(), "async.wav", 2_000, 1);
    let mut manager = SoundFileManager::new(SoundFileCacheConfig::default());

    let handle = manager.load_sound_file(&path, LoadMode::Async).unwrap();
    assert_eq!(manager.state(handle), Some(SoundFileState::Loading));
    assert!(manager.source(handle).is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.state(handle) == Some(SoundFileState::Loading) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
        manager.update(0.005);
    }

    assert_eq!(manager.state(handle), Some(SoundFileState::Loaded));
    assert_eq!(manager.memory_usage(), 2_000 * 4);
    match manager.source(handle) {
        Some(SoundSource::Loaded(data)) => assert_eq!(data.description.num_frames, 2_000),
        other => panic!("expected loaded source, got {other:?}"),
    }
}

#[test]
fn async_load_failure_marks_error() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.wav");
    std::fs::write(&path, b"RIFF????WAVEjunk").unwrap();
    let mut manager = SoundFileManager::new(SoundFileCacheConfig::default());

    let handle = manager.load_sound_file(&path, LoadMode::Async).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.state(handle) == Some(SoundFileState::Loading) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
        manager.update(0.005);
    }
    assert_eq!(manager.state(handle), Some(SoundFileState::HasError));
}

#[test]
fn memory_budget_evicts_oldest_unreferenced_first() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..3)
        .map(|i| write_ramp_wav(dir.path(), &format!("{i}.wav"), 1_000, 1))
        .collect();

    // Each file is 4000 bytes decoded; room for two
    let mut manager = SoundFileManager::new(SoundFileCacheConfig {
        flush_time_threshold_secs: 1_000.0,
        target_memory_limit_bytes: 8_000,
    });

    let a = manager.load_sound_file(&paths[0], LoadMode::Sync).unwrap();
    let b = manager.load_sound_file(&paths[1], LoadMode::Sync).unwrap();
    manager.release_sound_file(a);
    manager.update(1.0);
    manager.release_sound_file(b);
    manager.update(1.0);
    assert!(manager.is_valid(a) && manager.is_valid(b));

    let c = manager.load_sound_file(&paths[2], LoadMode::Sync).unwrap();
    manager.update(0.1);

    // `a` has been idle longest
    assert!(!manager.is_valid(a));
    assert!(manager.is_valid(b));
    assert!(manager.is_valid(c));
    assert_eq!(manager.memory_usage(), 8_000);
}

#[test]
fn referenced_entries_survive_over_budget() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let a_path = write_ramp_wav(dir.path(), "a.wav", 1_000, 1);
    let b_path = write_ramp_wav(dir.path(), "b.wav", 1_000, 1);

    let mut manager = SoundFileManager::new(SoundFileCacheConfig {
        flush_time_threshold_secs: 1_000.0,
        target_memory_limit_bytes: 1_000,
    });
    let a = manager.load_sound_file(&a_path, LoadMode::Sync).unwrap();
    let b = manager.load_sound_file(&b_path, LoadMode::Sync).unwrap();

    for _ in 0..3 {
        manager.update(1.0);
    }
    assert!(manager.is_valid(a));
    assert!(manager.is_valid(b));
    assert_eq!(manager.memory_usage(), 8_000);

    // Once released they go
    manager.release_sound_file(a);
    manager.release_sound_file(b);
    manager.update(1.0);
    assert_eq!(manager.num_entries(), 0);
}

#[test]
fn repeat_request_resets_idle_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp_wav(dir.path(), "r.wav", 10, 1);
    let mut manager = SoundFileManager::new(SoundFileCacheConfig {
        flush_time_threshold_secs: 1.0,
        ..Default::default()
    });

    let handle = manager.load_sound_file(&path, LoadMode::Sync).unwrap();
    manager.release_sound_file(handle);
    manager.update(0.9);

    let again = manager.load_sound_file(&path, LoadMode::Sync).unwrap();
    assert_eq!(again, handle);
    manager.release_sound_file(again);
    manager.update(0.9);
    assert!(manager.is_valid(handle));

    manager.flush_all_unreferenced();
    assert!(!manager.is_valid(handle));
}
