//! Sound file readers
//!
//! Every decoder sits behind `SoundFileReader`, which yields interleaved
//! `f32` samples and seeks by frame. WAV goes through hound; everything else
//! (FLAC, OGG Vorbis, MP3, AIFF) through symphonia.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode as SymphoniaSeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use vx_core::{Sample, SampleFormat};

use crate::{FileError, FileResult};

/// Samples decoded per chunk when reading a whole file
const DECODE_CHUNK_FRAMES: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// DESCRIPTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Header information for a sound file
#[derive(Debug, Clone, PartialEq)]
pub struct SoundFileDescription {
    /// Total frames (0 when the container does not say)
    pub num_frames: u64,
    pub num_channels: usize,
    pub frame_rate: u32,
    /// Encoding of the source data
    pub sample_format: SampleFormat,
}

impl SoundFileDescription {
    /// Total frames, or `None` when the container does not report a length
    pub fn known_frames(&self) -> Option<u64> {
        (self.num_frames > 0).then_some(self.num_frames)
    }

    /// Length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.frame_rate == 0 {
            0.0
        } else {
            self.num_frames as f64 / self.frame_rate as f64
        }
    }

    /// Interleaved sample count
    pub fn num_samples(&self) -> usize {
        self.num_frames as usize * self.num_channels
    }
}

/// Fully decoded sound file, shared between the cache and the mixer
#[derive(Debug, Clone)]
pub struct SoundFileData {
    pub description: SoundFileDescription,
    /// Interleaved samples
    pub samples: Vec<Sample>,
}

impl SoundFileData {
    pub fn new(description: SoundFileDescription, samples: Vec<Sample>) -> Self {
        Self {
            description,
            samples,
        }
    }

    /// Memory held by the decoded samples
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<Sample>()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// READER TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Origin for `seek_frames`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    FromStart,
    FromCurrent,
    FromEnd,
}

/// Decoder contract used by the cache and the stream worker
pub trait SoundFileReader: Send {
    fn description(&self) -> &SoundFileDescription;

    /// Read interleaved samples into `buf`
    ///
    /// Only whole frames are read. Returns the number of samples written;
    /// 0 means end of file.
    fn read_samples(&mut self, buf: &mut [Sample]) -> FileResult<usize>;

    /// Move the read position, returning the new absolute frame
    fn seek_frames(&mut self, offset: i64, mode: SeekMode) -> FileResult<u64>;

    /// Current frame position
    fn position(&self) -> u64;
}

/// Resolve a seek request to an absolute frame
fn resolve_seek(
    offset: i64,
    mode: SeekMode,
    current: u64,
    total: Option<u64>,
) -> FileResult<u64> {
    let base = match mode {
        SeekMode::FromStart => 0,
        SeekMode::FromCurrent => current as i64,
        SeekMode::FromEnd => match total {
            Some(total) => total as i64,
            None => {
                return Err(FileError::InvalidFile(
                    "cannot seek from end: length unknown".into(),
                ));
            }
        },
    };

    let target = base + offset;
    if target < 0 || total.is_some_and(|t| target as u64 > t) {
        return Err(FileError::SeekOutOfRange(target));
    }
    Ok(target as u64)
}

/// Largest whole-frame prefix of `len` samples
#[inline]
fn whole_frames(len: usize, channels: usize) -> usize {
    if channels == 0 { 0 } else { len - len % channels }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY READER
// ═══════════════════════════════════════════════════════════════════════════════

/// Reader over an already decoded buffer; never blocks
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Arc<SoundFileData>,
    frame_pos: u64,
}

impl MemoryReader {
    pub fn new(data: Arc<SoundFileData>) -> Self {
        Self { data, frame_pos: 0 }
    }

    pub fn data(&self) -> &Arc<SoundFileData> {
        &self.data
    }

    fn total_frames(&self) -> u64 {
        let channels = self.data.description.num_channels.max(1);
        (self.data.samples.len() / channels) as u64
    }
}

impl SoundFileReader for MemoryReader {
    fn description(&self) -> &SoundFileDescription {
        &self.data.description
    }

    fn read_samples(&mut self, buf: &mut [Sample]) -> FileResult<usize> {
        let channels = self.data.description.num_channels;
        let start = self.frame_pos as usize * channels;
        let available = self.data.samples.len().saturating_sub(start);
        let count = whole_frames(buf.len().min(available), channels);

        buf[..count].copy_from_slice(&self.data.samples[start..start + count]);
        if channels > 0 {
            self.frame_pos += (count / channels) as u64;
        }
        Ok(count)
    }

    fn seek_frames(&mut self, offset: i64, mode: SeekMode) -> FileResult<u64> {
        self.frame_pos = resolve_seek(offset, mode, self.frame_pos, Some(self.total_frames()))?;
        Ok(self.frame_pos)
    }

    fn position(&self) -> u64 {
        self.frame_pos
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WAV READER (hound)
// ═══════════════════════════════════════════════════════════════════════════════

/// WAV decoder backed by hound
pub struct WavFileReader {
    reader: hound::WavReader<BufReader<File>>,
    description: SoundFileDescription,
    frame_pos: u64,
}

impl WavFileReader {
    pub fn open(path: impl AsRef<Path>) -> FileResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FileError::NotFound(path.display().to_string()));
        }

        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let is_float = spec.sample_format == hound::SampleFormat::Float;
        let sample_format = SampleFormat::from_bits(spec.bits_per_sample, is_float)?;

        let description = SoundFileDescription {
            num_frames: reader.duration() as u64,
            num_channels: spec.channels as usize,
            frame_rate: spec.sample_rate,
            sample_format,
        };

        Ok(Self {
            reader,
            description,
            frame_pos: 0,
        })
    }
}

impl SoundFileReader for WavFileReader {
    fn description(&self) -> &SoundFileDescription {
        &self.description
    }

    fn read_samples(&mut self, buf: &mut [Sample]) -> FileResult<usize> {
        let channels = self.description.num_channels;
        let remaining_frames = self.description.num_frames.saturating_sub(self.frame_pos);
        let max = whole_frames(
            buf.len().min(remaining_frames as usize * channels),
            channels,
        );

        let format = self.description.sample_format;
        let mut count = 0;
        if format.is_float() {
            for (out, sample) in buf[..max].iter_mut().zip(self.reader.samples::<f32>()) {
                *out = sample?;
                count += 1;
            }
        } else {
            for (out, sample) in buf[..max].iter_mut().zip(self.reader.samples::<i32>()) {
                *out = format.normalize_int(sample?);
                count += 1;
            }
        }

        let count = whole_frames(count, channels);
        if channels > 0 {
            self.frame_pos += (count / channels) as u64;
        }
        Ok(count)
    }

    fn seek_frames(&mut self, offset: i64, mode: SeekMode) -> FileResult<u64> {
        let target = resolve_seek(
            offset,
            mode,
            self.frame_pos,
            Some(self.description.num_frames),
        )?;
        self.reader.seek(target as u32)?;
        self.frame_pos = target;
        Ok(target)
    }

    fn position(&self) -> u64 {
        self.frame_pos
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYMPHONIA READER (FLAC, OGG, MP3, AIFF)
// ═══════════════════════════════════════════════════════════════════════════════

/// Packet decoder backed by symphonia
pub struct SymphoniaFileReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    description: SoundFileDescription,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Decoded samples not yet handed out
    pending: Vec<Sample>,
    pending_pos: usize,
    /// Frames to drop after an inexact seek
    skip_frames: u64,
    frame_pos: u64,
    finished: bool,
}

impl SymphoniaFileReader {
    pub fn open(path: impl AsRef<Path>) -> FileResult<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| FileError::NotFound(path.display().to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| FileError::InvalidFile("No audio track found".to_string()))?;

        let params = &track.codec_params;
        let num_channels = params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| FileError::InvalidFile("Unknown channel layout".to_string()))?;
        let frame_rate = params
            .sample_rate
            .ok_or_else(|| FileError::InvalidFile("Unknown sample rate".to_string()))?;

        let description = SoundFileDescription {
            num_frames: params.n_frames.unwrap_or(0),
            num_channels,
            frame_rate,
            sample_format: map_sample_format(params.sample_format, params.bits_per_sample),
        };

        let track_id = track.id;
        let decoder = symphonia::default::get_codecs().make(params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            description,
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            frame_pos: 0,
            finished: false,
        })
    }

    /// Decode the next packet of our track into `pending`
    ///
    /// Returns `false` at end of stream.
    fn decode_next(&mut self) -> FileResult<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(e.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            let needs_new = self
                .sample_buf
                .as_ref()
                .is_none_or(|buf| (buf.capacity() as u64) < capacity * spec.channels.count() as u64);
            if needs_new {
                self.sample_buf = Some(SampleBuffer::new(capacity, spec));
            }

            if let Some(buf) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                self.pending.clear();
                self.pending.extend_from_slice(buf.samples());
                self.pending_pos = 0;
            }
            return Ok(true);
        }
    }
}

impl SoundFileReader for SymphoniaFileReader {
    fn description(&self) -> &SoundFileDescription {
        &self.description
    }

    fn read_samples(&mut self, buf: &mut [Sample]) -> FileResult<usize> {
        let channels = self.description.num_channels;
        let max = whole_frames(buf.len(), channels);
        let mut written = 0;

        while written < max && !self.finished {
            if self.pending_pos >= self.pending.len() {
                if !self.decode_next()? {
                    self.finished = true;
                    break;
                }
            }

            if self.skip_frames > 0 {
                let available = ((self.pending.len() - self.pending_pos) / channels) as u64;
                let skip = self.skip_frames.min(available);
                self.pending_pos += skip as usize * channels;
                self.skip_frames -= skip;
                continue;
            }

            let count = (self.pending.len() - self.pending_pos).min(max - written);
            buf[written..written + count]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + count]);
            self.pending_pos += count;
            written += count;
        }

        self.frame_pos += (written / channels.max(1)) as u64;
        Ok(written)
    }

    fn seek_frames(&mut self, offset: i64, mode: SeekMode) -> FileResult<u64> {
        let total = (self.description.num_frames > 0).then_some(self.description.num_frames);
        let target = resolve_seek(offset, mode, self.frame_pos, total)?;

        let seeked = self.format.seek(
            SymphoniaSeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: target,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();

        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.frame_pos = target;
        self.finished = false;
        Ok(target)
    }

    fn position(&self) -> u64 {
        self.frame_pos
    }
}

fn map_sample_format(
    format: Option<symphonia::core::sample::SampleFormat>,
    bits_per_sample: Option<u32>,
) -> SampleFormat {
    use symphonia::core::sample::SampleFormat as Sf;
    match format {
        Some(Sf::U8) => SampleFormat::U8,
        Some(Sf::S16) => SampleFormat::I16,
        Some(Sf::S24) => SampleFormat::I24,
        Some(Sf::S32) => SampleFormat::I32,
        Some(Sf::F64) => SampleFormat::F64,
        Some(Sf::F32) => SampleFormat::F32,
        _ => match bits_per_sample {
            Some(8) => SampleFormat::U8,
            Some(16) => SampleFormat::I16,
            Some(24) => SampleFormat::I24,
            // Lossy codecs decode to float
            _ => SampleFormat::F32,
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Open the right reader for a file
pub fn open_reader(path: impl AsRef<Path>) -> FileResult<Box<dyn SoundFileReader>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FileError::NotFound(path.display().to_string()));
    }

    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"));

    if is_wav {
        match WavFileReader::open(path) {
            Ok(reader) => return Ok(Box::new(reader)),
            // Extensible or compressed WAVs hound rejects can still go through symphonia
            Err(e) => log::debug!("hound rejected {}: {}", path.display(), e),
        }
    }

    Ok(Box::new(SymphoniaFileReader::open(path)?))
}

/// Decode everything left in a reader
pub fn decode_all(reader: &mut dyn SoundFileReader) -> FileResult<SoundFileData> {
    let mut description = reader.description().clone();
    let channels = description.num_channels;
    if channels == 0 {
        return Err(FileError::InvalidFile("zero channels".into()));
    }

    let mut samples = Vec::with_capacity(description.num_samples());
    let mut chunk = vec![0.0; DECODE_CHUNK_FRAMES * channels];
    loop {
        let count = reader.read_samples(&mut chunk)?;
        if count == 0 {
            break;
        }
        samples.extend_from_slice(&chunk[..count]);
    }

    description.num_frames = (samples.len() / channels) as u64;
    Ok(SoundFileData::new(description, samples))
}

/// Open and fully decode a file
pub fn load_sound_file_data(path: impl AsRef<Path>) -> FileResult<SoundFileData> {
    let mut reader = open_reader(path)?;
    decode_all(reader.as_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_data(frames: usize, channels: usize) -> Arc<SoundFileData> {
        let samples = (0..frames * channels).map(|i| i as f32).collect();
        Arc::new(SoundFileData::new(
            SoundFileDescription {
                num_frames: frames as u64,
                num_channels: channels,
                frame_rate: 48_000,
                sample_format: SampleFormat::F32,
            },
            samples,
        ))
    }

    #[test]
    fn test_unreported_length_is_unknown() {
        let mut description = ramp_data(4, 1).description.clone();
        assert_eq!(description.known_frames(), Some(4));
        description.num_frames = 0;
        assert_eq!(description.known_frames(), None);
    }

    #[test]
    fn test_memory_reader_whole_frames() {
        let mut reader = MemoryReader::new(ramp_data(4, 2));
        let mut buf = [0.0; 5];

        // Odd buffer: only two whole stereo frames fit
        assert_eq!(reader.read_samples(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(reader.position(), 2);

        assert_eq!(reader.read_samples(&mut buf).unwrap(), 4);
        assert_eq!(reader.read_samples(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_memory_reader_seek_modes() {
        let mut reader = MemoryReader::new(ramp_data(10, 1));
        assert_eq!(reader.seek_frames(3, SeekMode::FromStart).unwrap(), 3);
        assert_eq!(reader.seek_frames(2, SeekMode::FromCurrent).unwrap(), 5);
        assert_eq!(reader.seek_frames(-1, SeekMode::FromEnd).unwrap(), 9);

        let mut buf = [0.0; 4];
        assert_eq!(reader.read_samples(&mut buf).unwrap(), 1);
        assert_relative_eq!(buf[0], 9.0);

        assert!(reader.seek_frames(-1, SeekMode::FromStart).is_err());
        assert!(reader.seek_frames(11, SeekMode::FromStart).is_err());
    }

    #[test]
    fn test_description_helpers() {
        let data = ramp_data(24_000, 2);
        assert_relative_eq!(data.description.duration_secs(), 0.5);
        assert_eq!(data.description.num_samples(), 48_000);
        assert_eq!(data.byte_size(), 48_000 * 4);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            open_reader("/nonexistent/sound.wav"),
            Err(FileError::NotFound(_))
        ));
    }
}
