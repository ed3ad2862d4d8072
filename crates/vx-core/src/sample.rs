//! Sample formats and conversion to the mixer's `f32` representation

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, Sample};

/// Closed set of PCM sample encodings understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    I16,
    I24,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    /// Resolve a format from a bit depth and int/float flag
    pub fn from_bits(bits: u16, is_float: bool) -> CoreResult<Self> {
        match (bits, is_float) {
            (8, false) => Ok(Self::U8),
            (16, false) => Ok(Self::I16),
            (24, false) => Ok(Self::I24),
            (32, false) => Ok(Self::I32),
            (32, true) => Ok(Self::F32),
            (64, true) => Ok(Self::F64),
            (bits, is_float) => Err(CoreError::UnsupportedFormat {
                bits,
                kind: if is_float { "float" } else { "int" },
            }),
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::I16 => 16,
            Self::I24 => 24,
            Self::I32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    /// Size of one sample in packed little-endian storage
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Normalize a signed integer sample to [-1, 1)
    ///
    /// Decoders widen 8-bit unsigned PCM to a signed value centered on zero
    /// before it reaches here.
    #[inline]
    pub fn normalize_int(self, value: i32) -> Sample {
        match self {
            Self::U8 => value as Sample / 128.0,
            Self::I16 => value as Sample / 32_768.0,
            Self::I24 => value as Sample / 8_388_608.0,
            Self::I32 => (value as f64 / 2_147_483_648.0) as Sample,
            Self::F32 | Self::F64 => value as Sample,
        }
    }

    /// Decode one little-endian sample
    ///
    /// `bytes` must hold at least `bytes_per_sample()` bytes.
    #[inline]
    pub fn decode_le(self, bytes: &[u8]) -> Sample {
        match self {
            Self::U8 => (bytes[0] as i32 - 128) as Sample / 128.0,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as Sample / 32_768.0,
            Self::I24 => {
                let value = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
                value as Sample / 8_388_608.0
            }
            Self::I32 => {
                let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (value as f64 / 2_147_483_648.0) as Sample
            }
            Self::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw) as Sample
            }
        }
    }

    /// Decode a packed little-endian buffer into `output`
    ///
    /// Returns the number of samples written.
    pub fn decode_buffer_le(self, bytes: &[u8], output: &mut [Sample]) -> usize {
        let stride = self.bytes_per_sample();
        let count = (bytes.len() / stride).min(output.len());
        for (out, chunk) in output[..count].iter_mut().zip(bytes.chunks_exact(stride)) {
            *out = self.decode_le(chunk);
        }
        count
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_from_bits() {
        assert_eq!(SampleFormat::from_bits(16, false).unwrap(), SampleFormat::I16);
        assert_eq!(SampleFormat::from_bits(32, true).unwrap(), SampleFormat::F32);
        assert!(SampleFormat::from_bits(12, false).is_err());
        assert!(SampleFormat::from_bits(16, true).is_err());
    }

    #[test]
    fn test_decode_extremes() {
        assert_abs_diff_eq!(SampleFormat::U8.decode_le(&[0]), -1.0);
        assert_abs_diff_eq!(SampleFormat::U8.decode_le(&[128]), 0.0);
        assert_abs_diff_eq!(SampleFormat::I16.decode_le(&i16::MIN.to_le_bytes()), -1.0);
        assert_abs_diff_eq!(
            SampleFormat::I24.decode_le(&[0xFF, 0xFF, 0x7F]),
            1.0,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(SampleFormat::I24.decode_le(&[0x00, 0x00, 0x80]), -1.0);
        assert_abs_diff_eq!(SampleFormat::F64.decode_le(&0.5f64.to_le_bytes()), 0.5);
    }

    #[test]
    fn test_decode_buffer() {
        let mut bytes = Vec::new();
        for v in [0i16, 16_384, -16_384] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut out = [0.0; 4];
        let n = SampleFormat::I16.decode_buffer_le(&bytes, &mut out);
        assert_eq!(n, 3);
        assert_abs_diff_eq!(out[1], 0.5);
        assert_abs_diff_eq!(out[2], -0.5);
    }

    #[test]
    fn test_normalize_int() {
        assert_abs_diff_eq!(SampleFormat::I16.normalize_int(-32_768), -1.0);
        assert_abs_diff_eq!(SampleFormat::I24.normalize_int(4_194_304), 0.5);
    }
}
