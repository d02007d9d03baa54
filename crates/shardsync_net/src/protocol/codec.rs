//! # Compressor and Cipher Plug-ins
//!
//! The transport engine treats both as black boxes:
//! - a [`Compressor`] is engine-wide and runs once per packet group
//! - a [`Cipher`] is per connection and negotiated by a handshake on the
//!   first received bytes
//!
//! Without a compressor, bytes pass through untouched. Without a cipher
//! factory, every connection starts in plain mode.

use crate::error::CodecError;

/// Result of one decompression step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Decompressed {
    /// Input bytes used. Zero means the input holds no complete unit yet.
    pub consumed: usize,
    /// Output bytes produced.
    pub produced: usize,
}

/// Engine-wide wire compressor.
pub trait Compressor: Send + Sync {
    /// Appends the compressed form of `input` to `output`.
    ///
    /// Returns the number of bytes appended.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the input cannot be encoded.
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CodecError>;

    /// Decompresses as many complete units of `input` as fit in `output`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on corrupt input.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<Decompressed, CodecError>;
}

/// Frame header: compressed length then raw length, both big-endian `u32`.
const LZ4_FRAME_HEADER: usize = 8;

/// LZ4 block compressor with length-framed blocks.
///
/// ```text
/// ┌──────────────────┬────────────┬────────────────────┐
/// │ compressed: u32  │ raw: u32   │ lz4 block          │
/// └──────────────────┴────────────┴────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CodecError> {
        let start = output.len();
        let bound = lz4_flex::block::get_maximum_output_size(input.len());
        output.resize(start + LZ4_FRAME_HEADER + bound, 0);

        let written = lz4_flex::block::compress_into(input, &mut output[start + LZ4_FRAME_HEADER..])
            .map_err(|e| CodecError::Corrupt(e.to_string()))?;

        let compressed = u32::try_from(written).map_err(|_| CodecError::Corrupt("block too large".into()))?;
        let raw = u32::try_from(input.len()).map_err(|_| CodecError::Corrupt("block too large".into()))?;
        output[start..start + 4].copy_from_slice(&compressed.to_be_bytes());
        output[start + 4..start + 8].copy_from_slice(&raw.to_be_bytes());
        output.truncate(start + LZ4_FRAME_HEADER + written);

        Ok(LZ4_FRAME_HEADER + written)
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<Decompressed, CodecError> {
        let mut result = Decompressed::default();

        while input.len() - result.consumed >= LZ4_FRAME_HEADER {
            let frame = &input[result.consumed..];
            let compressed = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            let raw = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;

            if frame.len() < LZ4_FRAME_HEADER + compressed {
                break;
            }
            let available = output.len() - result.produced;
            if raw > available {
                if result.produced == 0 {
                    return Err(CodecError::OutputTooSmall { needed: raw, available });
                }
                break;
            }

            let block = &frame[LZ4_FRAME_HEADER..LZ4_FRAME_HEADER + compressed];
            let target = &mut output[result.produced..result.produced + raw];
            let produced = lz4_flex::block::decompress_into(block, target)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            if produced != raw {
                return Err(CodecError::Corrupt(format!(
                    "frame announced {raw} bytes, block held {produced}"
                )));
            }

            result.consumed += LZ4_FRAME_HEADER + compressed;
            result.produced += produced;
        }

        Ok(result)
    }
}

/// Outcome of the per-connection encryption handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherInit {
    /// Encrypt and decrypt from now on; `consumed` handshake bytes are dropped.
    UseCipher {
        /// Handshake bytes to drop.
        consumed: usize,
    },
    /// The peer speaks plain; `consumed` handshake bytes are dropped.
    NoCipher {
        /// Handshake bytes to drop.
        consumed: usize,
    },
    /// The handshake is not complete yet.
    NeedMoreData,
    /// The handshake is not recognized; close the connection.
    Invalid,
}

/// Per-connection stream cipher.
pub trait Cipher: Send {
    /// Inspects the first received bytes.
    fn init(&mut self, input: &[u8]) -> CipherInit;

    /// Encrypts `input` into `output` and returns the bytes written.
    ///
    /// `output` is at least as long as `input`.
    fn encrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize;

    /// Decrypts `input` into `output` and returns the bytes written.
    ///
    /// `output` is at least as long as `input`.
    fn decrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize;
}

/// Builds one cipher per connection.
pub trait CipherFactory: Send + Sync {
    /// Creates the cipher for a new connection.
    fn create(&self) -> Box<dyn Cipher>;
}

/// Encryption phase of one connection.
pub enum CipherSlot {
    /// Waiting for the handshake.
    Pending(Box<dyn Cipher>),
    /// Handshake chose encryption.
    Active(Box<dyn Cipher>),
    /// No encryption.
    Plain,
}

impl CipherSlot {
    /// Returns true once the handshake has completed (or none was needed).
    #[inline]
    #[must_use]
    pub const fn is_negotiated(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }

    /// Returns true if traffic is encrypted.
    #[inline]
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Applies the handshake result.
    pub(crate) fn resolve(&mut self, use_cipher: bool) {
        let previous = std::mem::replace(self, Self::Plain);
        *self = match previous {
            Self::Pending(cipher) | Self::Active(cipher) if use_cipher => Self::Active(cipher),
            _ => Self::Plain,
        };
    }
}

impl std::fmt::Debug for CipherSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending(_) => "Pending",
            Self::Active(_) => "Active",
            Self::Plain => "Plain",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lz4_frames_decompress() {
        let lz4 = Lz4Compressor;
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();

        let mut wire = Vec::new();
        let n = lz4.compress(&payload, &mut wire).unwrap();
        assert_eq!(n, wire.len());
        assert!(wire.len() < payload.len());

        let mut out = vec![0u8; 4096];
        let d = lz4.decompress(&wire, &mut out).unwrap();
        assert_eq!(d.consumed, wire.len());
        assert_eq!(&out[..d.produced], &payload[..]);
    }

    #[test]
    fn test_lz4_partial_frame_needs_more() {
        let lz4 = Lz4Compressor;
        let mut wire = Vec::new();
        lz4.compress(b"hello hello hello", &mut wire).unwrap();

        let mut out = [0u8; 64];
        let d = lz4.decompress(&wire[..wire.len() - 1], &mut out).unwrap();
        assert_eq!(d, Decompressed::default());
    }

    #[test]
    fn test_lz4_stops_when_output_is_full() {
        let lz4 = Lz4Compressor;
        let mut wire = Vec::new();
        lz4.compress(&[1u8; 40], &mut wire).unwrap();
        let first = wire.len();
        lz4.compress(&[2u8; 40], &mut wire).unwrap();

        let mut out = [0u8; 60];
        let d = lz4.decompress(&wire, &mut out).unwrap();
        assert_eq!(d.consumed, first);
        assert_eq!(d.produced, 40);
    }

    #[test]
    fn test_cipher_slot_resolve() {
        struct Identity;
        impl Cipher for Identity {
            fn init(&mut self, _: &[u8]) -> CipherInit {
                CipherInit::NoCipher { consumed: 0 }
            }
            fn encrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize {
                output[..input.len()].copy_from_slice(input);
                input.len()
            }
            fn decrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize {
                self.encrypt(input, output)
            }
        }

        let mut slot = CipherSlot::Pending(Box::new(Identity));
        assert!(!slot.is_negotiated());
        slot.resolve(true);
        assert!(slot.is_encrypted());

        let mut slot = CipherSlot::Pending(Box::new(Identity));
        slot.resolve(false);
        assert!(slot.is_negotiated());
        assert!(!slot.is_encrypted());
    }
}
