//! Fixed-width numeric framing for byte payloads.
//!
//! The lattice scheme encrypts vectors of whole numbers. Payloads are
//! framed as a 4-byte little-endian length followed by the bytes, one byte
//! per slot, zero-padded to a multiple of [`BLOCK_WIDTH`] so ciphertext
//! length leaks only a coarse size class.
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬──────────────┐
//! │ len (4 × u8) │ payload bytes            │ zero padding │
//! └──────────────┴──────────────────────────┴──────────────┘
//!   each slot holds one byte as an f64 in 0..=255
//! ```

use crate::error::{Error, Result};

/// Slot count granularity of an encoded buffer
pub const BLOCK_WIDTH: usize = 32;

const LENGTH_PREFIX: usize = 4;

/// Frame bytes into a fixed-width numeric buffer
pub fn encode_bytes(payload: &[u8]) -> Result<Vec<f64>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::SerializationError("Payload too large to frame".into()))?;

    let framed_len = LENGTH_PREFIX + payload.len();
    let padded_len = framed_len.div_ceil(BLOCK_WIDTH) * BLOCK_WIDTH;

    let mut buffer = Vec::with_capacity(padded_len);
    buffer.extend(len.to_le_bytes().iter().map(|&b| f64::from(b)));
    buffer.extend(payload.iter().map(|&b| f64::from(b)));
    buffer.resize(padded_len, 0.0);
    Ok(buffer)
}

/// Recover the bytes framed by [`encode_bytes`]
///
/// Any slot outside `0..=255` or a length prefix that overruns the buffer
/// means the buffer was not produced by this codec under the right key.
pub fn decode_bytes(buffer: &[f64]) -> Result<Vec<u8>> {
    if buffer.len() < LENGTH_PREFIX || buffer.len() % BLOCK_WIDTH != 0 {
        return Err(Error::DecryptionFailed(format!(
            "Buffer length {} is not a framed payload",
            buffer.len()
        )));
    }

    let bytes = buffer
        .iter()
        .map(|&slot| to_byte(slot))
        .collect::<Result<Vec<u8>>>()?;

    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&bytes[..LENGTH_PREFIX]);
    let len = u32::from_le_bytes(prefix) as usize;

    let end = LENGTH_PREFIX
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::DecryptionFailed("Length prefix overruns buffer".into()))?;

    if bytes[end..].iter().any(|&b| b != 0) {
        return Err(Error::DecryptionFailed("Non-zero padding".into()));
    }

    Ok(bytes[LENGTH_PREFIX..end].to_vec())
}

fn to_byte(slot: f64) -> Result<u8> {
    if slot.fract() == 0.0 && (0.0..=255.0).contains(&slot) {
        Ok(slot as u8)
    } else {
        Err(Error::DecryptionFailed(format!("Slot value {} is not a byte", slot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_padding() {
        let payload = br#"{"userId":"u-1","score":12}"#;
        let buffer = encode_bytes(payload).unwrap();

        assert_eq!(buffer.len() % BLOCK_WIDTH, 0);
        assert_eq!(decode_bytes(&buffer).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let buffer = encode_bytes(&[]).unwrap();
        assert_eq!(buffer.len(), BLOCK_WIDTH);
        assert!(decode_bytes(&buffer).unwrap().is_empty());
    }

    #[test]
    fn test_exact_block_boundary() {
        let payload = vec![9u8; BLOCK_WIDTH - LENGTH_PREFIX];
        let buffer = encode_bytes(&payload).unwrap();
        assert_eq!(buffer.len(), BLOCK_WIDTH);
        assert_eq!(decode_bytes(&buffer).unwrap(), payload);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut buffer = encode_bytes(b"hello").unwrap();
        buffer[5] = 300.0;
        assert_eq!(decode_bytes(&buffer).unwrap_err().code(), "DECRYPTION_FAILED");

        let mut buffer = encode_bytes(b"hello").unwrap();
        buffer[0] = 200.0; // length prefix larger than the buffer
        assert!(decode_bytes(&buffer).is_err());

        assert!(decode_bytes(&[1.0, 2.0]).is_err());
    }
}
