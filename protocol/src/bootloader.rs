//! OTA chunk format, shared between the bridge's sender and the
//! controller's receive loop.
//!
//! A session rides the raw UART after the bootloader command is ACKed;
//! framed protocol traffic stops until it ends. Each chunk is:
//!
//! `[0x55][0xAA][chunk_number u32 LE][size u16 LE][data ...][xor]`
//!
//! with `size <= 256` and `xor` the XOR of the data bytes. The stream
//! ends with chunk_number `0xFFFFFFFF` carrying the two-byte payload
//! `0xAA 0x55`. The receiver answers every chunk with [`ACK_BYTE`] or
//! with [`ERROR_MARKER`] followed by an [`OtaError`] code, which also
//! aborts the session. The flashed image carries its CRC-32 (ISO-HDLC)
//! over all preceding bytes in its final four bytes, little-endian.

use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec;

/// Chunk start marker.
pub const CHUNK_MAGIC: [u8; 2] = [0x55, 0xAA];
/// Chunk number that ends the stream.
pub const END_CHUNK_NUMBER: u32 = 0xFFFF_FFFF;
/// Payload of the end-of-stream chunk.
pub const END_PAYLOAD: [u8; 2] = [0xAA, 0x55];
/// Largest data slice one chunk may carry.
pub const MAX_CHUNK_DATA: usize = 256;
/// magic + chunk_number + size.
pub const CHUNK_HEADER_LEN: usize = 8;
/// Largest encoded chunk (header + data + xor).
pub const MAX_CHUNK_LEN: usize = CHUNK_HEADER_LEN + MAX_CHUNK_DATA + 1;

/// Receiver's per-chunk success reply.
pub const ACK_BYTE: u8 = 0xCC;
/// Receiver's error reply; an [`OtaError`] code byte follows.
pub const ERROR_MARKER: u8 = 0xFF;

/// CRC-32 used to verify the assembled image.
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// In-band error codes of a bootloader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum OtaError {
    #[error("chunk or session timed out")]
    Timeout = 1,
    #[error("bad chunk magic")]
    BadMagic = 2,
    #[error("chunk size out of bounds")]
    BadSize = 3,
    #[error("unexpected chunk number or malformed chunk")]
    BadChunk = 4,
    #[error("chunk checksum mismatch")]
    Checksum = 5,
    #[error("flash write failed")]
    FlashWrite = 6,
    #[error("flash erase failed")]
    FlashErase = 7,
}

impl OtaError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Timeout,
            2 => Self::BadMagic,
            3 => Self::BadSize,
            4 => Self::BadChunk,
            5 => Self::Checksum,
            6 => Self::FlashWrite,
            7 => Self::FlashErase,
            _ => return None,
        })
    }
}

/// XOR checksum over a chunk's data bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// One encoded chunk.
pub type ChunkBuf = Vec<u8, MAX_CHUNK_LEN>;

/// Encode a data chunk (sender side).
pub fn encode_chunk(chunk_number: u32, data: &[u8]) -> Result<ChunkBuf, OtaError> {
    if data.len() > MAX_CHUNK_DATA {
        return Err(OtaError::BadSize);
    }
    let mut out = ChunkBuf::new();
    let _ = out.extend_from_slice(&CHUNK_MAGIC);
    let _ = out.extend_from_slice(&chunk_number.to_le_bytes());
    let _ = out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    let _ = out.extend_from_slice(data);
    let _ = out.push(xor_checksum(data));
    Ok(out)
}

/// Encode the end-of-stream marker chunk.
pub fn encode_end_marker() -> ChunkBuf {
    // Cannot fail: END_PAYLOAD is two bytes.
    encode_chunk(END_CHUNK_NUMBER, &END_PAYLOAD).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout() {
        let data = [0x11u8, 0x22, 0x33];
        let chunk = encode_chunk(5, &data).unwrap();
        assert_eq!(&chunk[..2], &CHUNK_MAGIC);
        assert_eq!(&chunk[2..6], &5u32.to_le_bytes());
        assert_eq!(&chunk[6..8], &3u16.to_le_bytes());
        assert_eq!(&chunk[8..11], &data);
        assert_eq!(chunk[11], 0x11 ^ 0x22 ^ 0x33);
        assert_eq!(chunk.len(), CHUNK_HEADER_LEN + 3 + 1);
    }

    #[test]
    fn empty_chunk_has_zero_checksum() {
        let chunk = encode_chunk(0, &[]).unwrap();
        assert_eq!(chunk.len(), CHUNK_HEADER_LEN + 1);
        assert_eq!(chunk[CHUNK_HEADER_LEN], 0);
    }

    #[test]
    fn oversized_chunk_is_refused() {
        let data = [0u8; MAX_CHUNK_DATA + 1];
        assert_eq!(encode_chunk(0, &data), Err(OtaError::BadSize));
    }

    #[test]
    fn end_marker_layout() {
        let chunk = encode_end_marker();
        assert_eq!(&chunk[2..6], &END_CHUNK_NUMBER.to_le_bytes());
        assert_eq!(&chunk[8..10], &END_PAYLOAD);
        assert_eq!(chunk[10], 0xAA ^ 0x55);
    }

    #[test]
    fn image_crc_check_value() {
        // Published check value for CRC-32/ISO-HDLC.
        assert_eq!(IMAGE_CRC.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn error_codes_round_trip() {
        for code in 1..=7u8 {
            assert_eq!(OtaError::from_code(code).unwrap().code(), code);
        }
        assert_eq!(OtaError::from_code(0), None);
        assert_eq!(OtaError::from_code(8), None);
    }
}
