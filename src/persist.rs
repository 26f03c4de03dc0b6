//! Checksummed weight persistence
//!
//! The weight file is the raw bytes of every weight buffer in declaration
//! order followed by a little-endian CRC32 of everything before it. A
//! restore verifies the checksum against host staging copies first and
//! copies to the live weights only on a match, so a damaged file never
//! half-overwrites a trained network.

use ash::vk;
use std::path::Path;

use crate::buffer::{Buffer, Residency, WeightVec};
use crate::error::NnError;
use crate::graph::Network;

const CRC_POLYNOMIAL: u32 = 0xEDB8_8320;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                CRC_POLYNOMIAL ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc32_table();

/// Streaming CRC32 (IEEE reflected polynomial).
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for byte in bytes {
            let idx = ((self.state ^ *byte as u32) & 0xFF) as usize;
            self.state = CRC_TABLE[idx] ^ (self.state >> 8);
        }
    }

    pub fn finalize(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finalize()
}

/// Concatenate weight chunks and append the trailing checksum.
pub fn encode_payload(chunks: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(total + 4);
    let mut crc = Crc32::new();
    for chunk in chunks {
        crc.update(chunk);
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&crc.finalize().to_le_bytes());
    out
}

/// Split a payload back into chunks of the expected lengths, verifying the
/// trailing checksum first.
///
/// A length mismatch is `InvalidDataLength` (the caller maps it to the file
/// error); a checksum mismatch is `CorruptedFile`. No chunk is returned in
/// either case.
pub fn decode_payload(bytes: &[u8], chunk_lens: &[usize]) -> Result<Vec<Vec<u8>>, NnError> {
    let total: usize = chunk_lens.iter().sum();
    if bytes.len() != total + 4 {
        return Err(NnError::InvalidDataLength);
    }
    let (body, tail) = bytes.split_at(total);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32(body) != stored {
        return Err(NnError::CorruptedFile);
    }

    let mut chunks = Vec::with_capacity(chunk_lens.len());
    let mut cursor = 0;
    for len in chunk_lens {
        chunks.push(body[cursor..cursor + len].to_vec());
        cursor += len;
    }
    Ok(chunks)
}

impl Network {
    /// Write every weight buffer to `path`, checksummed.
    pub fn dump(&self, path: &Path) -> Result<(), NnError> {
        let weights = self.weights();

        // Stage device copies of every weight in one submission
        let mut staging = Vec::with_capacity(weights.len());
        for (weight, _) in weights {
            staging.push(Buffer::<WeightVec>::new(
                self.context(),
                weight.len(),
                vk::BufferUsageFlags::TRANSFER_DST,
                Residency::Readback,
            )?);
        }
        self.context().one_shot(|cmd| {
            for ((weight, _), stage) in weights.iter().zip(&staging) {
                let region = vk::BufferCopy::default().size(weight.byte_len());
                unsafe {
                    self.context().device().cmd_copy_buffer(
                        cmd,
                        weight.handle(),
                        stage.handle(),
                        &[region],
                    );
                }
            }
            Ok(())
        })?;

        let mut chunks = Vec::with_capacity(staging.len());
        for stage in &staging {
            let mut host = vec![[0f32; 4]; stage.len()];
            stage.read_to(0, &mut host)?;
            chunks.push(bytemuck::cast_slice(&host).to_vec());
        }

        let payload = encode_payload(&chunks);
        std::fs::write(path, &payload)
            .map_err(|_| NnError::UnableToLoadFile(path.to_path_buf()))?;
        log::info!(
            "Dumped {} weight buffers ({} bytes) to {:?}",
            chunks.len(),
            payload.len(),
            path
        );
        Ok(())
    }

    /// Load every weight buffer from `path`.
    ///
    /// The checksum is verified before any copy to the live weights; on
    /// mismatch the network is left untouched.
    pub fn restore(&self, path: &Path) -> Result<(), NnError> {
        let weights = self.weights();
        let bytes =
            std::fs::read(path).map_err(|_| NnError::UnableToLoadFile(path.to_path_buf()))?;

        let chunk_lens: Vec<usize> = weights
            .iter()
            .map(|(weight, _)| weight.byte_len() as usize)
            .collect();
        let chunks = decode_payload(&bytes, &chunk_lens).map_err(|e| match e {
            NnError::InvalidDataLength => NnError::UnableToLoadFile(path.to_path_buf()),
            other => other,
        })?;

        let mut staging = Vec::with_capacity(weights.len());
        for ((weight, _), chunk) in weights.iter().zip(&chunks) {
            let stage = Buffer::<WeightVec>::new(
                self.context(),
                weight.len(),
                vk::BufferUsageFlags::TRANSFER_SRC,
                Residency::Upload,
            )?;
            let host: &[WeightVec] = bytemuck::cast_slice(chunk);
            stage.write_from(0, host)?;
            staging.push(stage);
        }

        self.context().one_shot(|cmd| {
            for ((weight, _), stage) in weights.iter().zip(&staging) {
                let region = vk::BufferCopy::default().size(weight.byte_len());
                unsafe {
                    self.context().device().cmd_copy_buffer(
                        cmd,
                        stage.handle(),
                        weight.handle(),
                        &[region],
                    );
                }
            }
            Ok(())
        })?;

        log::info!("Restored {} weight buffers from {:?}", weights.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_answer() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_crc32_streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut crc = Crc32::new();
        crc.update(&data[..10]);
        crc.update(&data[10..]);
        assert_eq!(crc.finalize(), crc32(data));
    }

    #[test]
    fn test_payload_round_trip() {
        let chunks = vec![vec![1u8, 2, 3, 4], vec![5u8; 16], vec![9u8, 8]];
        let payload = encode_payload(&chunks);
        assert_eq!(payload.len(), 4 + 16 + 2 + 4);

        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        let decoded = decode_payload(&payload, &lens).unwrap();
        assert_eq!(decoded, chunks);
    }

    #[test]
    fn test_payload_detects_corruption() {
        let chunks = vec![vec![7u8; 32]];
        let mut payload = encode_payload(&chunks);
        payload[5] ^= 0x01;
        assert!(matches!(
            decode_payload(&payload, &[32]),
            Err(NnError::CorruptedFile)
        ));
    }

    #[test]
    fn test_payload_detects_truncation() {
        let chunks = vec![vec![7u8; 32]];
        let payload = encode_payload(&chunks);
        assert!(matches!(
            decode_payload(&payload[..payload.len() - 1], &[32]),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_corrupted_checksum_field() {
        let chunks = vec![vec![3u8; 8]];
        let mut payload = encode_payload(&chunks);
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        assert!(matches!(
            decode_payload(&payload, &[8]),
            Err(NnError::CorruptedFile)
        ));
    }
}
