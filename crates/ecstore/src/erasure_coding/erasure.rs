// Copyright 2024 GarnetFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming Reed-Solomon erasure coding over the SIMD backend. Data is
//! processed in `block_size` stripes; every stripe yields one shard block
//! per drive, written through the bitrot framer.

use super::bitrot::{BitrotReader, BitrotWriterWrapper};
use crate::disk::error::{DiskError, Result};
use garnetfs_filemeta::calc_shard_size;
use std::io;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Reed-Solomon codec with cached SIMD encoder/decoder instances.
pub struct ReedSolomonCodec {
    data_shards: usize,
    parity_shards: usize,
    encoder_cache: RwLock<Option<reed_solomon_simd::ReedSolomonEncoder>>,
    decoder_cache: RwLock<Option<reed_solomon_simd::ReedSolomonDecoder>>,
}

impl ReedSolomonCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            encoder_cache: RwLock::new(None),
            decoder_cache: RwLock::new(None),
        }
    }

    /// Fills the parity shards from the data shards. All shards must have
    /// the same, even length.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> io::Result<()> {
        let shard_len = shards[0].len();

        let mut encoder = {
            let mut cache = self
                .encoder_cache
                .write()
                .map_err(|_| io::Error::other("encoder cache lock poisoned"))?;
            match cache.take() {
                Some(mut enc) => {
                    if let Err(e) = enc.reset(self.data_shards, self.parity_shards, shard_len) {
                        warn!("reed-solomon encoder reset failed: {:?}, creating new one", e);
                        reed_solomon_simd::ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_len)
                            .map_err(|e| io::Error::other(format!("encoder create failed: {e:?}")))?
                    } else {
                        enc
                    }
                }
                None => reed_solomon_simd::ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_len)
                    .map_err(|e| io::Error::other(format!("encoder create failed: {e:?}")))?,
            }
        };

        for shard in shards.iter().take(self.data_shards) {
            encoder
                .add_original_shard(shard)
                .map_err(|e| io::Error::other(format!("add shard failed: {e:?}")))?;
        }

        let result = encoder.encode().map_err(|e| io::Error::other(format!("encode failed: {e:?}")))?;

        for (i, recovery) in result.recovery_iter().enumerate() {
            if self.data_shards + i < shards.len() {
                shards[self.data_shards + i].copy_from_slice(recovery);
            }
        }
        drop(result);

        *self
            .encoder_cache
            .write()
            .map_err(|_| io::Error::other("encoder cache lock poisoned"))? = Some(encoder);

        Ok(())
    }

    /// Reconstructs the missing data shards in place from any
    /// `data_shards` survivors.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> io::Result<()> {
        let shard_len = shards
            .iter()
            .find_map(|s| s.as_ref().map(|v| v.len()))
            .ok_or_else(|| io::Error::other("no shards available for reconstruction"))?;

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(io::Error::other("not enough shards for reconstruction"));
        }

        let mut decoder = {
            let mut cache = self
                .decoder_cache
                .write()
                .map_err(|_| io::Error::other("decoder cache lock poisoned"))?;
            match cache.take() {
                Some(mut dec) => {
                    if let Err(e) = dec.reset(self.data_shards, self.parity_shards, shard_len) {
                        warn!("reed-solomon decoder reset failed: {:?}, creating new one", e);
                        reed_solomon_simd::ReedSolomonDecoder::new(self.data_shards, self.parity_shards, shard_len)
                            .map_err(|e| io::Error::other(format!("decoder create failed: {e:?}")))?
                    } else {
                        dec
                    }
                }
                None => reed_solomon_simd::ReedSolomonDecoder::new(self.data_shards, self.parity_shards, shard_len)
                    .map_err(|e| io::Error::other(format!("decoder create failed: {e:?}")))?,
            }
        };

        for (i, shard) in shards.iter().enumerate() {
            if let Some(shard) = shard {
                if i < self.data_shards {
                    decoder
                        .add_original_shard(i, shard)
                        .map_err(|e| io::Error::other(format!("add original failed: {e:?}")))?;
                } else {
                    decoder
                        .add_recovery_shard(i - self.data_shards, shard)
                        .map_err(|e| io::Error::other(format!("add recovery failed: {e:?}")))?;
                }
            }
        }

        let result = decoder.decode().map_err(|e| io::Error::other(format!("decode failed: {e:?}")))?;

        for (i, slot) in shards.iter_mut().enumerate() {
            if slot.is_none() && i < self.data_shards {
                for (restored_idx, restored) in result.restored_original_iter() {
                    if restored_idx == i {
                        *slot = Some(restored.to_vec());
                        break;
                    }
                }
            }
        }
        drop(result);

        *self
            .decoder_cache
            .write()
            .map_err(|_| io::Error::other("decoder cache lock poisoned"))? = Some(decoder);

        // Parity shards the caller asked for are re-derived from data.
        if shards.iter().skip(self.data_shards).any(|s| s.is_none()) {
            let mut full: Vec<Vec<u8>> = Vec::with_capacity(shards.len());
            for (i, s) in shards.iter().enumerate() {
                match s {
                    Some(v) => full.push(v.clone()),
                    None if i < self.data_shards => return Err(io::Error::other("data shard still missing")),
                    None => full.push(vec![0u8; shard_len]),
                }
            }
            self.encode(&mut full)?;
            for (i, slot) in shards.iter_mut().enumerate().skip(self.data_shards) {
                if slot.is_none() {
                    *slot = Some(full[i].clone());
                }
            }
        }

        Ok(())
    }
}

/// Erasure context for one object: geometry plus the codec.
pub struct Erasure {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub block_size: usize,
    codec: ReedSolomonCodec,
}

impl Erasure {
    pub fn new(data_shards: usize, parity_shards: usize, block_size: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            block_size,
            codec: ReedSolomonCodec::new(data_shards, parity_shards),
        }
    }

    pub fn shard_size(&self) -> usize {
        calc_shard_size(self.block_size, self.data_shards)
    }

    /// On-disk payload size of one drive's shard file for an object of
    /// `total_length` bytes (excluding bitrot framing).
    pub fn shard_file_size(&self, total_length: i64) -> i64 {
        if total_length <= 0 {
            return total_length;
        }
        let total_length = total_length as usize;
        let num_shards = total_length / self.block_size;
        let last_block_size = total_length % self.block_size;
        let last_shard_size = calc_shard_size(last_block_size, self.data_shards);
        (num_shards * self.shard_size() + last_shard_size) as i64
    }

    /// Splits one stripe into even-sized shards, zero padded.
    pub fn split_stripe(&self, stripe: &[u8]) -> Vec<Vec<u8>> {
        let shard_len = calc_shard_size(stripe.len(), self.data_shards);
        let mut shards = Vec::with_capacity(self.data_shards + self.parity_shards);
        for i in 0..self.data_shards {
            let start = (i * shard_len).min(stripe.len());
            let end = ((i + 1) * shard_len).min(stripe.len());
            let mut shard = stripe[start..end].to_vec();
            shard.resize(shard_len, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; shard_len]);
        }
        shards
    }

    /// Streams `total_size` bytes from `reader` through the encoder into
    /// the per-drive writers. Tolerates writer failures down to `quorum`
    /// live drives. Returns the number of payload bytes consumed.
    pub async fn encode_stream<R>(
        &self,
        reader: &mut R,
        writers: &mut [Option<BitrotWriterWrapper>],
        total_size: i64,
        quorum: usize,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut remaining = total_size.max(0) as u64;
        let mut written = 0u64;

        loop {
            let stripe_len = if total_size < 0 {
                self.block_size
            } else {
                (remaining as usize).min(self.block_size)
            };
            if stripe_len == 0 && written > 0 {
                break;
            }

            let mut stripe = vec![0u8; stripe_len];
            let mut filled = 0usize;
            while filled < stripe_len {
                let n = reader.read(&mut stripe[filled..]).await.map_err(DiskError::from)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            stripe.truncate(filled);

            if stripe.is_empty() {
                break;
            }

            let mut shards = self.split_stripe(&stripe);
            self.codec.encode(&mut shards).map_err(DiskError::other)?;

            let mut online = 0usize;
            for (i, writer) in writers.iter_mut().enumerate() {
                if let Some(w) = writer {
                    match w.write(&shards[i]).await {
                        Ok(_) => online += 1,
                        Err(err) => {
                            warn!("shard write failed on drive {}: {}", i, err);
                            *writer = None;
                        }
                    }
                }
            }
            if online < quorum {
                return Err(DiskError::ErasureWriteQuorum);
            }

            written += stripe.len() as u64;
            remaining = remaining.saturating_sub(stripe.len() as u64);

            if total_size >= 0 && remaining == 0 {
                break;
            }
            if (stripe.len() as u64) < self.block_size as u64 && total_size < 0 {
                break;
            }
            if total_size == 0 {
                break;
            }
        }

        for writer in writers.iter_mut().flatten() {
            writer.shutdown().await?;
        }

        Ok(written)
    }

    /// Streams the byte range `[offset, offset+length)` of an object of
    /// `total_length` bytes into `writer`, reconstructing missing shards
    /// from parity when drives are gone or corrupt.
    pub async fn decode_stream<W>(
        &self,
        writer: &mut W,
        readers: &mut [Option<BitrotReader>],
        offset: u64,
        length: u64,
        total_length: u64,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if length == 0 {
            return Ok(0);
        }
        if offset + length > total_length {
            return Err(DiskError::LessData);
        }

        let start_block = (offset as usize) / self.block_size;
        let end_block = ((offset + length - 1) as usize) / self.block_size;

        let mut written = 0u64;

        // Readers are positioned at the first needed stripe by the
        // caller; we still walk stripes from there in order.
        for block in start_block..=end_block {
            let block_start = block * self.block_size;
            let block_len = (total_length as usize - block_start).min(self.block_size);
            let shard_len = calc_shard_size(block_len, self.data_shards);

            let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(readers.len());
            let mut available = 0usize;
            for reader in readers.iter_mut() {
                match reader {
                    Some(r) => match r.read_block(shard_len).await {
                        Ok(shard) => {
                            available += 1;
                            shards.push(Some(shard));
                        }
                        Err(err) => {
                            warn!("shard read failed: {}", err);
                            *reader = None;
                            shards.push(None);
                        }
                    },
                    None => shards.push(None),
                }
            }

            if available < self.data_shards {
                return Err(DiskError::ErasureReadQuorum);
            }

            if shards.iter().take(self.data_shards).any(|s| s.is_none()) {
                self.codec.reconstruct(&mut shards).map_err(DiskError::other)?;
            }

            let mut stripe = Vec::with_capacity(shard_len * self.data_shards);
            for shard in shards.into_iter().take(self.data_shards) {
                stripe.extend_from_slice(&shard.unwrap_or_default());
            }
            stripe.truncate(block_len);

            // Clip the stripe to the requested range.
            let range_start = (offset as usize).max(block_start) - block_start;
            let range_end = ((offset + length) as usize).min(block_start + block_len) - block_start;
            if range_start < range_end {
                writer
                    .write_all(&stripe[range_start..range_end])
                    .await
                    .map_err(DiskError::from)?;
                written += (range_end - range_start) as u64;
            }
        }

        writer.flush().await.map_err(DiskError::from)?;
        Ok(written)
    }

    /// Re-encodes one stripe worth of shards, filling the slots listed in
    /// `missing` for healing.
    pub fn heal_stripe(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.codec.reconstruct(shards).map_err(DiskError::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure_coding::bitrot::BitrotReader;
    use garnetfs_utils::HashAlgorithm;
    use std::io::Cursor;

    fn encode_to_buffers(erasure: &Erasure, data: &[u8], drives: usize) -> Vec<Vec<u8>> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut writers: Vec<Option<BitrotWriterWrapper>> = (0..drives)
                .map(|_| Some(BitrotWriterWrapper::new_inline(HashAlgorithm::HighwayHash256)))
                .collect();
            let mut reader = Cursor::new(data.to_vec());
            let n = erasure
                .encode_stream(&mut reader, &mut writers, data.len() as i64, drives)
                .await
                .unwrap();
            assert_eq!(n, data.len() as u64);
            writers
                .into_iter()
                .map(|w| w.unwrap().into_inline_data().unwrap())
                .collect()
        })
    }

    fn decode_from_buffers(erasure: &Erasure, buffers: Vec<Option<Vec<u8>>>, offset: u64, length: u64, total: u64) -> Vec<u8> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut readers: Vec<Option<BitrotReader>> = buffers
                .into_iter()
                .map(|buf| {
                    buf.map(|b| {
                        BitrotReader::new(
                            Box::new(Cursor::new(b)) as Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>,
                            erasure.shard_size(),
                            HashAlgorithm::HighwayHash256,
                        )
                    })
                })
                .collect();
            let mut out = Vec::new();
            erasure
                .decode_stream(&mut out, &mut readers, offset, length, total)
                .await
                .unwrap();
            out
        })
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let erasure = Erasure::new(4, 2, 1024);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let buffers = encode_to_buffers(&erasure, &data, 6);

        let got = decode_from_buffers(
            &erasure,
            buffers.into_iter().map(Some).collect(),
            0,
            data.len() as u64,
            data.len() as u64,
        );
        assert_eq!(got, data);
    }

    #[test]
    fn test_decode_survives_parity_many_losses() {
        let erasure = Erasure::new(4, 2, 1024);
        let data: Vec<u8> = (0..5_000u32).map(|i| (i % 199) as u8).collect();
        let buffers = encode_to_buffers(&erasure, &data, 6);

        // Drop two drives, one data and one parity.
        let mut with_loss: Vec<Option<Vec<u8>>> = buffers.into_iter().map(Some).collect();
        with_loss[0] = None;
        with_loss[5] = None;

        let got = decode_from_buffers(&erasure, with_loss, 0, data.len() as u64, data.len() as u64);
        assert_eq!(got, data);
    }

    #[test]
    fn test_decode_fails_below_quorum() {
        let erasure = Erasure::new(4, 2, 1024);
        let data = vec![7u8; 2048];
        let buffers = encode_to_buffers(&erasure, &data, 6);

        let mut with_loss: Vec<Option<Vec<u8>>> = buffers.into_iter().map(Some).collect();
        with_loss[0] = None;
        with_loss[1] = None;
        with_loss[2] = None;

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let err = rt.block_on(async {
            let mut readers: Vec<Option<BitrotReader>> = with_loss
                .into_iter()
                .map(|buf| {
                    buf.map(|b| {
                        BitrotReader::new(
                            Box::new(Cursor::new(b)) as Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>,
                            erasure.shard_size(),
                            HashAlgorithm::HighwayHash256,
                        )
                    })
                })
                .collect();
            let mut out = Vec::new();
            erasure
                .decode_stream(&mut out, &mut readers, 0, data.len() as u64, data.len() as u64)
                .await
        });
        assert!(matches!(err, Err(DiskError::ErasureReadQuorum)));
    }

    #[test]
    fn test_range_decode() {
        let erasure = Erasure::new(4, 2, 512);
        let data: Vec<u8> = (0..3_000u32).map(|i| (i % 173) as u8).collect();
        let buffers = encode_to_buffers(&erasure, &data, 6);

        // Whole-object readers, range clipped by the decoder.
        let got = decode_from_buffers(&erasure, buffers.into_iter().map(Some).collect(), 0, 1000, data.len() as u64);
        assert_eq!(got, &data[..1000]);
    }
}
