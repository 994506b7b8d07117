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

//! Bitrot framing: every erasure shard block is written with its checksum
//! ahead of it, so silent corruption is caught at read time block by
//! block instead of whole-file.

use crate::disk::error::{DiskError, Result};
use garnetfs_utils::HashAlgorithm;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

enum BitrotSink {
    Inline(Vec<u8>),
    Stream(Box<dyn AsyncWrite + Send + Sync + Unpin>),
}

/// Writer of checksum-framed shard blocks. One `write` call per shard
/// block; callers never split a block across calls.
pub struct BitrotWriterWrapper {
    sink: BitrotSink,
    algo: HashAlgorithm,
    written: usize,
}

impl BitrotWriterWrapper {
    pub fn new_inline(algo: HashAlgorithm) -> Self {
        Self {
            sink: BitrotSink::Inline(Vec::new()),
            algo,
            written: 0,
        }
    }

    pub fn new_stream(writer: Box<dyn AsyncWrite + Send + Sync + Unpin>, algo: HashAlgorithm) -> Self {
        Self {
            sink: BitrotSink::Stream(writer),
            algo,
            written: 0,
        }
    }

    pub async fn write(&mut self, block: &[u8]) -> Result<usize> {
        let sum = self.algo.hash_encode(block);
        match &mut self.sink {
            BitrotSink::Inline(buf) => {
                buf.extend_from_slice(&sum);
                buf.extend_from_slice(block);
            }
            BitrotSink::Stream(w) => {
                w.write_all(&sum).await.map_err(DiskError::from)?;
                w.write_all(block).await.map_err(DiskError::from)?;
            }
        }
        self.written += block.len();
        Ok(block.len())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let BitrotSink::Stream(w) = &mut self.sink {
            w.flush().await.map_err(DiskError::from)?;
            w.shutdown().await.map_err(DiskError::from)?;
        }
        Ok(())
    }

    /// Bytes of payload written, excluding checksum framing.
    pub fn payload_written(&self) -> usize {
        self.written
    }

    pub fn into_inline_data(self) -> Option<Vec<u8>> {
        match self.sink {
            BitrotSink::Inline(buf) => Some(buf),
            BitrotSink::Stream(_) => None,
        }
    }
}

/// Reader of checksum-framed shard blocks; verifies every block before
/// handing it out.
pub struct BitrotReader {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    algo: HashAlgorithm,
}

impl BitrotReader {
    pub fn new(reader: Box<dyn AsyncRead + Send + Sync + Unpin>, _shard_size: usize, algo: HashAlgorithm) -> Self {
        Self { reader, algo }
    }

    /// Reads one block of exactly `len` payload bytes and verifies it.
    pub async fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut sum = vec![0u8; self.algo.size()];
        self.reader.read_exact(&mut sum).await.map_err(DiskError::from)?;

        let mut block = vec![0u8; len];
        self.reader.read_exact(&mut block).await.map_err(DiskError::from)?;

        if self.algo.hash_encode(&block) != sum {
            return Err(DiskError::FileCorrupt);
        }
        Ok(block)
    }
}

/// On-disk size of `payload` bytes once framed.
pub fn bitrot_shard_file_size(payload: usize, shard_size: usize, algo: &HashAlgorithm) -> usize {
    if payload == 0 {
        return 0;
    }
    payload.div_ceil(shard_size) * algo.size() + payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_write_then_read_verifies() {
        let algo = HashAlgorithm::HighwayHash256;
        let mut w = BitrotWriterWrapper::new_inline(algo.clone());
        w.write(b"hello world").await.unwrap();
        w.write(b"second block").await.unwrap();
        let buf = w.into_inline_data().unwrap();

        let mut r = BitrotReader::new(Box::new(Cursor::new(buf)), 16, algo);
        assert_eq!(r.read_block(11).await.unwrap(), b"hello world");
        assert_eq!(r.read_block(12).await.unwrap(), b"second block");
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let algo = HashAlgorithm::HighwayHash256;
        let mut w = BitrotWriterWrapper::new_inline(algo.clone());
        w.write(b"hello world").await.unwrap();
        let mut buf = w.into_inline_data().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut r = BitrotReader::new(Box::new(Cursor::new(buf)), 16, algo);
        assert!(matches!(r.read_block(11).await, Err(DiskError::FileCorrupt)));
    }

    #[test]
    fn test_shard_file_size() {
        let algo = HashAlgorithm::HighwayHash256;
        assert_eq!(bitrot_shard_file_size(0, 16, &algo), 0);
        assert_eq!(bitrot_shard_file_size(16, 16, &algo), 16 + 32);
        assert_eq!(bitrot_shard_file_size(17, 16, &algo), 17 + 64);
    }
}
