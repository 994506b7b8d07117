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

use highway::{HighwayHash, HighwayHasher, Key};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use siphasher::sip::SipHasher24;
use std::hash::Hasher as _;

/// Key used to derive set placement from object names. Changing it breaks
/// every existing deployment, treat it as part of the on-disk format.
pub const DEFAULT_SIP_HASH_KEY: [u8; 16] = [0u8; 16];

/// Hash algorithms understood by the bitrot layer.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub enum HashAlgorithm {
    #[default]
    None,
    Md5,
    Sha256,
    /// Streaming highwayhash, one checksum per erasure shard block.
    HighwayHash256,
    /// Whole-shard highwayhash kept for reading older metadata.
    HighwayHash256S,
}

impl HashAlgorithm {
    /// Size in bytes of the checksum this algorithm emits.
    pub fn size(&self) -> usize {
        match self {
            HashAlgorithm::None => 0,
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::HighwayHash256 | HashAlgorithm::HighwayHash256S => 32,
        }
    }

    pub fn hash_encode(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::None => Vec::new(),
            HashAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }
            HashAlgorithm::HighwayHash256 | HashAlgorithm::HighwayHash256S => {
                let mut hasher = HighwayHasher::new(Key([0, 0, 0, 0]));
                hasher.append(data);
                let out = hasher.finalize256();
                let mut buf = Vec::with_capacity(32);
                for v in out {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                buf
            }
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, HashAlgorithm::None)
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HashAlgorithm::None => "",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::HighwayHash256 => "highwayhash256",
            HashAlgorithm::HighwayHash256S => "highwayhash256S",
        };
        write!(f, "{s}")
    }
}

/// Maps a key onto `[0, cardinality)` with SipHash-2-4 keyed by the
/// deployment id. Used for set placement and worker selection.
pub fn sip_hash(key: &str, cardinality: usize, id: &[u8]) -> usize {
    let mut sip_key = [0u8; 16];
    let n = id.len().min(16);
    sip_key[..n].copy_from_slice(&id[..n]);

    let mut hasher = SipHasher24::new_with_key(&sip_key);
    hasher.write(key.as_bytes());
    (hasher.finish() as usize) % cardinality
}

/// Legacy v1 placement hash.
pub fn crc_hash(key: &str, cardinality: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % cardinality
}

/// Hex-encoded SHA-256, used to shard the multipart namespace.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sizes() {
        assert_eq!(HashAlgorithm::HighwayHash256.size(), 32);
        assert_eq!(HashAlgorithm::Md5.size(), 16);
        assert_eq!(HashAlgorithm::None.size(), 0);
    }

    #[test]
    fn test_highway_is_deterministic() {
        let a = HashAlgorithm::HighwayHash256.hash_encode(b"hello");
        let b = HashAlgorithm::HighwayHash256.hash_encode(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, HashAlgorithm::HighwayHash256.hash_encode(b"world"));
    }

    #[test]
    fn test_sip_hash_stable_and_bounded() {
        let id = b"f2dff355-7c3f-4b8a-9c1a-8a6e3c6e9d2a";
        for cardinality in [1usize, 4, 16] {
            let v = sip_hash("bucket/object", cardinality, id);
            assert!(v < cardinality);
            assert_eq!(v, sip_hash("bucket/object", cardinality, id));
        }
    }

    #[test]
    fn test_crc_hash_bounded() {
        assert!(crc_hash("bucket/object", 7) < 7);
    }
}
