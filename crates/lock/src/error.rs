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

pub type Result<T> = core::result::Result<T, LockError>;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock acquisition timed out after {0:?} for resource {1}")]
    Timeout(std::time::Duration, String),

    #[error("lock quorum not met: {granted} of {total} peers granted, need {quorum}")]
    QuorumNotMet { granted: usize, total: usize, quorum: usize },

    #[error("lock lease lost for resource {0}")]
    LeaseLost(String),

    #[error("lock not held by owner {0}")]
    NotHeld(String),

    #[error("internal lock error: {0}")]
    Internal(String),
}

impl LockError {
    pub fn internal<E: ToString>(err: E) -> Self {
        LockError::Internal(err.to_string())
    }
}
