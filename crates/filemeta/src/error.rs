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

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file not found")]
    FileNotFound,

    #[error("file version not found")]
    FileVersionNotFound,

    #[error("file is corrupted")]
    FileCorrupt,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("done for now")]
    DoneForNow,

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    pub fn other<E: ToString>(err: E) -> Self {
        Error::Unexpected(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::other(err)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(_err: rmp_serde::decode::Error) -> Self {
        Error::FileCorrupt
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Unexpected(a), Error::Unexpected(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}
