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

//! Quorum reduction over per-drive results. Benign per-drive failures are
//! ignored, the remainder is counted and only the majority verdict is
//! surfaced above the erasure boundary.

use super::error::Error;

/// Errors a single drive may report without affecting an object operation.
pub static OBJECT_OP_IGNORED_ERRS: &[Error] = &[
    Error::DiskNotFound,
    Error::FaultyDisk,
    Error::FaultyRemoteDisk,
    Error::DiskAccessDenied,
    Error::DiskOngoingReq,
    Error::UnformattedDisk,
];

/// Bucket-metadata reads additionally tolerate a missing volume on
/// individual drives.
pub static BUCKET_OP_IGNORED_ERRS: &[Error] = &[
    Error::DiskNotFound,
    Error::FaultyDisk,
    Error::FaultyRemoteDisk,
    Error::DiskAccessDenied,
    Error::UnformattedDisk,
    Error::VolumeNotFound,
];

pub static BASE_IGNORED_ERRS: &[Error] = &[Error::DiskNotFound, Error::FaultyDisk, Error::FaultyRemoteDisk];

pub fn reduce_write_quorum_errs(errors: &[Option<Error>], ignored_errs: &[Error], quorum: usize) -> Option<Error> {
    reduce_quorum_errs(errors, ignored_errs, quorum, Error::ErasureWriteQuorum)
}

pub fn reduce_read_quorum_errs(errors: &[Option<Error>], ignored_errs: &[Error], quorum: usize) -> Option<Error> {
    reduce_quorum_errs(errors, ignored_errs, quorum, Error::ErasureReadQuorum)
}

pub fn reduce_quorum_errs(errors: &[Option<Error>], ignored_errs: &[Error], quorum: usize, quorum_err: Error) -> Option<Error> {
    let (max_count, err) = reduce_errs(errors, ignored_errs);
    if max_count >= quorum { err } else { Some(quorum_err) }
}

/// Returns the most frequent outcome and its count. `None` entries stand
/// for success; on a tie success wins so a split vote never fails an
/// otherwise healthy operation.
pub fn reduce_errs(errors: &[Option<Error>], ignored_errs: &[Error]) -> (usize, Option<Error>) {
    let nil_count = errors.iter().filter(|e| e.is_none()).count();

    let err_counts = errors
        .iter()
        .filter_map(|e| e.as_ref())
        .fold(std::collections::HashMap::new(), |mut acc, e| {
            if is_ignored_err(ignored_errs, e) {
                return acc;
            }
            *acc.entry(e.clone()).or_insert(0usize) += 1;
            acc
        });

    let (best_err, best_count) = err_counts
        .into_iter()
        .max_by(|(_, c1), (_, c2)| c1.cmp(c2))
        .map(|(e, c)| (Some(e), c))
        .unwrap_or((None, 0));

    if nil_count >= best_count {
        (nil_count, None)
    } else {
        (best_count, best_err)
    }
}

pub fn is_ignored_err(ignored_errs: &[Error], err: &Error) -> bool {
    ignored_errs.iter().any(|e| e == err)
}

pub fn count_errs(errors: &[Option<Error>], err: &Error) -> usize {
    errors.iter().filter(|&e| e.as_ref() == Some(err)).count()
}

/// True when every drive reports the bucket (or the drive itself) gone.
pub fn is_all_buckets_not_found(errs: &[Option<Error>]) -> bool {
    if errs.is_empty() {
        return false;
    }
    for err in errs.iter() {
        match err {
            Some(Error::DiskNotFound) | Some(Error::VolumeNotFound) => continue,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_io(msg: &str) -> Error {
        Error::Io(std::io::Error::other(msg))
    }

    #[test]
    fn test_reduce_errs_majority() {
        let e1 = err_io("a");
        let e2 = err_io("b");
        let errors = vec![Some(e1.clone()), Some(e1.clone()), Some(e2.clone()), None];
        let (count, err) = reduce_errs(&errors, &[]);
        assert_eq!(count, 2);
        assert_eq!(err, Some(e1));
    }

    #[test]
    fn test_reduce_errs_ignores_benign() {
        let errors = vec![
            Some(Error::DiskNotFound),
            Some(Error::UnformattedDisk),
            Some(Error::FileNotFound),
            None,
        ];
        let (count, err) = reduce_errs(&errors, OBJECT_OP_IGNORED_ERRS);
        // FileNotFound and success tie at one; success wins.
        assert_eq!(count, 1);
        assert_eq!(err, None);
    }

    #[test]
    fn test_reduce_quorum_errs() {
        let e1 = err_io("a");
        let errors = vec![Some(e1.clone()), Some(e1.clone()), None];
        assert_eq!(reduce_read_quorum_errs(&errors, &[], 2), Some(e1));
        assert_eq!(reduce_read_quorum_errs(&errors, &[], 3), Some(Error::ErasureReadQuorum));
        assert_eq!(reduce_write_quorum_errs(&errors, &[], 3), Some(Error::ErasureWriteQuorum));
    }

    #[test]
    fn test_success_quorum_holds() {
        let errors = vec![None, None, None, Some(Error::FileNotFound)];
        assert_eq!(reduce_write_quorum_errs(&errors, OBJECT_OP_IGNORED_ERRS, 3), None);
    }

    #[test]
    fn test_all_buckets_not_found() {
        assert!(is_all_buckets_not_found(&[Some(Error::VolumeNotFound), Some(Error::DiskNotFound)]));
        assert!(!is_all_buckets_not_found(&[Some(Error::VolumeNotFound), None]));
        assert!(!is_all_buckets_not_found(&[]));
    }
}
