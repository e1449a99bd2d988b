//! This module turns a child's observable behavior into an opaque, value comparable key. Two
//! keys are equal exactly when the child produced byte identical post-filter output on both
//! streams and terminated the same way.
//!

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

use crate::filters::FilterSet;
use crate::process::TerminationInfo;

/// An opaque digest of a child's termination status and filtered output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputKey(String);

impl Display for OutputKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric encodings of the termination variants. Stable across runs so that keys recorded in
/// replay scripts stay comparable.
fn termination_code(term: TerminationInfo) -> (u8, u32) {
    match term {
        TerminationInfo::Exited(code) => (0x01, code as u32),
        TerminationInfo::Killed(signal) => (0x02, signal as u32),
        TerminationInfo::Dumped(signal) => (0x03, signal as u32),
        TerminationInfo::Timeout => (0x04, 0),
    }
}

/// Digest one captured stream: canonicalize it through the filter set, then hash it.
pub fn digest_stream(filters: &FilterSet, bytes: &[u8]) -> String {
    let canonical = filters.apply(bytes);
    let mut hasher = Md5::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// Combine a termination status with the two stream digests into an [`OutputKey`].
///
/// [`OutputKey`]: struct.OutputKey.html
pub fn fingerprint(term: TerminationInfo, stdout_digest: &str, stderr_digest: &str)
    -> OutputKey {
    let (code, detail) = termination_code(term);
    OutputKey(format!("{:02x}{:08x}:{}-{}", code, detail, stdout_digest, stderr_digest))
}

/// Fingerprint a full spawn result: both streams are filtered and digested, then combined
/// with the termination status.
pub fn fingerprint_streams(term: TerminationInfo, filters: &FilterSet,
    stdout: &[u8], stderr: &[u8]) -> OutputKey {
    fingerprint(term,
        &digest_stream(filters, stdout),
        &digest_stream(filters, stderr))
}

/// The set of every distinct behavior observed during a run.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    keys: HashSet<OutputKey>,
}

impl FingerprintSet {
    /// Create an empty set.
    pub fn new() -> FingerprintSet {
        FingerprintSet {
            keys: HashSet::new()
        }
    }

    /// Insert the given key. Returns `true` if the key has not been observed before.
    pub fn insert(&mut self, key: OutputKey) -> bool {
        self.keys.insert(key)
    }

    /// Get the number of distinct keys observed so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check whether no key has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
