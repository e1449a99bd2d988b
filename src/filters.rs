//! This module implements the output filters that erase noise (timestamps, pids, addresses)
//! from child output before it is fingerprinted.
//!

use std::path::Path;

use regex::bytes::{NoExpand, Regex};

use crate::{ErrorKind, Result, ResultExt};

/// The marker glibc prints when `MALLOC_CHECK_` diagnoses heap corruption.
const MEMORY_ERROR_MARKER: &[u8] = b"MEMORY-ERROR";

/// A compiled filter pattern together with its original source text.
#[derive(Debug)]
pub struct FilterPattern {
    /// The compiled pattern.
    regex: Regex,

    /// The source text the pattern was compiled from.
    source: String,
}

impl FilterPattern {
    /// Compile the given pattern text.
    pub fn new(pattern: &str) -> Result<FilterPattern> {
        let regex = Regex::new(pattern)?;
        Ok(FilterPattern {
            regex,
            source: pattern.to_owned()
        })
    }

    /// Get the source text the pattern was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// An ordered list of filter patterns applied to every captured stream.
#[derive(Debug, Default)]
pub struct FilterSet {
    patterns: Vec<FilterPattern>,
}

impl FilterSet {
    /// Create a `FilterSet` that contains no user patterns. The built-in normalizations are
    /// still applied.
    pub fn empty() -> FilterSet {
        FilterSet {
            patterns: Vec::new()
        }
    }

    /// Load filter patterns from the given text file, one pattern per line. Empty lines and
    /// lines starting with `#` are skipped. Any pattern that fails to compile aborts the load
    /// with a diagnostic naming the offending line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FilterSet> {
        let content = std::fs::read_to_string(path.as_ref())
            .chain_err(|| format!("cannot read filter file: {}", path.as_ref().display()))
            ?;

        let mut patterns = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let pattern = FilterPattern::new(line)
                .chain_err(|| ErrorKind::InvalidFilterPattern(lineno + 1, line.to_owned()))
                ?;
            log::debug!("Loaded filter pattern: {}", pattern.source());
            patterns.push(pattern);
        }

        Ok(FilterSet { patterns })
    }

    /// Get the number of user supplied patterns in this set.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Apply every pattern in load order to the given stream, substituting the empty string for
    /// each non-overlapping match, then apply the built-in normalizations.
    pub fn apply(&self, bytes: &[u8]) -> Vec<u8> {
        let mut output = bytes.to_vec();
        for pattern in &self.patterns {
            if log::log_enabled!(log::Level::Debug) && pattern.regex.is_match(&output) {
                log::debug!("Filter pattern matched: {}", pattern.source());
            }
            output = pattern.regex.replace_all(&output, NoExpand(b"")).into_owned();
        }

        canonicalize_memory_error(&mut output);
        blank_process_pids(&mut output);

        output
    }
}

/// If the stream contains the glibc heap corruption marker anywhere, replace the entire stream
/// with exactly the marker. The surrounding text varies with allocator internals and carries no
/// signal.
fn canonicalize_memory_error(output: &mut Vec<u8>) {
    if find(output, MEMORY_ERROR_MARKER).is_some() {
        output.clear();
        output.extend_from_slice(MEMORY_ERROR_MARKER);
    }
}

/// Overwrite every `(process:<pid>` prefix up to the next `)` with spaces. The glib message
/// prefix embeds the child pid, which changes on every spawn. The overwrite preserves the
/// stream length.
fn blank_process_pids(output: &mut Vec<u8>) {
    let mut from = 0;
    while let Some(start) = find(&output[from..], b"(process:").map(|pos| from + pos) {
        let end = match find(&output[start..], b")") {
            Some(pos) => start + pos,
            None => break
        };
        for byte in &mut output[start..end] {
            *byte = b' ';
        }
        from = end;
    }
}

/// Find the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_apply_in_load_order() {
        let mut filters = FilterSet::empty();
        filters.patterns.push(FilterPattern::new("[0-9]+").unwrap());
        filters.patterns.push(FilterPattern::new("pid ").unwrap());

        assert_eq!(b"".to_vec(), filters.apply(b"pid 12345"));
        assert_eq!(b"error at :".to_vec(), filters.apply(b"error at 17:03"));
    }

    #[test]
    fn test_apply_is_literal() {
        let mut filters = FilterSet::empty();
        filters.patterns.push(FilterPattern::new(r"\[[a-z]+\]").unwrap());

        assert_eq!(b"warn: $0".to_vec(), filters.apply(b"[core] warn: $0"));
    }

    #[test]
    fn test_empty_pattern_set_is_identity() {
        let filters = FilterSet::empty();
        assert_eq!(b"hello world\n".to_vec(), filters.apply(b"hello world\n"));
    }

    #[test]
    fn test_memory_error_canonicalization() {
        let filters = FilterSet::empty();
        let output = filters.apply(b"*** glibc detected *** MEMORY-ERROR: double free at 0x1234");
        assert_eq!(b"MEMORY-ERROR".to_vec(), output);
    }

    #[test]
    fn test_process_pid_blanking() {
        let filters = FilterSet::empty();
        let output = filters.apply(b"(process:12345): GLib-WARNING: leak");
        assert_eq!(b"              ): GLib-WARNING: leak".to_vec(), output);
        assert_eq!(b"(process:12345): GLib-WARNING: leak".len(), output.len());
    }

    #[test]
    fn test_process_pid_blanking_all_occurrences() {
        let filters = FilterSet::empty();
        let output = filters.apply(b"(process:1) a (process:22) b");
        assert_eq!(b"          ) a (          ) b".to_vec(), output);
    }

    #[test]
    fn test_load_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# timestamps").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "[0-9]+").unwrap();
        writeln!(file, "pid").unwrap();
        file.flush().unwrap();

        let filters = FilterSet::load(file.path()).unwrap();
        assert_eq!(2, filters.len());
    }

    #[test]
    fn test_load_rejects_bad_pattern() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[0-9]+").unwrap();
        writeln!(file, "*broken").unwrap();
        file.flush().unwrap();

        let err = FilterSet::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("filter"));
    }
}
