use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Check whether a command argument or `NAME=VALUE` environment entry can cross the `execve`
/// boundary, i.e. contains no embedded NUL byte.
///
/// ```ignore
/// assert!(is_valid_c_string("MALLOC_CHECK_=2"));
/// assert!(!is_valid_c_string("--flag=\x00value"));
/// ```
///
pub fn is_valid_c_string(s: &str) -> bool {
    !s.as_bytes().contains(&b'\x00')
}

/// Get the size of a virtual memory page, in bytes.
pub fn page_size() -> u64 {
    // Posix does not pin the page size, but 4 KiB is the overwhelmingly common value on the
    // platforms this crate targets. We use this constant as a fallback when `sysconf` fails.
    const DEFAULT_PAGE_SIZE: u64 = 4096;

    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret == -1 {
        log::warn!("Failed to get page size through sysconf. Use {} instead.", DEFAULT_PAGE_SIZE);
        DEFAULT_PAGE_SIZE
    } else {
        ret as u64
    }
}

/// Expand the `PATH` environment variable before the given path and returns the one that exists.
pub fn expand_path<'a, P>(path: &'a P) -> Option<Cow<'a, Path>>
    where P: ?Sized + AsRef<Path> {
    let original = path.as_ref();
    if original.exists() {
        return Some(Cow::Borrowed(original));
    }

    if original.is_absolute() {
        return None;
    }

    let path_env = match std::env::var_os("PATH") {
        Some(p) => p.to_string_lossy().into_owned().to_owned(),
        None => return None
    };
    for dir_path in path_env.split(':') {
        let mut path = PathBuf::from(dir_path);
        path.push(original);

        if path.exists() {
            return Some(Cow::Owned(path));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_c_string() {
        assert!(is_valid_c_string("MALLOC_CHECK_=2"));
        assert!(is_valid_c_string("--flag=value"));
        assert!(!is_valid_c_string("--flag=\x00value"));
    }

    #[test]
    fn test_page_size_nonzero() {
        assert!(page_size() >= 512);
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(Path::new("/bin/sh"), expand_path("/bin/sh").unwrap());
        assert!(expand_path("/this/path/should/not/exist").is_none());
    }

    #[test]
    fn test_expand_path_lookup() {
        let expanded = expand_path("sh").unwrap();
        assert!(expanded.is_absolute());
        assert!(expanded.exists());
    }
}
