//! This module appends replay lines to the operator supplied output script. Each line invokes
//! the `runlimit` helper with the limit setting that produced a new fingerprint, so a crash of
//! the searcher still leaves a usable partial script behind.
//!

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::rlimits::ResourceKind;
use crate::{Result, ResultExt};

/// Writes the replay script, one flushed line per discovered behavior.
pub struct ScriptEmitter {
    /// The open script file.
    file: File,

    /// Path of the `runlimit` helper, expected next to the currently running binary.
    runlimit: PathBuf,

    /// The target command as the operator spelled it.
    command: Vec<String>,

    /// The file the target reads as standard input.
    stdin_path: PathBuf,
}

impl ScriptEmitter {
    /// Create the script file and write the interpreter header. The file is truncated if it
    /// already exists.
    pub fn create<P: AsRef<Path>>(path: P, command: &[String], stdin_path: &Path)
        -> Result<ScriptEmitter> {
        let mut file = File::create(path.as_ref())
            .chain_err(|| format!("cannot create script file: {}", path.as_ref().display()))
            ?;
        file.write_all(b"#!/bin/sh\n")?;
        file.flush()?;

        let runlimit = std::env::current_exe()?
            .parent()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("runlimit");

        Ok(ScriptEmitter {
            file,
            runlimit,
            command: command.to_vec(),
            stdin_path: stdin_path.to_path_buf(),
        })
    }

    /// Append one replay line for the given limit setting and flush it to disk.
    pub fn emit(&mut self, kind: ResourceKind, value: u64) -> Result<()> {
        writeln!(self.file, "{} {} {:#x} {} < {}",
            self.runlimit.display(),
            kind.name(),
            value,
            self.command.join(" "),
            self.stdin_path.display())
            ?;
        self.file.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_has_header_and_replay_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("replay.sh");
        let command = vec!["cat".to_owned(), "/etc/hostname".to_owned()];

        let mut emitter = ScriptEmitter::create(
            &script_path, &command, Path::new("/dev/null")).unwrap();
        emitter.emit(ResourceKind::OpenFiles, 16).unwrap();
        emitter.emit(ResourceKind::CpuTime, 0).unwrap();

        let content = std::fs::read_to_string(&script_path).unwrap();
        let lines = content.lines().collect::<Vec<&str>>();

        assert_eq!(3, lines.len());
        assert_eq!("#!/bin/sh", lines[0]);
        assert!(lines[1].contains("runlimit RLIMIT_NOFILE 0x10 cat /etc/hostname < /dev/null"));
        assert!(lines[2].contains("runlimit RLIMIT_CPU 0x0 cat /etc/hostname < /dev/null"));
    }
}
