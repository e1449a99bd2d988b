//! This crate implements a differential fuzzer for POSIX resource limits.
//! Given an arbitrary command, it discovers the threshold values of each
//! `RLIMIT_*` resource at which the command's externally observable behavior
//! changes, and records a replay line for every distinct failure mode.
//!
//! The crate implements:
//!
//! * Hermetic child processes: spawn the target command with a configured
//! resource limit vector, deterministic standard streams and a wall clock
//! timeout;
//!
//! * Output fingerprints: canonicalize the captured stdout/stderr with user
//! supplied regex filters and digest them together with the termination
//! status into a value comparable key;
//!
//! * Threshold search: per limit, an exponential bisection down to the first
//! divergence from the baseline fingerprint, followed by a granularity
//! aware linear sweep that enumerates every distinct behavior;
//!
//! * Replay scripts: emit one self contained `runlimit` invocation for each
//! newly observed fingerprint.
//!

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate nix;
extern crate regex;
extern crate md5;
extern crate hex;

mod misc;

pub mod filters;
pub mod fingerprint;
pub mod probe;
pub mod process;
pub mod rlimits;
pub mod script;
pub mod search;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
        Regex(::regex::Error);
    }

    errors {
        UnknownLimit(name: String) {
            description("unknown resource limit name")
            display("unknown resource limit name: {}", name)
        }

        InvalidFilterPattern(line: usize, pattern: String) {
            description("invalid filter pattern")
            display("invalid filter pattern at line {}: {}", line, pattern)
        }

        InvalidCommandString(arg: String) {
            description("invalid command string")
            display("command string contains a NUL byte: {}", arg)
        }

        CommandNotFound(name: String) {
            description("command not found")
            display("cannot find command: {}", name)
        }

        WaitProtocol(reason: String) {
            description("unexpected state from waitid")
            display("unexpected state from waitid: {}", reason)
        }
    }
}

pub use filters::FilterSet;
pub use fingerprint::{FingerprintSet, OutputKey};
pub use process::{Spawner, TerminationInfo};
pub use rlimits::{LimitVector, ResourceKind};
pub use script::ScriptEmitter;
pub use search::SearchEngine;
