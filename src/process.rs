//! This module implements the child process spawner. Every probe of the target command goes
//! through [`Spawner::spawn`]: the child is executed under a caller supplied resource limit
//! vector with its standard streams wired to pipes, and the parent collects the output
//! non-blockingly under a wall clock timeout.
//!
//! [`Spawner::spawn`]: struct.Spawner.html#method.spawn
//!

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag};
use nix::sys::signal::Signal;
use nix::unistd::ForkResult;

use crate::misc;
use crate::rlimits::LimitVector;
use crate::{Error, ErrorKind, Result};

/// Highest file descriptor (exclusive) the child scrubs before exec. Descriptors at or above
/// 3 inherited from the parent would leak into the target.
const CHILD_FD_SCRUB_LIMIT: libc::c_int = 128;

/// Interval between pipe read attempts in the parent.
const READ_INTERVAL: Duration = Duration::from_millis(10);

/// Size of the read buffer for each pipe drain attempt.
const READ_CHUNK_SIZE: usize = 1024;

/// Describe how a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminationInfo {
    /// The child exited normally with the given exit code.
    Exited(i32),

    /// The child was killed by the delivery of a signal.
    Killed(Signal),

    /// The child was killed by the delivery of a signal and dumped core.
    Dumped(Signal),

    /// The child exceeded the wall clock timeout. The spawner itself reports timed out
    /// children as `Killed(SIGKILL)`; callers that track elapsed time may relabel them with
    /// this variant.
    Timeout,
}

/// An output capture pipe. One is created per standard stream before each fork: the child
/// gets the write end dup'ed onto its stdout or stderr, the parent drains the read end.
///
/// Field 0 owns the read end, field 1 the write end; the parent gives up the write end right
/// after the fork so that end-of-file tracks the child's lifetime.
struct Pipe(Option<File>, Option<File>);

impl Pipe {
    /// Create a new `Pipe` instance.
    fn new() -> Result<Pipe> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        Ok(Pipe(
            Some(unsafe { File::from_raw_fd(read_fd) }),
            Some(unsafe { File::from_raw_fd(write_fd) })
        ))
    }

    /// Get the raw file descriptor of the read end.
    fn read_fd(&self) -> RawFd {
        self.0.as_ref().unwrap().as_raw_fd()
    }

    /// Get the raw file descriptor of the write end.
    fn write_fd(&self) -> RawFd {
        self.1.as_ref().unwrap().as_raw_fd()
    }

    /// Take ownership of the write end of the pipe, leaving `None` in the corresponding slot
    /// in this `Pipe` instance.
    fn take_write_end(&mut self) -> Option<File> {
        self.1.take()
    }
}

/// Everything the child needs between `fork` and `exec`, staged in the parent so that the
/// child touches nothing but raw file descriptors and the pre-built pointer arrays. The heap
/// must not be used on the child side of the fork.
struct ChildStage {
    exe: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    limits: [(u32, libc::rlimit); crate::rlimits::NUM_KINDS],
    stdout_write: RawFd,
    stderr_write: RawFd,
    stdout_read: RawFd,
    stderr_read: RawFd,
    stdin_fd: RawFd,
}

/// Spawn children of a fixed command under varying resource limit vectors.
pub struct Spawner {
    /// Resolved absolute path of the executable.
    exe: CString,

    /// Arguments of the command, including `argv[0]` as the operator spelled it.
    argv: Vec<CString>,

    /// Environment entries in `NAME=VALUE` form.
    envs: Vec<String>,

    /// The file every child reads as standard input. Opened once, rewound by each child.
    stdin: File,

    /// Wall clock budget for a single child.
    timeout: Duration,
}

impl Spawner {
    /// Create a new `Spawner` for the given command. The first element of `command` is
    /// resolved against `PATH` once, here, so that the child side of every fork can exec
    /// without searching.
    pub fn new(command: &[String], envs: Vec<String>, stdin: File, timeout: Duration)
        -> Result<Spawner> {
        let name = match command.first() {
            Some(name) => name,
            None => bail!(ErrorKind::CommandNotFound(String::new()))
        };

        for arg in command.iter().chain(envs.iter()) {
            if !misc::is_valid_c_string(arg) {
                bail!(ErrorKind::InvalidCommandString(arg.clone()));
            }
        }

        let exe_path = misc::expand_path(name.as_str())
            .ok_or_else(|| Error::from(ErrorKind::CommandNotFound(name.clone())))
            ?;
        let exe = CString::new(Vec::from(exe_path.as_os_str().as_bytes())).unwrap();

        let argv = command.iter()
            .map(|arg| CString::new(arg.clone()).unwrap())
            .collect::<Vec<CString>>();

        Ok(Spawner {
            exe,
            argv,
            envs,
            stdin,
            timeout
        })
    }

    /// Get the environment entries every spawn uses by default.
    pub fn envs(&self) -> &[String] {
        &self.envs
    }

    /// Spawn the command once under the given limit vector and the spawner's own environment.
    pub fn spawn(&self, limits: &LimitVector)
        -> Result<(TerminationInfo, Vec<u8>, Vec<u8>)> {
        self.spawn_with_env(limits, &self.envs)
    }

    /// Spawn the command once under the given limit vector and an explicit environment,
    /// returning how the child terminated together with the raw bytes it wrote to stdout and
    /// stderr.
    pub fn spawn_with_env(&self, limits: &LimitVector, envs: &[String])
        -> Result<(TerminationInfo, Vec<u8>, Vec<u8>)> {
        // Stage everything the child needs before forking. The CString and pointer vectors
        // built here stay alive (and unmoved) until the child has exec'ed.
        let native_envs = envs.iter()
            .map(|env| CString::new(env.clone()).unwrap())
            .collect::<Vec<CString>>();

        let mut argv_ptrs = self.argv.iter()
            .map(|arg| arg.as_ptr())
            .collect::<Vec<*const libc::c_char>>();
        argv_ptrs.push(std::ptr::null());

        let mut envp_ptrs = native_envs.iter()
            .map(|env| env.as_ptr())
            .collect::<Vec<*const libc::c_char>>();
        envp_ptrs.push(std::ptr::null());

        let mut stdout_pipe = Pipe::new()?;
        let mut stderr_pipe = Pipe::new()?;

        let stage = ChildStage {
            exe: self.exe.as_ptr(),
            argv: argv_ptrs.as_ptr(),
            envp: envp_ptrs.as_ptr(),
            limits: limits.as_native_entries(),
            stdout_write: stdout_pipe.write_fd(),
            stderr_write: stderr_pipe.write_fd(),
            stdout_read: stdout_pipe.read_fd(),
            stderr_read: stderr_pipe.read_fd(),
            stdin_fd: self.stdin.as_raw_fd(),
        };

        match nix::unistd::fork()? {
            ForkResult::Parent { child } => {
                // The write ends belong to the child now.
                drop(stdout_pipe.take_write_end());
                drop(stderr_pipe.take_write_end());

                self.collect_child(child.as_raw(), &stdout_pipe, &stderr_pipe)
            },
            ForkResult::Child => start_child(&stage)
        }
    }

    /// Drain the child's pipes until both report end of file, enforcing the wall clock
    /// timeout, then reap the child and map its exit state.
    fn collect_child(&self, child: libc::pid_t, stdout_pipe: &Pipe, stderr_pipe: &Pipe)
        -> Result<(TerminationInfo, Vec<u8>, Vec<u8>)> {
        nix::fcntl::fcntl(stdout_pipe.read_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        nix::fcntl::fcntl(stderr_pipe.read_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let timer = Instant::now();
        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            // If this is taking too long, kill the whole process group. The kill is repeated
            // every iteration until the child is reaped.
            if timer.elapsed() > self.timeout {
                kill_group(child);
            }

            if stdout_open {
                stdout_open = drain_pipe(stdout_pipe.read_fd(), &mut stdout_buf)?;
            }
            if stderr_open {
                stderr_open = drain_pipe(stderr_pipe.read_fd(), &mut stderr_buf)?;
            }

            if stdout_open || stderr_open {
                std::thread::sleep(READ_INTERVAL);
            }
        }

        let info = self.reap_child(child, &timer)?;
        Ok((info, stdout_buf, stderr_buf))
    }

    /// Wait for the child to be reaped, retrying on `EINTR` and re-checking the timeout while
    /// the child has not changed state yet.
    fn reap_child(&self, child: libc::pid_t, timer: &Instant) -> Result<TerminationInfo> {
        let info = loop {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                libc::waitid(libc::P_PID, child as libc::id_t, &mut info,
                    libc::WEXITED | libc::WNOHANG)
            };

            if ret != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::with_chain(err,
                    ErrorKind::WaitProtocol(format!("waitid for child {} failed", child))));
            }

            // No state change yet. Check whether the child has overstayed its budget before
            // waiting again.
            if unsafe { info.si_pid() } == 0 {
                if timer.elapsed() > self.timeout {
                    kill_group(child);
                }
                std::thread::sleep(READ_INTERVAL);
                continue;
            }

            break info;
        };

        let pid = unsafe { info.si_pid() };
        if pid != child {
            bail!(ErrorKind::WaitProtocol(
                format!("waitid returned pid {} while waiting for {}", pid, child)));
        }

        let status = unsafe { info.si_status() };
        match info.si_code {
            libc::CLD_EXITED => Ok(TerminationInfo::Exited(status)),
            libc::CLD_KILLED => Ok(TerminationInfo::Killed(decode_signal(status)?)),
            libc::CLD_DUMPED => {
                log::debug!("child {} dumped core, adjust limits?", child);
                Ok(TerminationInfo::Dumped(decode_signal(status)?))
            },
            code => bail!(ErrorKind::WaitProtocol(
                format!("unexpected si_code {} for child {}", code, child)))
        }
    }
}

/// Convert a raw signal number from `siginfo_t` into a [`Signal`].
///
/// [`Signal`]: ../../nix/sys/signal/enum.Signal.html
fn decode_signal(signum: i32) -> Result<Signal> {
    Signal::from_c_int(signum)
        .map_err(|_| ErrorKind::WaitProtocol(format!("unknown signal number {}", signum)).into())
}

/// Send `SIGKILL` to the child's process group. Failures are ignored: the group may already
/// be fully reaped.
fn kill_group(child: libc::pid_t) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-child), Signal::SIGKILL);
}

/// Read everything currently available from the given non-blocking descriptor, so a chatty
/// child is never throttled by the polling interval. Returns `Ok(false)` once the pipe
/// reports end of file.
fn drain_pipe(fd: RawFd, buf: &mut Vec<u8>) -> Result<bool> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match nix::unistd::read(fd, &mut chunk) {
            Ok(0) => return Ok(false),
            Ok(len) => buf.extend_from_slice(&chunk[..len]),
            Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(true),
            Err(nix::Error::Sys(Errno::EINTR)) => (),
            Err(e) => return Err(Error::from(e))
        }
    }
}

/// Set up the child side of the fork and exec the target. Called after `fork` in the child;
/// everything here must be async-signal-safe, so only raw `libc` calls on pre-staged data are
/// allowed. Failure terminates the child with a message on the (already redirected) stderr
/// pipe.
fn start_child(stage: &ChildStage) -> ! {
    unsafe {
        libc::close(stage.stdout_read);
        libc::close(stage.stderr_read);

        if libc::dup2(stage.stdout_write, libc::STDOUT_FILENO) == -1 {
            child_fail(b"failed to map stdout to pipe\n");
        }
        if libc::dup2(stage.stderr_write, libc::STDERR_FILENO) == -1 {
            child_fail(b"failed to map stderr to pipe\n");
        }
        if libc::dup2(stage.stdin_fd, libc::STDIN_FILENO) == -1 {
            child_fail(b"failed to map stdin\n");
        }

        // Rewind stdin so every child sees the input from the start. Seek failure (e.g. on
        // /dev/null) is harmless.
        libc::lseek(libc::STDIN_FILENO, 0, libc::SEEK_SET);

        // Close any straggling file descriptors.
        for fd in 3..CHILD_FD_SCRUB_LIMIT {
            libc::close(fd);
        }

        // A fresh process group lets the parent kill the child and all of its descendants
        // with one signal.
        if libc::setpgid(0, 0) == -1 {
            child_fail(b"failed to create process group\n");
        }

        // Make sure the child does not outlive the parent.
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);

        for (resource, limit) in stage.limits.iter() {
            if libc::setrlimit(*resource, limit) == -1 {
                child_fail(b"setrlimit failed\n");
            }
        }

        libc::execve(stage.exe, stage.argv, stage.envp);

        child_fail(b"execve failed unexpectedly\n");
    }
}

/// Report a child side setup failure on stderr and exit. Async-signal-safe.
fn child_fail(message: &[u8]) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO,
            message.as_ptr() as *const libc::c_void, message.len());
        libc::_exit(127);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Seek, SeekFrom, Write};

    use crate::rlimits::ResourceKind;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    fn test_env() -> Vec<String> {
        vec![format!("PATH={}", std::env::var("PATH").unwrap_or_default())]
    }

    fn spawner(args: &[&str], timeout: Duration) -> Spawner {
        let stdin = File::open("/dev/null").unwrap();
        Spawner::new(&strings(args), test_env(), stdin, timeout).unwrap()
    }

    #[test]
    fn test_spawn_captures_stdout() {
        let spawner = spawner(&["echo", "hello"], Duration::from_secs(5));
        let limits = LimitVector::from_current();

        let (info, stdout, stderr) = spawner.spawn(&limits).unwrap();
        assert_eq!(TerminationInfo::Exited(0), info);
        assert_eq!(b"hello\n".to_vec(), stdout);
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_spawn_captures_stderr_and_exit_code() {
        let spawner = spawner(&["sh", "-c", "echo oops >&2; exit 3"],
            Duration::from_secs(5));
        let limits = LimitVector::from_current();

        let (info, stdout, stderr) = spawner.spawn(&limits).unwrap();
        assert_eq!(TerminationInfo::Exited(3), info);
        assert!(stdout.is_empty());
        assert_eq!(b"oops\n".to_vec(), stderr);
    }

    #[test]
    fn test_spawn_does_not_truncate_large_output() {
        let spawner = spawner(&["sh", "-c", "head -c 1048576 /dev/zero"],
            Duration::from_secs(10));
        let limits = LimitVector::from_current();

        let (info, stdout, _) = spawner.spawn(&limits).unwrap();
        assert_eq!(TerminationInfo::Exited(0), info);
        assert_eq!(1048576, stdout.len());
    }

    #[test]
    fn test_spawn_kills_on_timeout() {
        let spawner = spawner(&["sh", "-c", "sleep 60"], Duration::from_secs(1));
        let limits = LimitVector::from_current();

        let timer = Instant::now();
        let (info, _, _) = spawner.spawn(&limits).unwrap();
        assert_eq!(TerminationInfo::Killed(Signal::SIGKILL), info);
        assert!(timer.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_spawn_reports_death_by_signal() {
        let spawner = spawner(&["sh", "-c", "kill -TERM $$"], Duration::from_secs(5));
        let limits = LimitVector::from_current();

        let (info, _, _) = spawner.spawn(&limits).unwrap();
        assert_eq!(TerminationInfo::Killed(Signal::SIGTERM), info);
    }

    #[test]
    fn test_spawn_rewinds_stdin_between_spawns() {
        let mut input = tempfile::NamedTempFile::new().unwrap();
        input.write_all(b"payload").unwrap();
        input.flush().unwrap();
        input.seek(SeekFrom::End(0)).unwrap();

        let stdin = input.reopen().unwrap();
        let spawner = Spawner::new(&strings(&["cat"]), test_env(), stdin,
            Duration::from_secs(5)).unwrap();
        let limits = LimitVector::from_current();

        let (_, first, _) = spawner.spawn(&limits).unwrap();
        let (_, second, _) = spawner.spawn(&limits).unwrap();
        assert_eq!(b"payload".to_vec(), first);
        assert_eq!(b"payload".to_vec(), second);
    }

    #[test]
    fn test_spawn_with_tight_nofile_changes_behavior() {
        let spawner = spawner(&["echo", "hello"], Duration::from_secs(5));
        let baseline = LimitVector::from_current();
        let mut tight = LimitVector::from_current();
        tight.set_cur(ResourceKind::OpenFiles, 2);

        let (normal, normal_out, _) = spawner.spawn(&baseline).unwrap();
        let (starved, starved_out, _) = spawner.spawn(&tight).unwrap();
        assert_eq!(TerminationInfo::Exited(0), normal);
        assert_eq!(b"hello\n".to_vec(), normal_out);
        assert!(normal != starved || normal_out != starved_out);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let stdin = File::open("/dev/null").unwrap();
        let result = Spawner::new(&strings(&["no-such-command-exists-here"]),
            test_env(), stdin, Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_nul_byte_in_argument_is_rejected() {
        let stdin = File::open("/dev/null").unwrap();
        let result = Spawner::new(&strings(&["echo", "a\x00b"]),
            test_env(), stdin, Duration::from_secs(1));
        assert!(result.is_err());
    }
}
