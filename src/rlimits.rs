//! This module provides Rust friendly bindings to the native `rlimit` mechanism, together with
//! the registry of searchable resource limits and their search granularities.
//!

use libc::rlimit;

use crate::{ErrorKind, Result};

/// Represent a resource recognized by `setrlimit(2)`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Limit, in seconds, on the amount of CPU time that the process can
    /// consume. This variant corresponds to the `RLIMIT_CPU` native constant.
    CpuTime = libc::RLIMIT_CPU,

    /// Maximum size of files that the process may create. This variant
    /// corresponds to the `RLIMIT_FSIZE` native constant.
    FileSize = libc::RLIMIT_FSIZE,

    /// Maximum size of the process's data segment. This variant corresponds
    /// to the `RLIMIT_DATA` native constant.
    DataSegment = libc::RLIMIT_DATA,

    /// Maximum size of the process stack. This variant corresponds to the
    /// `RLIMIT_STACK` native constant.
    Stack = libc::RLIMIT_STACK,

    /// Maximum size of a core file the process may dump. This variant
    /// corresponds to the `RLIMIT_CORE` native constant.
    CoreSize = libc::RLIMIT_CORE,

    /// Limit on the process's resident set. This variant corresponds to the
    /// `RLIMIT_RSS` native constant.
    ResidentSet = libc::RLIMIT_RSS,

    /// Limit on the number of open file descriptors. This variant corresponds
    /// to the `RLIMIT_NOFILE` native constant.
    OpenFiles = libc::RLIMIT_NOFILE,

    /// Maximum size of the process's virtual memory (address space). This
    /// variant corresponds to the `RLIMIT_AS` native constant.
    AddressSpace = libc::RLIMIT_AS,

    /// Limit on the number of processes of the real user ID. This variant
    /// corresponds to the `RLIMIT_NPROC` native constant.
    ProcessCount = libc::RLIMIT_NPROC,

    /// Limit on the number of bytes the process may lock into memory. This
    /// variant corresponds to the `RLIMIT_MEMLOCK` native constant.
    LockedMemory = libc::RLIMIT_MEMLOCK,

    /// Limit on the number of file locks the process may hold. This variant
    /// corresponds to the `RLIMIT_LOCKS` native constant.
    FileLocks = libc::RLIMIT_LOCKS,

    /// Limit on the number of signals that may be queued for the real user
    /// ID. This variant corresponds to the `RLIMIT_SIGPENDING` native
    /// constant.
    PendingSignals = libc::RLIMIT_SIGPENDING,

    /// Limit on the number of bytes in POSIX message queues of the real user
    /// ID. This variant corresponds to the `RLIMIT_MSGQUEUE` native constant.
    MessageQueue = libc::RLIMIT_MSGQUEUE,

    /// Ceiling of the process's nice value. This variant corresponds to the
    /// `RLIMIT_NICE` native constant.
    Nice = libc::RLIMIT_NICE,

    /// Ceiling of the process's real-time priority. This variant corresponds
    /// to the `RLIMIT_RTPRIO` native constant.
    RealTimePriority = libc::RLIMIT_RTPRIO,

    /// Limit, in microseconds, on CPU time the process may consume under a
    /// real-time scheduling policy. This variant corresponds to the
    /// `RLIMIT_RTTIME` native constant.
    RealTimeCpu = libc::RLIMIT_RTTIME,
}

/// Number of resources known to the registry.
pub const NUM_KINDS: usize = 16;

/// All resources known to the registry, in search order.
pub static ALL_KINDS: [ResourceKind; NUM_KINDS] = [
    ResourceKind::CpuTime,
    ResourceKind::FileSize,
    ResourceKind::DataSegment,
    ResourceKind::Stack,
    ResourceKind::CoreSize,
    ResourceKind::ResidentSet,
    ResourceKind::OpenFiles,
    ResourceKind::AddressSpace,
    ResourceKind::ProcessCount,
    ResourceKind::LockedMemory,
    ResourceKind::FileLocks,
    ResourceKind::PendingSignals,
    ResourceKind::MessageQueue,
    ResourceKind::Nice,
    ResourceKind::RealTimePriority,
    ResourceKind::RealTimeCpu,
];

impl ResourceKind {
    /// Get all resources known to the registry, in search order.
    pub fn all_kinds() -> impl Iterator<Item = ResourceKind> {
        ALL_KINDS.iter().copied()
    }

    /// Get the canonical `RLIMIT_*` identifier of this resource.
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::CpuTime => "RLIMIT_CPU",
            ResourceKind::FileSize => "RLIMIT_FSIZE",
            ResourceKind::DataSegment => "RLIMIT_DATA",
            ResourceKind::Stack => "RLIMIT_STACK",
            ResourceKind::CoreSize => "RLIMIT_CORE",
            ResourceKind::ResidentSet => "RLIMIT_RSS",
            ResourceKind::OpenFiles => "RLIMIT_NOFILE",
            ResourceKind::AddressSpace => "RLIMIT_AS",
            ResourceKind::ProcessCount => "RLIMIT_NPROC",
            ResourceKind::LockedMemory => "RLIMIT_MEMLOCK",
            ResourceKind::FileLocks => "RLIMIT_LOCKS",
            ResourceKind::PendingSignals => "RLIMIT_SIGPENDING",
            ResourceKind::MessageQueue => "RLIMIT_MSGQUEUE",
            ResourceKind::Nice => "RLIMIT_NICE",
            ResourceKind::RealTimePriority => "RLIMIT_RTPRIO",
            ResourceKind::RealTimeCpu => "RLIMIT_RTTIME",
        }
    }

    /// Get the minimum meaningful decrement when sweeping this resource.
    ///
    /// Counted resources use 1, memory addressed resources use one page. A granularity of 0 marks
    /// the resource as unsearchable: core dumps are forced off for every spawn, and lowering the
    /// process count limit would throttle the searcher itself.
    pub fn granularity(self) -> u64 {
        match self {
            ResourceKind::CpuTime => 1,
            ResourceKind::FileSize => 1,
            ResourceKind::DataSegment => crate::misc::page_size(),
            ResourceKind::Stack => crate::misc::page_size(),
            ResourceKind::CoreSize => 0,
            ResourceKind::ResidentSet => crate::misc::page_size(),
            ResourceKind::OpenFiles => 1,
            ResourceKind::AddressSpace => crate::misc::page_size(),
            ResourceKind::ProcessCount => 0,
            ResourceKind::LockedMemory => crate::misc::page_size(),
            ResourceKind::FileLocks => 1,
            ResourceKind::PendingSignals => 1,
            ResourceKind::MessageQueue => 1,
            ResourceKind::Nice => 1,
            ResourceKind::RealTimePriority => 1,
            ResourceKind::RealTimeCpu => 1,
        }
    }

    /// Look up a resource by its canonical `RLIMIT_*` identifier. This function is the exact
    /// inverse of [`name`] on that identifier.
    ///
    /// [`name`]: #method.name
    pub fn parse(name: &str) -> Result<ResourceKind> {
        ResourceKind::all_kinds()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ErrorKind::UnknownLimit(name.to_owned()).into())
    }

    /// Get the index of this resource in [`ALL_KINDS`].
    ///
    /// [`ALL_KINDS`]: static.ALL_KINDS.html
    fn index(self) -> usize {
        ALL_KINDS.iter().position(|kind| *kind == self).unwrap()
    }
}

/// Specify the soft limit and the hard limit for some resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimit {
    /// The soft limit of the resource.
    pub soft_limit: u64,

    /// The hard limit of the resource.
    pub hard_limit: u64
}

impl ResourceLimit {
    /// Convert the `ResourceLimit` structure into native representation. The hard limit is
    /// clamped to the soft limit so that the target cannot raise its limits back after a
    /// `setuid` transition, and the soft limit is clamped to the resulting hard limit.
    pub(crate) fn as_native_clamped(&self) -> rlimit {
        let hard = self.soft_limit.min(self.hard_limit);
        let soft = self.soft_limit.min(hard);
        rlimit {
            rlim_cur: soft,
            rlim_max: hard
        }
    }
}

/// A total mapping from [`ResourceKind`] to a soft / hard limit pair, applied to every spawned
/// child.
///
/// [`ResourceKind`]: enum.ResourceKind.html
#[derive(Clone, Copy, Debug)]
pub struct LimitVector {
    limits: [ResourceLimit; NUM_KINDS]
}

impl LimitVector {
    /// Create a new `LimitVector` from the calling process's current limits. The core dump size
    /// is forced to zero so that crashing children do not litter the working directory.
    pub fn from_current() -> LimitVector {
        let mut limits = [ResourceLimit { soft_limit: 0, hard_limit: 0 }; NUM_KINDS];

        for kind in ResourceKind::all_kinds() {
            let mut native = rlimit { rlim_cur: 0, rlim_max: 0 };
            let ret = unsafe { libc::getrlimit(kind as u32, &mut native) };
            if ret != 0 {
                log::warn!("Failed to getrlimit for {}: {}",
                    kind.name(), std::io::Error::last_os_error());
                continue;
            }

            limits[kind.index()] = ResourceLimit {
                soft_limit: native.rlim_cur,
                hard_limit: native.rlim_max
            };

            log::debug!("Default rlimit {} => {{ {:#x}, {:#x} }}",
                kind.name(), native.rlim_cur, native.rlim_max);
        }

        limits[ResourceKind::CoreSize.index()] =
            ResourceLimit { soft_limit: 0, hard_limit: 0 };

        LimitVector { limits }
    }

    /// Get the limit pair of the given resource.
    pub fn get(&self, kind: ResourceKind) -> ResourceLimit {
        self.limits[kind.index()]
    }

    /// Get the soft limit of the given resource.
    pub fn cur(&self, kind: ResourceKind) -> u64 {
        self.limits[kind.index()].soft_limit
    }

    /// Set the soft limit of the given resource. The hard limit is left untouched here; both
    /// values are clamped together immediately before the `setrlimit` call in the child, see
    /// [`as_native_clamped`].
    ///
    /// [`as_native_clamped`]: struct.ResourceLimit.html#method.as_native_clamped
    pub fn set_cur(&mut self, kind: ResourceKind, value: u64) {
        self.limits[kind.index()].soft_limit = value;
    }

    /// Iterate over `(native resource id, clamped native limit)` pairs in registry order. The
    /// returned array is fully built before any `fork`, so applying it in the child does not
    /// allocate.
    pub(crate) fn as_native_entries(&self) -> [(u32, rlimit); NUM_KINDS] {
        let mut entries = [(0u32, rlimit { rlim_cur: 0, rlim_max: 0 }); NUM_KINDS];
        for kind in ResourceKind::all_kinds() {
            entries[kind.index()] = (kind as u32, self.limits[kind.index()].as_native_clamped());
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_parse_round_trip() {
        for kind in ResourceKind::all_kinds() {
            assert_eq!(kind, ResourceKind::parse(kind.name()).unwrap());
        }
    }

    #[test]
    fn test_parse_unknown() {
        assert!(ResourceKind::parse("RLIMIT_BOGUS").is_err());
        assert!(ResourceKind::parse("rlimit_cpu").is_err());
    }

    #[test]
    fn test_unsearchable_granularities() {
        assert_eq!(0, ResourceKind::CoreSize.granularity());
        assert_eq!(0, ResourceKind::ProcessCount.granularity());
    }

    #[test]
    fn test_memory_granularity_is_page_size() {
        let page = crate::misc::page_size();
        assert_eq!(page, ResourceKind::DataSegment.granularity());
        assert_eq!(page, ResourceKind::Stack.granularity());
        assert_eq!(page, ResourceKind::ResidentSet.granularity());
        assert_eq!(page, ResourceKind::LockedMemory.granularity());
        assert_eq!(page, ResourceKind::AddressSpace.granularity());
    }

    #[test]
    fn test_from_current_clamps_core() {
        let limits = LimitVector::from_current();
        assert_eq!(ResourceLimit { soft_limit: 0, hard_limit: 0 },
            limits.get(ResourceKind::CoreSize));
    }

    #[test]
    fn test_native_clamp_keeps_soft_below_hard() {
        let limit = ResourceLimit { soft_limit: 11, hard_limit: 10 };
        let native = limit.as_native_clamped();
        assert_eq!(10, native.rlim_cur);
        assert_eq!(10, native.rlim_max);

        let limit = ResourceLimit { soft_limit: 5, hard_limit: 10 };
        let native = limit.as_native_clamped();
        assert_eq!(5, native.rlim_cur);
        assert_eq!(5, native.rlim_max);
    }

    #[test]
    fn test_set_cur() {
        let mut limits = LimitVector::from_current();
        limits.set_cur(ResourceKind::OpenFiles, 17);
        assert_eq!(17, limits.cur(ResourceKind::OpenFiles));
    }
}
