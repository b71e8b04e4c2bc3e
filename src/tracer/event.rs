use std::fmt;
use std::sync::Arc;

/// Identity of a monitored workload (pod name). Cheap to clone.
pub type EntityId = Arc<str>;

/// ProbeKind identifies the kernel attach point that produced an event.
/// Values are the wire codes written by the probe loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProbeKind {
    BlockRqInsert = 1,
    BlockRqIssue = 2,
    BlockRqComplete = 3,
    VfsReadEntry = 4,
    VfsReadExit = 5,
    VfsWriteEntry = 6,
    VfsWriteExit = 7,
    RemoteIssue = 8,
    RemoteComplete = 9,
}

/// Maximum ProbeKind value, used for array sizing.
pub const MAX_PROBE_KIND: usize = 9;

impl ProbeKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BlockRqInsert => "block_rq_insert",
            Self::BlockRqIssue => "block_rq_issue",
            Self::BlockRqComplete => "block_rq_complete",
            Self::VfsReadEntry => "vfs_read_entry",
            Self::VfsReadExit => "vfs_read_exit",
            Self::VfsWriteEntry => "vfs_write_entry",
            Self::VfsWriteExit => "vfs_write_exit",
            Self::RemoteIssue => "remote_issue",
            Self::RemoteComplete => "remote_complete",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::BlockRqInsert),
            2 => Some(Self::BlockRqIssue),
            3 => Some(Self::BlockRqComplete),
            4 => Some(Self::VfsReadEntry),
            5 => Some(Self::VfsReadExit),
            6 => Some(Self::VfsWriteEntry),
            7 => Some(Self::VfsWriteExit),
            8 => Some(Self::RemoteIssue),
            9 => Some(Self::RemoteComplete),
            _ => None,
        }
    }

    /// Convert from the canonical label name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.as_str() == name)
    }

    /// Return all probe kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::BlockRqInsert,
            Self::BlockRqIssue,
            Self::BlockRqComplete,
            Self::VfsReadEntry,
            Self::VfsReadExit,
            Self::VfsWriteEntry,
            Self::VfsWriteExit,
            Self::RemoteIssue,
            Self::RemoteComplete,
        ]
    }

    /// Stage boundaries this probe marks, in the order they must be applied.
    ///
    /// `block_rq_issue` closes the queue stage and opens the device stage for
    /// the same request, so it yields two transitions.
    pub const fn transitions(self) -> &'static [(Stage, Edge)] {
        match self {
            Self::BlockRqInsert => &[(Stage::Queue, Edge::Start)],
            Self::BlockRqIssue => &[(Stage::Queue, Edge::End), (Stage::Device, Edge::Start)],
            Self::BlockRqComplete => &[(Stage::Device, Edge::End)],
            Self::VfsReadEntry | Self::VfsWriteEntry => &[(Stage::Syscall, Edge::Start)],
            Self::VfsReadExit | Self::VfsWriteExit => &[(Stage::Syscall, Edge::End)],
            Self::RemoteIssue => &[(Stage::Remote, Edge::Start)],
            Self::RemoteComplete => &[(Stage::Remote, Edge::End)],
        }
    }

    /// True for synchronous wrappers keyed by calling task rather than by
    /// a kernel request handle.
    pub const fn is_task_scoped(self) -> bool {
        matches!(
            self,
            Self::VfsReadEntry | Self::VfsReadExit | Self::VfsWriteEntry | Self::VfsWriteExit
        )
    }

    /// Operation kind implied by the attach point itself, if any.
    pub const fn implied_op(self) -> Option<OpKind> {
        match self {
            Self::VfsReadEntry | Self::VfsReadExit => Some(OpKind::Read),
            Self::VfsWriteEntry | Self::VfsWriteExit => Some(OpKind::Write),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Read = 0,
    Write = 1,
}

impl OpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Segment of the I/O path measured by one start/end probe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// vfs_read/vfs_write entry to exit. Feeds read/write latency, IOPS and throughput.
    Syscall,
    /// Block request inserted into the scheduler queue until dispatched.
    Queue,
    /// Block request dispatched to the device until completion.
    Device,
    /// Network-backed volume request round trip.
    Remote,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syscall => "syscall",
            Self::Queue => "queue",
            Self::Device => "device",
            Self::Remote => "remote",
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Syscall, Self::Queue, Self::Device, Self::Remote]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a probe opens or closes a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    End,
}

/// A decoded probe sample.
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    /// Monotonic kernel timestamp in nanoseconds.
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    /// Cgroup id of the task current at probe time.
    pub cgroup_id: u64,
    pub probe: ProbeKind,
    pub op: OpKind,
    /// Kernel request pointer for block and remote probes. Unused for VFS probes.
    pub handle: u64,
    pub bytes: u64,
    /// Entity resolved from `cgroup_id`, filled by the collector.
    pub entity: Option<EntityId>,
}

/// A pending stage start awaiting its completion.
#[derive(Debug, Clone)]
pub struct RawIoEvent {
    pub entity: Option<EntityId>,
    pub op: OpKind,
    pub start_ns: u64,
    /// Absent until matched.
    pub end_ns: Option<u64>,
    pub bytes: u64,
}

/// One matched start/end pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedOperation {
    pub entity: EntityId,
    pub op: OpKind,
    pub stage: Stage,
    pub duration_ns: u64,
    pub bytes: u64,
    pub completed_ns: u64,
}
