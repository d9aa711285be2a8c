//! Result types handed back by a session

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Declare a set of bit flags as a `u32` newtype.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $bit:expr; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($bit); )+

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

// ============================================================================
// CPU
// ============================================================================

/// Cumulative CPU times in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Time spent in user mode
    pub user: u64,
    /// Time spent in kernel mode, idle excluded
    pub sys: u64,
    /// Always 0 on this platform
    pub nice: u64,
    /// Time spent idle
    pub idle: u64,
    /// Always 0 on this platform
    pub wait: u64,
    /// `user + sys + idle + wait`
    pub total: u64,
}

impl Cpu {
    pub(crate) fn finish(mut self) -> Self {
        self.total = self.user + self.sys + self.idle + self.wait;
        self
    }
}

/// Static description of one logical CPU
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Short vendor name such as `Intel` or `AMD`
    pub vendor: String,
    pub model_name: String,
    /// Nominal clock speed
    pub frequency_mhz: u64,
    pub physical_cores: u32,
    pub logical_cores: u32,
}

/// CPU times of the calling thread in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCpu {
    pub user: u64,
    pub sys: u64,
    pub total: u64,
}

// ============================================================================
// Processes
// ============================================================================

/// Process information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Parent process ID
    pub ppid: u32,
    /// Process name
    pub name: String,
    /// Process state
    pub state: ProcessState,
    /// Virtual memory size in bytes
    pub virtual_memory: u64,
    /// Working set in bytes
    pub resident_memory: u64,
    /// Page faults since start
    pub page_faults: u64,
    /// Base priority
    pub priority: u32,
    /// Open handles
    pub handles: u32,
    /// Number of threads
    pub threads: u32,
    /// Processor time in milliseconds
    pub cpu_time_ms: u64,
    /// Start time, milliseconds since the unix epoch (0 if unknown)
    pub start_time: u64,
}

/// Start time and CPU times of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTime {
    /// Milliseconds since the unix epoch (0 if unknown)
    pub start_time: u64,
    /// User-mode time in milliseconds
    pub user: u64,
    /// Kernel-mode time in milliseconds
    pub sys: u64,
    /// `user + sys`
    pub total: u64,
}

/// Executable path and working directory of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExe {
    /// Full path of the image
    pub name: String,
    /// Working directory without a trailing separator
    pub cwd: String,
    /// Drive root of the working directory, such as `C:\`
    pub root: String,
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessState {
    /// Running
    Running,
    /// Unknown state
    #[default]
    Unknown,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "Running"),
            ProcessState::Unknown => write!(f, "Unknown"),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Physical memory, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Mem {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    /// Free memory including reclaimable caches
    pub actual_free: u64,
    pub actual_used: u64,
    pub used_percent: f64,
    pub free_percent: f64,
    /// Installed RAM in MiB, rounded up to a multiple of 8
    pub ram: u64,
}

/// Page file, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

// ============================================================================
// Filesystems
// ============================================================================

/// Kind of a mounted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FsType {
    #[default]
    None,
    LocalDisk,
    Network,
    RamDisk,
    Cdrom,
}

impl FsType {
    /// Generic name of the kind, used when the volume reports no filesystem name
    pub fn type_name(self) -> &'static str {
        match self {
            FsType::None => "none",
            FsType::LocalDisk => "local",
            FsType::Network => "remote",
            FsType::RamDisk => "ram",
            FsType::Cdrom => "cdrom",
        }
    }
}

/// One mounted volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    /// Mount point, e.g. `C:\`
    pub dir_name: String,
    /// Device name; the same as the mount point on this platform
    pub dev_name: String,
    pub fs_type: FsType,
    /// Generic type name, see [`FsType::type_name`]
    pub type_name: String,
    /// Filesystem name reported by the volume (`NTFS`, `CDFS`, ...)
    pub sys_type_name: String,
}

/// I/O counters of the disk backing a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIo {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub queue: u64,
}

/// Space usage of one volume, in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSystemUsage {
    pub total: u64,
    pub free: u64,
    /// Free space available to the caller
    pub avail: u64,
    pub used: u64,
    /// Fraction of usable space in use, 0.0 - 1.0
    pub use_percent: f64,
    /// Disk counters, when the system provides them for this volume
    pub disk: Option<DiskIo>,
}

// ============================================================================
// Network
// ============================================================================

flag_set! {
    /// Interface flags
    pub struct InterfaceFlags {
        const UP = 0x1;
        const BROADCAST = 0x2;
        const LOOPBACK = 0x8;
        const RUNNING = 0x40;
        const MULTICAST = 0x800;
    }
}

pub const NIC_ETHERNET: &str = "Ethernet";
pub const NIC_LOOPBACK: &str = "Local Loopback";

/// Configuration of one network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    /// Link type, [`NIC_ETHERNET`] or [`NIC_LOOPBACK`]
    pub if_type: String,
    pub description: String,
    /// Hardware address as `XX:XX:XX:XX:XX:XX`
    pub hwaddr: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub flags: InterfaceFlags,
    pub mtu: u32,
}

/// Traffic counters of one network interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    /// Unicast and non-unicast packets received
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    /// Link speed in bits per second
    pub speed: u64,
}

flag_set! {
    /// Selects which connections a walk reports
    pub struct NetConnFlags {
        /// Connections this host initiated
        const CLIENT = 0x01;
        /// Listening sockets
        const SERVER = 0x02;
        const TCP = 0x10;
        const UDP = 0x20;
    }
}

/// Socket protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketProtocol::Tcp => write!(f, "tcp"),
            SocketProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Socket/TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SocketState {
    /// Connection established
    Established,
    /// Waiting for SYN+ACK (connect)
    SynSent,
    /// Waiting for ACK after receiving SYN
    SynReceived,
    /// Waiting for FIN ACK
    FinWait1,
    /// Waiting for FIN
    FinWait2,
    /// Waiting for enough time to pass to ensure remote received ACK
    TimeWait,
    /// Connection closed
    Closed,
    /// Waiting for connection termination from remote
    CloseWait,
    /// Waiting for connection termination ACK
    LastAck,
    /// Listening for incoming connections
    Listen,
    /// Waiting for ACK of connection termination
    Closing,
    /// Unknown state, and every UDP socket
    #[default]
    Unknown,
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketState::Established => write!(f, "ESTABLISHED"),
            SocketState::SynSent => write!(f, "SYN_SENT"),
            SocketState::SynReceived => write!(f, "SYN_RECV"),
            SocketState::FinWait1 => write!(f, "FIN_WAIT1"),
            SocketState::FinWait2 => write!(f, "FIN_WAIT2"),
            SocketState::TimeWait => write!(f, "TIME_WAIT"),
            SocketState::Closed => write!(f, "CLOSED"),
            SocketState::CloseWait => write!(f, "CLOSE_WAIT"),
            SocketState::LastAck => write!(f, "LAST_ACK"),
            SocketState::Listen => write!(f, "LISTEN"),
            SocketState::Closing => write!(f, "CLOSING"),
            SocketState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One socket reported by a connection walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConnection {
    pub protocol: SocketProtocol,
    pub local_address: Ipv4Addr,
    pub local_port: u16,
    /// Unspecified for UDP sockets
    pub remote_address: Ipv4Addr,
    /// 0 for UDP sockets
    pub remote_port: u16,
    pub state: SocketState,
}

flag_set! {
    /// Route flags
    pub struct RouteFlags {
        const UP = 0x1;
        const GATEWAY = 0x2;
    }
}

/// One IPv4 forwarding table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRoute {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub metric: u32,
    pub flags: RouteFlags,
}

/// Host-wide network settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    pub host_name: String,
    pub domain_name: String,
    pub primary_dns: String,
    pub secondary_dns: String,
    pub default_gateway: String,
}

// ============================================================================
// Users and system
// ============================================================================

/// One logged-in user session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Who {
    pub user: String,
    pub device: String,
    pub host: String,
    /// Connect time, seconds since the unix epoch (0 if unknown)
    pub time: u64,
}

/// Identity of the running operating system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfo {
    pub name: String,
    /// `major.minor`
    pub version: String,
    pub arch: String,
    /// `"{vendor} {vendor_name}"`
    pub description: String,
    /// Service pack
    pub patch_level: String,
    pub vendor: String,
    pub vendor_name: String,
    pub vendor_version: String,
    pub vendor_code_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_ops() {
        let mut flags = InterfaceFlags::UP | InterfaceFlags::RUNNING;
        assert!(flags.contains(InterfaceFlags::UP));
        assert!(!flags.contains(InterfaceFlags::UP | InterfaceFlags::LOOPBACK));
        assert!(flags.intersects(InterfaceFlags::UP | InterfaceFlags::LOOPBACK));

        flags.insert(InterfaceFlags::BROADCAST);
        assert_eq!(flags.bits(), 0x43);
        assert_eq!(InterfaceFlags::empty().bits(), 0);
    }

    #[test]
    fn test_cpu_total() {
        let cpu = Cpu {
            user: 20,
            sys: 10,
            idle: 30,
            ..Default::default()
        }
        .finish();
        assert_eq!(cpu.total, 60);
    }

    #[test]
    fn test_fs_type_names() {
        assert_eq!(FsType::LocalDisk.type_name(), "local");
        assert_eq!(FsType::default().type_name(), "none");
    }
}
