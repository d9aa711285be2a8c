//! The system boundary.
//!
//! Everything the probe knows about the operating system comes through the
//! three traits in this module. Their contract is deliberately thin: a call
//! succeeds, reports that the caller's buffer is too small, or fails with a
//! raw status code. All interpretation happens above this line.
//!
//! ```text
//!            Session
//!               │
//!   ┌───────────┼──────────────┐
//!   │           │              │
//! CounterSource ModuleLoader  SystemApi
//!   │           │              │
//!   └─────┬─────┴──────┬───────┘
//!         │            │
//!  WindowsPlatform  MockPlatform
//! ```

use crate::error::SysResult;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Why a counter read did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The buffer was too small for the data; grow and retry.
    MoreData,
    /// Any other failure, with the raw OS code.
    Os(u32),
}

/// Opaque handle of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Address of a resolved entry point. Never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(usize);

impl Symbol {
    /// Wrap a raw address, rejecting null.
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Symbol(addr))
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// Source of self-describing counter blocks.
pub trait CounterSource {
    /// Read the counter data for `key` into `buf`, returning the number of
    /// bytes written.
    fn read_counters(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ReadError>;
}

/// Loader of optional system modules.
pub trait ModuleLoader {
    fn load_module(&mut self, name: &str) -> SysResult<ModuleHandle>;

    fn resolve_symbol(&mut self, module: ModuleHandle, name: &str) -> SysResult<Symbol>;

    fn free_module(&mut self, module: ModuleHandle);
}

/// Row and table enumerations of the host.
///
/// Calls that go through an optional entry point receive the resolved
/// [`Symbol`]; the caller has already checked it exists.
pub trait SystemApi {
    /// Per-processor time records, in 100 ns ticks.
    fn processor_performance(&mut self, query: Symbol) -> SysResult<Vec<ProcessorTimes>>;

    fn cpu_topology(&mut self) -> SysResult<CpuTopology>;

    /// Fill `buf` with native-endian pids, returning the number of bytes used.
    fn enum_processes(&mut self, enum_processes: Symbol, buf: &mut [u8]) -> SysResult<usize>;

    /// Memory totals, through the extended call when it resolved.
    fn memory_status(&mut self, status_ex: Option<Symbol>) -> SysResult<MemoryStatus>;

    fn number_of_interfaces(&mut self, get_count: Symbol) -> SysResult<u32>;

    fn if_table(&mut self, get_table: Symbol) -> SysResult<Vec<IfRow>>;

    /// Refresh one interface row in place, keyed by `row.index`.
    fn if_entry(&mut self, get_entry: Symbol, row: &mut IfRow) -> SysResult<()>;

    fn ip_addr_table(&mut self, get_table: Symbol) -> SysResult<Vec<IpAddrRow>>;

    fn adapters_info(&mut self, get_info: Symbol) -> SysResult<Vec<AdapterRow>>;

    fn network_params(&mut self, get_params: Symbol) -> SysResult<NetworkParams>;

    fn ip_forward_table(&mut self, get_table: Symbol) -> SysResult<Vec<RouteRow>>;

    fn tcp_table(&mut self, get_table: Symbol) -> SysResult<Vec<TcpRow>>;

    fn udp_table(&mut self, get_table: Symbol) -> SysResult<Vec<UdpRow>>;

    /// TCP rows with `owner_pid` filled in.
    fn tcp_owner_table(&mut self, get_table: Symbol) -> SysResult<Vec<TcpRow>>;

    /// UDP rows with `owner_pid` filled in.
    fn udp_owner_table(&mut self, get_table: Symbol) -> SysResult<Vec<UdpRow>>;

    fn disk_free_space(&mut self, path: &str) -> SysResult<DiskSpace>;

    fn logical_drives(&mut self) -> SysResult<Vec<DriveRow>>;

    /// The raw `KEY=VALUE\0...\0\0` environment block of a process.
    fn environment_block(&mut self, pid: u32) -> SysResult<Vec<u16>>;

    /// Creation, kernel and user times of a process.
    fn process_times(&mut self, pid: u32) -> SysResult<ProcessTimes>;

    /// Strings from the parameter block of a process.
    fn process_parameters(&mut self, pid: u32) -> SysResult<ProcessParameters>;

    /// Kernel and user times of the calling thread.
    fn current_thread_times(&mut self) -> SysResult<ThreadTimes>;

    fn processor_description(&mut self) -> SysResult<ProcessorDescription>;

    fn process_modules(
        &mut self,
        enum_modules: Symbol,
        module_file_name: Symbol,
        pid: u32,
    ) -> SysResult<Vec<String>>;

    /// Clients connected to this host's shares.
    fn net_sessions(&mut self) -> SysResult<Vec<NetSessionRow>>;

    /// Every hive loaded under `HKEY_USERS`.
    fn user_hives(&mut self) -> SysResult<Vec<UserHive>>;

    /// Active terminal services sessions.
    fn terminal_sessions(&mut self, api: &TerminalServicesApi)
        -> SysResult<Vec<TerminalSession>>;

    fn os_version(&mut self) -> SysResult<OsVersion>;

    fn uptime(&mut self) -> SysResult<Duration>;
}

/// Everything a session needs from the host.
pub trait Platform: CounterSource + ModuleLoader + SystemApi {}

impl<T: CounterSource + ModuleLoader + SystemApi> Platform for T {}

/// Entry points of the terminal services module, all required together.
#[derive(Debug, Clone, Copy)]
pub struct TerminalServicesApi {
    pub enumerate_sessions: Symbol,
    pub query_session: Symbol,
    pub free_memory: Symbol,
}

// ============================================================================
// Raw rows
// ============================================================================

/// One processor's cumulative times in 100 ns ticks. Kernel time includes idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorTimes {
    pub idle: u64,
    pub kernel: u64,
    pub user: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTopology {
    pub physical_cores: u32,
    pub threads_per_core: u32,
    pub hyperthreading: bool,
}

/// Registry description of processor 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorDescription {
    /// Raw CPUID vendor string such as `GenuineIntel`
    pub vendor_id: String,
    pub name: String,
    pub mhz: u32,
}

/// Process times in 100 ns ticks. `start` is a FILETIME.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessTimes {
    pub start: u64,
    pub kernel: u64,
    pub user: u64,
}

/// Thread times in 100 ns ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTimes {
    pub kernel: u64,
    pub user: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessParameters {
    pub command_line: String,
    pub image_path: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStatus {
    pub total_phys: u64,
    pub avail_phys: u64,
    pub total_page_file: u64,
    pub avail_page_file: u64,
}

pub const IF_TYPE_ETHERNET: u32 = 6;
pub const IF_TYPE_LOOPBACK: u32 = 24;
pub const IF_OPER_STATUS_CONNECTED: u32 = 4;
pub const IF_OPER_STATUS_OPERATIONAL: u32 = 5;

/// One interface table row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfRow {
    pub index: u32,
    pub if_type: u32,
    pub description: String,
    pub mtu: u32,
    pub speed: u64,
    pub phys_addr: Vec<u8>,
    pub oper_status: u32,
    pub in_octets: u64,
    pub in_ucast_pkts: u64,
    pub in_nucast_pkts: u64,
    pub in_discards: u64,
    pub in_errors: u64,
    pub out_octets: u64,
    pub out_ucast_pkts: u64,
    pub out_nucast_pkts: u64,
    pub out_discards: u64,
    pub out_errors: u64,
}

impl IfRow {
    pub fn is_operational(&self) -> bool {
        matches!(
            self.oper_status,
            IF_OPER_STATUS_CONNECTED | IF_OPER_STATUS_OPERATIONAL
        )
    }
}

pub const IPADDR_PRIMARY: u16 = 0x0001;

/// One IPv4 address table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAddrRow {
    pub index: u32,
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// Non-zero when the interface supports broadcast.
    pub bcast_addr: u32,
    pub addr_type: u16,
}

impl IpAddrRow {
    pub fn is_primary(&self) -> bool {
        self.addr_type & IPADDR_PRIMARY != 0
    }
}

/// One network adapter record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterRow {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub hw_addr: Vec<u8>,
    pub ip_address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dhcp_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkParams {
    pub host_name: String,
    pub domain_name: String,
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRow {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub next_hop: Ipv4Addr,
    pub metric: u32,
    pub if_index: u32,
}

pub const TCP_STATE_CLOSED: u32 = 1;
pub const TCP_STATE_LISTEN: u32 = 2;
pub const TCP_STATE_SYN_SENT: u32 = 3;
pub const TCP_STATE_SYN_RCVD: u32 = 4;
pub const TCP_STATE_ESTAB: u32 = 5;
pub const TCP_STATE_FIN_WAIT1: u32 = 6;
pub const TCP_STATE_FIN_WAIT2: u32 = 7;
pub const TCP_STATE_CLOSE_WAIT: u32 = 8;
pub const TCP_STATE_CLOSING: u32 = 9;
pub const TCP_STATE_LAST_ACK: u32 = 10;
pub const TCP_STATE_TIME_WAIT: u32 = 11;
pub const TCP_STATE_DELETE_TCB: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpRow {
    pub state: u32,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub owner_pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpRow {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub owner_pid: Option<u32>,
}

/// Free space of one volume, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub avail: u64,
    pub total: u64,
    pub free: u64,
}

pub const DRIVE_REMOVABLE: u32 = 2;
pub const DRIVE_FIXED: u32 = 3;
pub const DRIVE_REMOTE: u32 = 4;
pub const DRIVE_CDROM: u32 = 5;
pub const DRIVE_RAMDISK: u32 = 6;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveRow {
    pub root: String,
    pub drive_type: u32,
    pub serial: u32,
    pub fs_name: String,
}

/// One client session on a local share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetSessionRow {
    pub user: String,
    pub client: String,
    /// Seconds since the session was established
    pub active_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub domain: String,
}

/// The `Volatile Environment` key of a logged-on user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatileEnvironment {
    /// Last write time of the key, seconds since the unix epoch
    pub written: u64,
    pub client_name: Option<String>,
    pub session_name: Option<String>,
}

/// One subkey of `HKEY_USERS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserHive {
    pub name: String,
    /// `None` when the name is not a SID or the SID has no account
    pub account: Option<Account>,
    pub volatile: Option<VolatileEnvironment>,
}

pub const WTS_PROTOCOL_TYPE_CONSOLE: u16 = 0;

/// One active terminal services session. Fields the host would not report
/// are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalSession {
    pub station: String,
    pub protocol: Option<u16>,
    pub client_address: Option<Ipv4Addr>,
    pub user: Option<String>,
    /// Seconds since the unix epoch, 0 if unknown
    pub connect_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub service_pack: String,
    pub arch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_rejects_null() {
        assert!(Symbol::new(0).is_none());
        assert_eq!(Symbol::new(0x1000).map(Symbol::addr), Some(0x1000));
    }

    #[test]
    fn test_primary_address_flag() {
        let row = IpAddrRow {
            index: 1,
            addr: Ipv4Addr::new(10, 0, 0, 2),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            bcast_addr: 1,
            addr_type: IPADDR_PRIMARY | 0x0008,
        };
        assert!(row.is_primary());
        assert!(!IpAddrRow { addr_type: 0x0008, ..row }.is_primary());
    }
}
