//! # sysprobe
//!
//! A Windows system information probe built on the self-describing
//! performance counter blocks of the registry, with optional system modules
//! loaded on demand:
//! - CPU times, in total, per CPU and for the calling thread, plus processor descriptions
//! - Process list, details, times, arguments, executable, environment and loaded modules
//! - Memory and swap
//! - Filesystems, usage and disk counters
//! - Network interfaces, routes, connections and port owners
//! - Logged-in users, OS identity and uptime
//!
//! ## Data sources
//!
//! | Feature | Primary | Fallback |
//! |---------|---------|----------|
//! | CPU | `NtQuerySystemInformation` | counter key `238` |
//! | Process list | `EnumProcesses` | counter key `230` |
//! | Process info | counter key `230` | |
//! | Process times | `GetProcessTimes` | |
//! | Process args, executable, remote environment | process parameter block | |
//! | CPU descriptions | `CentralProcessor\0` registry key | |
//! | Memory | `GlobalMemoryStatusEx` | `GlobalMemoryStatus` |
//! | Disk counters | counter key `236` | |
//! | Filesystems | `GetLogicalDriveStringsW`, `GetDiskFreeSpaceExW` | |
//! | Interfaces | `GetIfTable`, `GetIpAddrTable`, `GetAdaptersInfo` | |
//! | Connections | `GetTcpTable`, `GetUdpTable` | |
//! | Port owner | `GetExtendedTcpTable`, `GetExtendedUdpTable` | |
//! | Who | `NetSessionEnum`, `HKEY_USERS` hives, `WTSEnumerateSessionsW` (merged) | |
//!
//! Every query goes through a [`Session`]. A session owns the scratch buffer
//! counter blocks are read into, the table of loaded modules and resolved
//! entry points, and the network row caches. Dropping it releases all of
//! them.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(target_os = "windows")]
//! fn main() -> sysprobe::Result<()> {
//!     let mut session = sysprobe::Session::open()?;
//!
//!     let cpu = session.cpu()?;
//!     println!("CPU: user {} ms, sys {} ms, idle {} ms", cpu.user, cpu.sys, cpu.idle);
//!
//!     for pid in session.process_list()? {
//!         if let Ok(info) = session.process_info(pid) {
//!             println!("{:>6} {:>10} {}", pid, info.resident_memory, info.threads);
//!         }
//!     }
//!
//!     for name in session.interface_list()? {
//!         let config = session.interface_config(&name)?;
//!         println!("{}: {} {}", name, config.address, config.hwaddr);
//!     }
//!
//!     Ok(())
//! }
//! # #[cfg(not(target_os = "windows"))]
//! # fn main() {}
//! ```
//!
//! ## Testing without a Windows host
//!
//! [`Session::with_platform`] accepts any [`platform::Platform`]. The
//! [`mock`] module provides one that serves counter blocks written by
//! [`mock::BlockBuilder`] and canned table rows:
//!
//! ```rust
//! use sysprobe::mock::{BlockBuilder, MockPlatform};
//! use sysprobe::{Session, SessionConfig};
//!
//! let block = BlockBuilder::new()
//!     .object(230, &[784])
//!     .instance("Idle", &[0])
//!     .instance("System", &[4])
//!     .build();
//! let platform = MockPlatform::new()
//!     .with_counters("230", block)
//!     .without_module("psapi.dll");
//!
//! let mut session = Session::with_platform(platform, SessionConfig::default());
//! assert_eq!(session.process_list().unwrap(), vec![4]);
//! ```

pub mod buffer;
pub mod cache;
pub mod capability;
pub mod config;
pub mod cpu;
pub mod disk;
pub mod error;
pub mod memory;
pub mod mock;
pub mod netif;
pub mod os;
pub mod perf;
pub mod platform;
pub mod process;
pub mod session;
pub mod socket;
pub mod sysinfo;
pub mod types;
pub mod util;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::{ProbeError, Result};
pub use session::Session;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
