//! Memory information module

use crate::capability::{Capability, Module, Resolution};
use crate::error::{ProbeError, Result};
use crate::platform::{MemoryStatus, Platform};
use crate::session::Session;
use crate::types::{Mem, Swap};
use tracing::debug;

/// Installed RAM in MiB, rounded up to a multiple of 8.
fn ram_mib(total: u64) -> u64 {
    let mib = total / (1024 * 1024);
    match mib % 8 {
        0 => mib,
        rem => mib + (8 - rem),
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

impl<P: Platform> Session<P> {
    fn memory_status(&mut self) -> Result<MemoryStatus> {
        // the extended call reports sizes above 4 GiB
        let status_ex = match self.capabilities.resolve(
            &mut self.platform,
            Module::Kernel32,
            Resolution::Strict,
        ) {
            Ok(()) => self.capabilities.symbol(Capability::GlobalMemoryStatusEx),
            Err(err) => {
                debug!(error = %err, "extended memory status unavailable, using legacy call");
                None
            }
        };

        self.platform
            .memory_status(status_ex)
            .map_err(ProbeError::from_os)
    }

    /// Physical memory.
    pub fn mem(&mut self) -> Result<Mem> {
        let status = self.memory_status()?;

        let total = status.total_phys;
        let free = status.avail_phys;
        let used = total.saturating_sub(free);

        Ok(Mem {
            total,
            free,
            used,
            actual_free: free,
            actual_used: used,
            used_percent: percent(used, total),
            free_percent: percent(free, total),
            ram: ram_mib(total),
        })
    }

    /// Page file usage.
    pub fn swap(&mut self) -> Result<Swap> {
        let status = self.memory_status()?;

        Ok(Swap {
            total: status.total_page_file,
            free: status.avail_page_file,
            used: status
                .total_page_file
                .saturating_sub(status.avail_page_file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ModuleState;
    use crate::config::SessionConfig;
    use crate::mock::MockPlatform;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn with_memory(platform: MockPlatform) -> MockPlatform {
        let mut platform = platform;
        platform.memory = MemoryStatus {
            total_phys: 8 * GIB,
            avail_phys: 2 * GIB,
            total_page_file: 12 * GIB,
            avail_page_file: 5 * GIB,
        };
        platform
    }

    #[test]
    fn test_ram_rounding() {
        assert_eq!(ram_mib(8 * GIB), 8192);
        assert_eq!(ram_mib(8 * GIB - 3 * 1024 * 1024), 8192);
        assert_eq!(ram_mib(1023 * 1024 * 1024), 1024);
        assert_eq!(ram_mib(0), 0);
    }

    #[test]
    fn test_mem() {
        let mut session =
            Session::with_platform(with_memory(MockPlatform::new()), SessionConfig::default());

        let mem = session.mem().unwrap();
        assert_eq!(mem.total, 8 * GIB);
        assert_eq!(mem.used, 6 * GIB);
        assert_eq!(mem.actual_free, 2 * GIB);
        assert_eq!(mem.used_percent, 75.0);
        assert_eq!(mem.free_percent, 25.0);
        assert_eq!(mem.ram, 8192);
    }

    #[test]
    fn test_mem_falls_back_without_extended_call() {
        let platform = with_memory(MockPlatform::new().without_symbol("GlobalMemoryStatusEx"));
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(session.mem().unwrap().total, 8 * GIB);
        assert!(matches!(
            session.capabilities().state(Module::Kernel32),
            ModuleState::Resolved(_)
        ));
    }

    #[test]
    fn test_swap() {
        let mut session =
            Session::with_platform(with_memory(MockPlatform::new()), SessionConfig::default());

        let swap = session.swap().unwrap();
        assert_eq!((swap.total, swap.used, swap.free), (12 * GIB, 7 * GIB, 5 * GIB));
    }
}
