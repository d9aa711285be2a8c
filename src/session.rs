//! The session handle.
//!
//! A session owns every piece of mutable probe state: the scratch buffer,
//! the capability table, the row caches and the last process lookup. Queries
//! take `&mut self`, so one session serves one caller at a time; open one
//! session per thread if several need to probe concurrently.
//!
//! The queries themselves live with their metric family (`cpu.rs`,
//! `process.rs`, `netif.rs`, ...) as further `impl` blocks on [`Session`].

use crate::buffer::ScratchBuffer;
use crate::cache::RowCache;
use crate::capability::{Capability, CapabilityTable};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::perf::{self, HyperThreadHeuristic, PerfObject, SiblingPolicy};
use crate::platform::{AdapterRow, IfRow, IpAddrRow, Platform, Symbol};
use crate::types::ProcessInfo;
use std::time::Instant;
use tracing::debug;

/// The most recent successful process lookup.
#[derive(Debug, Clone)]
pub(crate) struct ProcessSnapshot {
    pub(crate) info: ProcessInfo,
    pub(crate) taken: Instant,
}

/// A probe session over a [`Platform`].
pub struct Session<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: SessionConfig,
    pub(crate) buffer: ScratchBuffer,
    pub(crate) capabilities: CapabilityTable,
    pub(crate) adapters: Option<RowCache<AdapterRow>>,
    pub(crate) addresses: Option<RowCache<IpAddrRow>>,
    pub(crate) interfaces: Option<RowCache<IfRow>>,
    pub(crate) last_process: Option<ProcessSnapshot>,
    pub(crate) siblings: Box<dyn SiblingPolicy>,
}

impl<P: Platform> Session<P> {
    /// Open a session over any platform implementation.
    pub fn with_platform(platform: P, config: SessionConfig) -> Self {
        debug!(
            buffer_increment = config.buffer_increment,
            "opening probe session"
        );
        Self {
            platform,
            buffer: ScratchBuffer::new(config.buffer_increment),
            config,
            capabilities: CapabilityTable::new(),
            adapters: None,
            addresses: None,
            interfaces: None,
            last_process: None,
            siblings: Box::new(HyperThreadHeuristic),
        }
    }

    /// Replace the policy deciding how processor records merge into CPUs.
    pub fn with_sibling_policy(mut self, policy: impl SiblingPolicy + 'static) -> Self {
        self.siblings = Box::new(policy);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Release every module, cache and buffer held by the session.
    pub fn close(self) {
        // Drop does the work
    }

    fn release(&mut self) {
        self.capabilities.release_all(&mut self.platform);
        self.adapters = None;
        self.addresses = None;
        self.interfaces = None;
        self.last_process = None;
        self.buffer = ScratchBuffer::new(self.config.buffer_increment);
    }

    /// Counter block for `key`, valid until the next query.
    pub(crate) fn query(&mut self, key: &str) -> Result<PerfObject<'_>> {
        perf::query(&mut self.platform, &mut self.buffer, key)
    }

    pub(crate) fn require(&mut self, capability: Capability) -> Result<Symbol> {
        self.capabilities.require(&mut self.platform, capability)
    }

    pub(crate) fn optional(&mut self, capability: Capability) -> Option<Symbol> {
        self.capabilities.optional(&mut self.platform, capability)
    }

    /// An empty row cache sized for the host's interface count.
    pub(crate) fn new_netif_cache<V: Clone>(&mut self, name: &'static str) -> RowCache<V> {
        let count = self
            .optional(Capability::GetNumberOfInterfaces)
            .and_then(|get_count| self.platform.number_of_interfaces(get_count).ok())
            .unwrap_or(0);

        let capacity = match count {
            0 => self.config.default_cache_capacity,
            n => n as usize,
        };
        RowCache::with_capacity(name, capacity)
    }
}

impl<P: Platform> Drop for Session<P> {
    fn drop(&mut self) {
        self.release();
        debug!("probe session closed");
    }
}

#[cfg(target_os = "windows")]
impl Session<crate::os::windows::WindowsPlatform> {
    /// Open a session over the running system.
    pub fn open() -> Result<Self> {
        Self::open_with(SessionConfig::default())
    }

    pub fn open_with(config: SessionConfig) -> Result<Self> {
        let platform = crate::os::windows::WindowsPlatform::new()
            .map_err(crate::error::ProbeError::from_os)?;
        Ok(Self::with_platform(platform, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Module, ModuleState};
    use crate::error::ProbeError;
    use crate::mock::MockPlatform;
    use crate::perf::KEY_PROCESS;

    #[test]
    fn test_failed_query_leaves_session_usable() {
        let mut platform = MockPlatform::new();
        platform.counter_errors.insert(KEY_PROCESS.to_string(), 5);
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(session.query(KEY_PROCESS).unwrap_err(), ProbeError::Os(5));

        session.platform_mut().counter_errors.clear();
        session.platform_mut().counters.insert(
            KEY_PROCESS.to_string(),
            crate::mock::BlockBuilder::new()
                .object(230, &[784])
                .instance("System", &[4])
                .build(),
        );
        assert!(session.query(KEY_PROCESS).is_ok());
    }

    #[test]
    fn test_netif_cache_sized_from_interface_count() {
        let mut platform = MockPlatform::new();
        platform.interfaces = vec![IfRow::default(); 3];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let cache: RowCache<IfRow> = session.new_netif_cache("interfaces");
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 3);
        assert_eq!(session.platform().calls.number_of_interfaces, 1);
        assert!(matches!(
            session.capabilities().state(Module::Iphlpapi),
            ModuleState::Resolved(_)
        ));
    }

    #[test]
    fn test_netif_cache_falls_back_to_configured_capacity() {
        let platform = MockPlatform::new().without_symbol("GetNumberOfInterfaces");
        let config = SessionConfig::default().with_default_cache_capacity(7);
        let mut session = Session::with_platform(platform, config);

        let cache: RowCache<IfRow> = session.new_netif_cache("interfaces");
        assert_eq!(cache.capacity(), 7);
    }

    #[test]
    fn test_close_releases_modules() {
        let mut session =
            Session::with_platform(MockPlatform::new(), SessionConfig::default());
        session.require(Capability::GetIfTable).unwrap();
        session.require(Capability::EnumProcesses).unwrap();

        session.release();
        assert_eq!(session.platform().calls.module_frees, 2);
        assert_eq!(
            session.capabilities().state(Module::Psapi),
            ModuleState::Unresolved
        );
        session.close();
    }
}
