//! Per-session table of optional system entry points.
//!
//! Entry points are grouped by the module that exports them. A module is
//! loaded at most once per session: a failed load marks it
//! [`ModuleState::Unavailable`] and later resolutions fail fast without
//! touching the loader again. Nothing here is process-global, so two sessions
//! never share handles or resolution state.

use crate::error::{ProbeError, Result, SysResult};
use crate::platform::{ModuleHandle, ModuleLoader, Symbol};
use tracing::debug;

/// A loadable system module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Kernel32,
    Iphlpapi,
    Psapi,
    Ntdll,
    Wtsapi32,
}

impl Module {
    pub const ALL: [Module; 5] = [
        Module::Kernel32,
        Module::Iphlpapi,
        Module::Psapi,
        Module::Ntdll,
        Module::Wtsapi32,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Module::Kernel32 => "kernel32.dll",
            Module::Iphlpapi => "iphlpapi.dll",
            Module::Psapi => "psapi.dll",
            Module::Ntdll => "ntdll.dll",
            Module::Wtsapi32 => "wtsapi32.dll",
        }
    }

    /// Entry points looked up when the module loads, in resolution order.
    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Module::Kernel32 => &[GlobalMemoryStatusEx],
            Module::Iphlpapi => &[
                GetIpForwardTable,
                GetIpAddrTable,
                GetIfTable,
                GetIfEntry,
                GetNumberOfInterfaces,
                GetTcpTable,
                GetUdpTable,
                GetExtendedTcpTable,
                GetExtendedUdpTable,
                GetNetworkParams,
                GetAdaptersInfo,
            ],
            Module::Psapi => &[EnumProcessModules, EnumProcesses, GetModuleFileNameExW],
            Module::Ntdll => &[NtQuerySystemInformation],
            Module::Wtsapi32 => &[
                WTSEnumerateSessionsW,
                WTSFreeMemory,
                WTSQuerySessionInformationW,
            ],
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// One optional entry point.
#[allow(clippy::enum_variant_names)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    GlobalMemoryStatusEx,
    GetIpForwardTable,
    GetIpAddrTable,
    GetIfTable,
    GetIfEntry,
    GetNumberOfInterfaces,
    GetTcpTable,
    GetUdpTable,
    GetExtendedTcpTable,
    GetExtendedUdpTable,
    GetNetworkParams,
    GetAdaptersInfo,
    EnumProcessModules,
    EnumProcesses,
    GetModuleFileNameExW,
    NtQuerySystemInformation,
    WTSEnumerateSessionsW,
    WTSFreeMemory,
    WTSQuerySessionInformationW,
}

impl Capability {
    pub fn module(self) -> Module {
        use Capability::*;
        match self {
            GlobalMemoryStatusEx => Module::Kernel32,
            GetIpForwardTable | GetIpAddrTable | GetIfTable | GetIfEntry
            | GetNumberOfInterfaces | GetTcpTable | GetUdpTable | GetExtendedTcpTable
            | GetExtendedUdpTable | GetNetworkParams | GetAdaptersInfo => Module::Iphlpapi,
            EnumProcessModules | EnumProcesses | GetModuleFileNameExW => Module::Psapi,
            NtQuerySystemInformation => Module::Ntdll,
            WTSEnumerateSessionsW | WTSFreeMemory | WTSQuerySessionInformationW => {
                Module::Wtsapi32
            }
        }
    }

    pub fn symbol_name(self) -> &'static str {
        use Capability::*;
        match self {
            GlobalMemoryStatusEx => "GlobalMemoryStatusEx",
            GetIpForwardTable => "GetIpForwardTable",
            GetIpAddrTable => "GetIpAddrTable",
            GetIfTable => "GetIfTable",
            GetIfEntry => "GetIfEntry",
            GetNumberOfInterfaces => "GetNumberOfInterfaces",
            GetTcpTable => "GetTcpTable",
            GetUdpTable => "GetUdpTable",
            GetExtendedTcpTable => "GetExtendedTcpTable",
            GetExtendedUdpTable => "GetExtendedUdpTable",
            GetNetworkParams => "GetNetworkParams",
            GetAdaptersInfo => "GetAdaptersInfo",
            EnumProcessModules => "EnumProcessModules",
            EnumProcesses => "EnumProcesses",
            GetModuleFileNameExW => "GetModuleFileNameExW",
            NtQuerySystemInformation => "NtQuerySystemInformation",
            WTSEnumerateSessionsW => "WTSEnumerateSessionsW",
            WTSFreeMemory => "WTSFreeMemory",
            WTSQuerySessionInformationW => "WTSQuerySessionInformationW",
        }
    }
}

/// How much of a module must resolve for [`CapabilityTable::resolve`] to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Every entry point of the module must be present.
    Strict,
    /// The module must load; callers check entry points one by one.
    Lenient,
}

/// Load state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unresolved,
    Resolved(ModuleHandle),
    /// The load failed with this code and will not be retried.
    Unavailable(u32),
}

#[derive(Debug)]
struct SymbolSlot {
    capability: Capability,
    /// `None` until the module has been loaded.
    resolved: Option<SysResult<Symbol>>,
}

#[derive(Debug)]
struct CapabilityModule {
    module: Module,
    state: ModuleState,
    symbols: Vec<SymbolSlot>,
}

impl CapabilityModule {
    fn new(module: Module) -> Self {
        Self {
            module,
            state: ModuleState::Unresolved,
            symbols: module
                .capabilities()
                .iter()
                .map(|&capability| SymbolSlot {
                    capability,
                    resolved: None,
                })
                .collect(),
        }
    }

    fn first_missing(&self) -> Option<(Capability, u32)> {
        self.symbols.iter().find_map(|slot| match slot.resolved {
            Some(Ok(_)) => None,
            Some(Err(code)) => Some((slot.capability, code)),
            None => Some((slot.capability, crate::error::ERROR_PROC_NOT_FOUND)),
        })
    }
}

/// The optional entry points of one session.
#[derive(Debug)]
pub struct CapabilityTable {
    modules: Vec<CapabilityModule>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self {
            modules: Module::ALL.iter().map(|&m| CapabilityModule::new(m)).collect(),
        }
    }

    pub fn state(&self, module: Module) -> ModuleState {
        self.modules[module.slot()].state
    }

    /// Load `module` if needed and resolve its entry points.
    ///
    /// Idempotent: a resolved module is not reloaded, an unavailable one
    /// fails with [`ProbeError::ModuleNotFound`] without calling the loader.
    pub fn resolve<L: ModuleLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        module: Module,
        mode: Resolution,
    ) -> Result<()> {
        let entry = &mut self.modules[module.slot()];

        match entry.state {
            ModuleState::Unavailable(_) => {
                return Err(ProbeError::ModuleNotFound(module.file_name()));
            }
            ModuleState::Resolved(_) => {}
            ModuleState::Unresolved => {
                let handle = match loader.load_module(module.file_name()) {
                    Ok(handle) => {
                        debug!(module = module.file_name(), "module loaded");
                        handle
                    }
                    Err(code) => {
                        debug!(module = module.file_name(), code, "module load failed");
                        entry.state = ModuleState::Unavailable(code);
                        return Err(ProbeError::Os(code));
                    }
                };
                entry.state = ModuleState::Resolved(handle);

                for slot in &mut entry.symbols {
                    let name = slot.capability.symbol_name();
                    let resolved = loader.resolve_symbol(handle, name);
                    match resolved {
                        Ok(_) => debug!(module = module.file_name(), symbol = name, "resolved"),
                        Err(code) => debug!(
                            module = module.file_name(),
                            symbol = name,
                            code,
                            "symbol not found"
                        ),
                    }
                    slot.resolved = Some(resolved);
                }
            }
        }

        if mode == Resolution::Strict {
            if let Some((capability, code)) = entry.first_missing() {
                debug!(
                    module = module.file_name(),
                    symbol = capability.symbol_name(),
                    "strict resolution failed"
                );
                return Err(ProbeError::Os(code));
            }
        }

        Ok(())
    }

    /// The resolved entry point, if its module is loaded and exports it.
    pub fn symbol(&self, capability: Capability) -> Option<Symbol> {
        self.modules[capability.module().slot()]
            .symbols
            .iter()
            .find(|slot| slot.capability == capability)
            .and_then(|slot| slot.resolved.and_then(|r| r.ok()))
    }

    /// Resolve leniently and return the entry point, or `None` when either the
    /// module or the entry point is missing.
    pub fn optional<L: ModuleLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        capability: Capability,
    ) -> Option<Symbol> {
        if let Err(e) = self.resolve(loader, capability.module(), Resolution::Lenient) {
            debug!(symbol = capability.symbol_name(), error = %e, "capability unavailable");
            return None;
        }
        self.symbol(capability)
    }

    /// Like [`CapabilityTable::optional`], with a missing entry point reported
    /// as [`ProbeError::NotImplemented`].
    pub fn require<L: ModuleLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        capability: Capability,
    ) -> Result<Symbol> {
        self.optional(loader, capability)
            .ok_or(ProbeError::NotImplemented(capability.symbol_name()))
    }

    /// Unload `module` and forget its entry points. Idempotent; an
    /// unavailable module stays unavailable.
    pub fn release<L: ModuleLoader + ?Sized>(&mut self, loader: &mut L, module: Module) {
        let entry = &mut self.modules[module.slot()];
        if let ModuleState::Resolved(handle) = entry.state {
            loader.free_module(handle);
            entry.state = ModuleState::Unresolved;
            debug!(module = module.file_name(), "module released");
        }
        for slot in &mut entry.symbols {
            slot.resolved = None;
        }
    }

    pub fn release_all<L: ModuleLoader + ?Sized>(&mut self, loader: &mut L) {
        for module in Module::ALL {
            self.release(loader, module);
        }
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}
