//! The running Windows host.
//!
//! Statically linked calls go through the `windows` crate. Entry points the
//! session resolves at run time arrive as a [`Symbol`] and are called through
//! the function types declared below. IP helper tables are decoded from
//! their raw bytes with the same bounds-checked readers the counter parser
//! uses.

use crate::error::{SysResult, ERROR_CALL_NOT_IMPLEMENTED};
use crate::platform::*;
use crate::util::{read_u16, read_u32, read_u64, read_utf16z, split_multi_sz};
use std::ffi::{c_void, CString};
use std::mem;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

use ::windows::core::{PCSTR, PCWSTR, PWSTR};
use ::windows::Win32::Foundation::{
    CloseHandle, LocalFree, BOOL, ERROR_MORE_DATA, ERROR_SUCCESS, FILETIME, HANDLE, HLOCAL,
    HMODULE, PSID,
};
use ::windows::Win32::NetworkManagement::IpHelper::{
    FIXED_INFO_W2KSP1, IP_ADAPTER_INFO, IP_ADDR_STRING, TCP_TABLE_CLASS, TCP_TABLE_OWNER_PID_ALL,
    UDP_TABLE_CLASS, UDP_TABLE_OWNER_PID,
};
use ::windows::Win32::NetworkManagement::NetManagement::{NetApiBufferFree, NetSessionEnum};
use ::windows::Win32::Networking::WinSock::AF_INET;
use ::windows::Win32::Security::Authorization::ConvertStringSidToSidW;
use ::windows::Win32::Security::{LookupAccountSidW, SID_NAME_USE};
use ::windows::Win32::Storage::FileSystem::{
    GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDriveStringsW, GetVolumeInformationW,
};
use ::windows::Win32::System::Diagnostics::Debug::{
    ReadProcessMemory, SetErrorMode, SEM_FAILCRITICALERRORS, THREAD_ERROR_MODE,
};
use ::windows::Win32::System::Environment::{FreeEnvironmentStringsW, GetEnvironmentStringsW};
use ::windows::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryW,
};
use ::windows::Win32::System::Registry::{
    RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryInfoKeyW, RegQueryValueExW, HKEY,
    HKEY_LOCAL_MACHINE, HKEY_PERFORMANCE_DATA, HKEY_USERS, KEY_READ,
};
use ::windows::Win32::System::SystemInformation::{
    GetLogicalProcessorInformation, GetNativeSystemInfo, GetSystemInfo, GetTickCount64,
    GlobalMemoryStatus, RelationProcessorCore, MEMORYSTATUS, MEMORYSTATUSEX, OSVERSIONINFOW,
    SYSTEM_INFO, SYSTEM_LOGICAL_PROCESSOR_INFORMATION,
};
use ::windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThread, GetProcessTimes, GetThreadTimes, OpenProcess,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

const ERROR_INVALID_DATA: u32 = 13;
const ERROR_BUFFER_OVERFLOW: u32 = 111;
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_NO_DATA: u32 = 232;
const NERR_SUCCESS: u32 = 0;
const MAX_PREFERRED_LENGTH: u32 = u32::MAX;

const SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION: u32 = 8;
const LTP_PC_SMT: u8 = 1;

// ============================================================================
// Entry point signatures
// ============================================================================

type NtQuerySystemInformationFn =
    unsafe extern "system" fn(class: u32, info: *mut c_void, len: u32, returned: *mut u32) -> i32;
type EnumProcessesFn = unsafe extern "system" fn(pids: *mut u32, cb: u32, needed: *mut u32) -> BOOL;
type EnumProcessModulesFn = unsafe extern "system" fn(
    process: HANDLE,
    modules: *mut HMODULE,
    cb: u32,
    needed: *mut u32,
) -> BOOL;
type GetModuleFileNameExWFn =
    unsafe extern "system" fn(process: HANDLE, module: HMODULE, name: *mut u16, size: u32) -> u32;
type GlobalMemoryStatusExFn = unsafe extern "system" fn(status: *mut MEMORYSTATUSEX) -> BOOL;
type GetNumberOfInterfacesFn = unsafe extern "system" fn(count: *mut u32) -> u32;
type GetTableFn = unsafe extern "system" fn(table: *mut c_void, size: *mut u32, order: BOOL) -> u32;
type GetIfEntryFn = unsafe extern "system" fn(row: *mut c_void) -> u32;
type GetInfoFn = unsafe extern "system" fn(info: *mut c_void, size: *mut u32) -> u32;
type GetExtendedTcpTableFn = unsafe extern "system" fn(
    table: *mut c_void,
    size: *mut u32,
    order: BOOL,
    af: u32,
    class: TCP_TABLE_CLASS,
    reserved: u32,
) -> u32;
type GetExtendedUdpTableFn = unsafe extern "system" fn(
    table: *mut c_void,
    size: *mut u32,
    order: BOOL,
    af: u32,
    class: UDP_TABLE_CLASS,
    reserved: u32,
) -> u32;
type WtsEnumerateSessionsFn = unsafe extern "system" fn(
    server: HANDLE,
    reserved: u32,
    version: u32,
    sessions: *mut *mut WtsSessionInfo,
    count: *mut u32,
) -> BOOL;
type WtsQuerySessionInformationFn = unsafe extern "system" fn(
    server: HANDLE,
    session_id: u32,
    class: i32,
    buffer: *mut PWSTR,
    returned: *mut u32,
) -> BOOL;
type WtsFreeMemoryFn = unsafe extern "system" fn(memory: *mut c_void);
type RtlGetVersionFn = unsafe extern "system" fn(info: *mut OSVERSIONINFOW) -> i32;
type NtQueryInformationProcessFn = unsafe extern "system" fn(
    process: HANDLE,
    class: u32,
    info: *mut c_void,
    len: u32,
    returned: *mut u32,
) -> i32;

/// Reinterpret a resolved entry point as a function of type `F`.
///
/// # Safety
///
/// `F` must be the function pointer type of the exported symbol.
unsafe fn entry<F: Copy>(symbol: Symbol) -> F {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
    mem::transmute_copy(&symbol.addr())
}

fn last_error() -> u32 {
    win32_code(&::windows::core::Error::from_win32())
}

fn win32_code(err: &::windows::core::Error) -> u32 {
    let hr = err.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

/// An export of the always-loaded ntdll.
fn ntdll_entry(name: PCSTR) -> SysResult<Symbol> {
    let ntdll = unsafe { GetModuleHandleW(::windows::core::w!("ntdll.dll")) }
        .map_err(|e| win32_code(&e))?;
    unsafe { GetProcAddress(ntdll, name) }
        .and_then(|f| Symbol::new(f as usize))
        .ok_or(crate::error::ERROR_PROC_NOT_FOUND)
}

fn filetime(ft: &FILETIME) -> u64 {
    u64::from(ft.dwHighDateTime) << 32 | u64::from(ft.dwLowDateTime)
}

fn filetime_to_unix_secs(ticks: u64) -> Option<u64> {
    ticks
        .checked_sub(EPOCH_DIFFERENCE)
        .map(|since_epoch| since_epoch / 10_000_000)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A NUL-terminated ANSI string of at most `max` bytes.
///
/// # Safety
///
/// `ptr` must be valid for `max` bytes.
unsafe fn ansi(ptr: *const u8, max: usize) -> String {
    let bytes = std::slice::from_raw_parts(ptr, max);
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_ipv4(data: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let raw: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
    Some(Ipv4Addr::from(raw))
}

// ports sit in network order in the low word of a DWORD
fn read_port(data: &[u8], offset: usize) -> Option<u16> {
    read_u16(data, offset).map(u16::swap_bytes)
}

// ============================================================================
// Guards
// ============================================================================

struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(pid: u32) -> SysResult<Self> {
        unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }
            .map(ProcessHandle)
            .map_err(|e| win32_code(&e))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct EnvironmentStrings(PWSTR);

impl EnvironmentStrings {
    fn current() -> SysResult<Self> {
        let block = unsafe { GetEnvironmentStringsW() };
        if block.is_null() {
            return Err(last_error());
        }
        Ok(EnvironmentStrings(block))
    }

    /// The block up to and including its final double NUL.
    fn units(&self) -> &[u16] {
        let start = self.0 .0 as *const u16;
        let mut len = 0;
        unsafe {
            while *start.add(len) != 0 || *start.add(len + 1) != 0 {
                len += 1;
            }
            std::slice::from_raw_parts(start, len + 2)
        }
    }
}

impl Drop for EnvironmentStrings {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeEnvironmentStringsW(PCWSTR(self.0 .0));
        }
    }
}

/// Offsets into the parameter block of a process of the same bitness.
#[cfg(target_pointer_width = "64")]
mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x20;
    pub const CURRENT_DIRECTORY: usize = 0x38;
    pub const IMAGE_PATH_NAME: usize = 0x60;
    pub const COMMAND_LINE: usize = 0x70;
    pub const ENVIRONMENT: usize = 0x80;
}

#[cfg(target_pointer_width = "32")]
mod peb {
    pub const PROCESS_PARAMETERS: usize = 0x10;
    pub const CURRENT_DIRECTORY: usize = 0x24;
    pub const IMAGE_PATH_NAME: usize = 0x38;
    pub const COMMAND_LINE: usize = 0x40;
    pub const ENVIRONMENT: usize = 0x48;
}

const PROCESS_BASIC_INFORMATION: u32 = 0;
const PAGE_SIZE: usize = 4096;
const ENVIRONMENT_LIMIT: usize = 1 << 20;
const POINTER: usize = mem::size_of::<usize>();

/// Reads the address space of another process through an open handle.
struct RemoteProcess(ProcessHandle);

impl RemoteProcess {
    fn open(pid: u32) -> SysResult<Self> {
        ProcessHandle::open(pid).map(RemoteProcess)
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> SysResult<()> {
        unsafe {
            ReadProcessMemory(
                (self.0).0,
                addr as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                None,
            )
        }
        .map_err(|e| win32_code(&e))
    }

    fn read_pointer(&self, addr: usize) -> SysResult<usize> {
        let mut raw = [0u8; POINTER];
        self.read(addr, &mut raw)?;
        Ok(usize::from_ne_bytes(raw))
    }

    /// Address of the process parameter block.
    fn parameters(&self) -> SysResult<usize> {
        let query: NtQueryInformationProcessFn =
            unsafe { entry(ntdll_entry(::windows::core::s!("NtQueryInformationProcess"))?) };

        let mut info = [0usize; 6];
        let status = unsafe {
            query(
                (self.0).0,
                PROCESS_BASIC_INFORMATION,
                info.as_mut_ptr().cast(),
                mem::size_of_val(&info) as u32,
                std::ptr::null_mut(),
            )
        };
        if status != 0 {
            return Err(status as u32);
        }

        // PebBaseAddress follows the exit status
        match info[1] {
            0 => Err(ERROR_CALL_NOT_IMPLEMENTED),
            base => self.read_pointer(base + peb::PROCESS_PARAMETERS),
        }
    }

    /// A counted UTF-16 string whose header sits at `addr`.
    fn read_unicode_string(&self, addr: usize) -> SysResult<String> {
        let mut header = [0u8; 2 * POINTER];
        self.read(addr, &mut header)?;
        let len = read_u16(&header, 0).unwrap_or(0) as usize;
        let mut buffer = [0u8; POINTER];
        buffer.copy_from_slice(&header[POINTER..]);
        let buffer = usize::from_ne_bytes(buffer);
        if len == 0 || buffer == 0 {
            return Ok(String::new());
        }

        let mut text = vec![0u8; len];
        self.read(buffer, &mut text)?;
        read_utf16z(&text, 0, len).ok_or(ERROR_INVALID_DATA)
    }

    /// The environment block, read a page at a time up to its double NUL.
    fn environment(&self) -> SysResult<Vec<u16>> {
        let mut addr = self.read_pointer(self.parameters()? + peb::ENVIRONMENT)?;
        if addr == 0 {
            return Err(ERROR_CALL_NOT_IMPLEMENTED);
        }
        let mut units: Vec<u16> = Vec::new();

        loop {
            let mut chunk = vec![0u8; PAGE_SIZE - addr % PAGE_SIZE];
            self.read(addr, &mut chunk)?;
            units.extend(
                chunk
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]])),
            );
            if let Some(end) = units.windows(2).position(|w| w == [0, 0]) {
                units.truncate(end + 2);
                return Ok(units);
            }
            if units.len() * 2 >= ENVIRONMENT_LIMIT {
                return Err(ERROR_INVALID_DATA);
            }
            addr += chunk.len();
        }
    }
}

/// An open registry key.
struct RegistryKey(HKEY);

impl RegistryKey {
    fn open(parent: HKEY, path: &str) -> SysResult<Self> {
        let path = wide(path);
        let mut key = HKEY::default();
        let status =
            unsafe { RegOpenKeyExW(parent, PCWSTR(path.as_ptr()), 0, KEY_READ, &mut key) };
        match status {
            ERROR_SUCCESS => Ok(RegistryKey(key)),
            other => Err(other.0),
        }
    }

    fn value(&self, name: &str, buf: &mut [u8]) -> Option<usize> {
        let name = wide(name);
        let mut len = buf.len() as u32;
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(name.as_ptr()),
                None,
                None,
                Some(buf.as_mut_ptr()),
                Some(&mut len as *mut u32),
            )
        };
        (status == ERROR_SUCCESS).then_some(len as usize)
    }

    fn string(&self, name: &str) -> Option<String> {
        let mut buf = [0u8; 512];
        let len = self.value(name, &mut buf)?;
        read_utf16z(&buf, 0, len)
    }

    fn dword(&self, name: &str) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.value(name, &mut buf)?;
        read_u32(&buf, 0)
    }

    fn last_write(&self) -> Option<u64> {
        let mut written = FILETIME::default();
        let status = unsafe {
            RegQueryInfoKeyW(
                self.0,
                PWSTR::null(),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some(&mut written as *mut FILETIME),
            )
        };
        (status == ERROR_SUCCESS).then(|| filetime(&written))
    }

    fn subkeys(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut name = [0u16; 256];
        for index in 0.. {
            let mut len = name.len() as u32;
            let status = unsafe {
                RegEnumKeyExW(
                    self.0,
                    index,
                    PWSTR(name.as_mut_ptr()),
                    &mut len,
                    None,
                    PWSTR::null(),
                    None,
                    None,
                )
            };
            if status != ERROR_SUCCESS {
                break;
            }
            names.push(String::from_utf16_lossy(&name[..len as usize]));
        }
        names
    }
}

impl Drop for RegistryKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

/// A SID allocated by the security API.
struct LocalSid(PSID);

impl Drop for LocalSid {
    fn drop(&mut self) {
        unsafe {
            let _ = LocalFree(HLOCAL(self.0 .0));
        }
    }
}

fn lookup_account(sid: &str) -> Option<Account> {
    let sid_w = wide(sid);
    let mut raw = PSID::default();
    unsafe { ConvertStringSidToSidW(PCWSTR(sid_w.as_ptr()), &mut raw) }.ok()?;
    let sid = LocalSid(raw);

    let mut user = [0u16; 256];
    let mut domain = [0u16; 256];
    let mut user_len = user.len() as u32;
    let mut domain_len = domain.len() as u32;
    let mut sid_use = SID_NAME_USE::default();
    unsafe {
        LookupAccountSidW(
            PCWSTR::null(),
            sid.0,
            PWSTR(user.as_mut_ptr()),
            &mut user_len,
            PWSTR(domain.as_mut_ptr()),
            &mut domain_len,
            &mut sid_use,
        )
    }
    .ok()?;

    Some(Account {
        user: String::from_utf16_lossy(&user[..user_len as usize]),
        domain: String::from_utf16_lossy(&domain[..domain_len as usize]),
    })
}

/// A buffer handed back by the network management API.
struct NetApiBuffer(*mut u8);

impl Drop for NetApiBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let _ = NetApiBufferFree(Some(self.0 as *const c_void));
            }
        }
    }
}

#[repr(C)]
struct SessionInfo10 {
    client_name: PWSTR,
    user_name: PWSTR,
    active_secs: u32,
    idle_secs: u32,
}

/// Suppresses "insert a disk" dialogs for empty removable drives.
struct ErrorModeGuard(u32);

impl ErrorModeGuard {
    fn fail_critical_errors() -> Self {
        ErrorModeGuard(unsafe { SetErrorMode(SEM_FAILCRITICALERRORS) })
    }
}

impl Drop for ErrorModeGuard {
    fn drop(&mut self) {
        unsafe {
            SetErrorMode(THREAD_ERROR_MODE(self.0));
        }
    }
}

/// Terminal services memory handed back by the session APIs.
struct WtsMemory<T> {
    ptr: *mut T,
    free: WtsFreeMemoryFn,
}

impl<T> Drop for WtsMemory<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.free)(self.ptr.cast()) }
        }
    }
}

// ============================================================================
// Table buffers
// ============================================================================

/// 8-byte aligned storage for a table an IP helper call fills in.
struct TableBuf {
    words: Vec<u64>,
}

impl TableBuf {
    /// Call `fill` with growing buffers until the table fits.
    fn fill(mut fill: impl FnMut(*mut c_void, &mut u32) -> u32) -> SysResult<Self> {
        let mut size = 0u32;
        let mut buf = TableBuf { words: Vec::new() };

        loop {
            let ptr = if buf.words.is_empty() {
                std::ptr::null_mut()
            } else {
                buf.words.as_mut_ptr().cast()
            };
            match fill(ptr, &mut size) {
                0 | ERROR_NO_DATA => return Ok(buf),
                ERROR_INSUFFICIENT_BUFFER | ERROR_BUFFER_OVERFLOW => {
                    buf.words = vec![0; (size as usize).div_ceil(8).max(1)];
                }
                code => return Err(code),
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.words.len() * 8) }
    }

    fn as_ptr<T>(&self) -> *const T {
        self.words.as_ptr().cast()
    }
}

/// Decode a `dwNumEntries` prefixed table of fixed-size rows.
fn table_rows<T>(
    data: &[u8],
    row_len: usize,
    parse: impl Fn(&[u8]) -> Option<T>,
) -> SysResult<Vec<T>> {
    let count = match read_u32(data, 0) {
        Some(count) => count as usize,
        None => return Ok(Vec::new()),
    };

    (0..count)
        .map(|i| {
            let start = 4 + i * row_len;
            data.get(start..start + row_len)
                .and_then(&parse)
                .ok_or(ERROR_INVALID_DATA)
        })
        .collect()
}

const IF_ROW_LEN: usize = 860;

fn parse_if_row(row: &[u8]) -> Option<IfRow> {
    let phys_len = (read_u32(row, 528)? as usize).min(8);
    let descr_len = (read_u32(row, 600)? as usize).min(256);
    let descr = row.get(604..604 + descr_len)?;
    let descr_end = descr.iter().position(|&b| b == 0).unwrap_or(descr.len());

    Some(IfRow {
        index: read_u32(row, 512)?,
        if_type: read_u32(row, 516)?,
        mtu: read_u32(row, 520)?,
        speed: u64::from(read_u32(row, 524)?),
        phys_addr: row.get(532..532 + phys_len)?.to_vec(),
        oper_status: read_u32(row, 544)?,
        in_octets: u64::from(read_u32(row, 552)?),
        in_ucast_pkts: u64::from(read_u32(row, 556)?),
        in_nucast_pkts: u64::from(read_u32(row, 560)?),
        in_discards: u64::from(read_u32(row, 564)?),
        in_errors: u64::from(read_u32(row, 568)?),
        out_octets: u64::from(read_u32(row, 576)?),
        out_ucast_pkts: u64::from(read_u32(row, 580)?),
        out_nucast_pkts: u64::from(read_u32(row, 584)?),
        out_discards: u64::from(read_u32(row, 588)?),
        out_errors: u64::from(read_u32(row, 592)?),
        description: String::from_utf8_lossy(&descr[..descr_end]).into_owned(),
    })
}

fn parse_ip_addr_row(row: &[u8]) -> Option<IpAddrRow> {
    Some(IpAddrRow {
        addr: read_ipv4(row, 0)?,
        index: read_u32(row, 4)?,
        mask: read_ipv4(row, 8)?,
        bcast_addr: read_u32(row, 12)?,
        addr_type: read_u16(row, 22)?,
    })
}

fn parse_route_row(row: &[u8]) -> Option<RouteRow> {
    Some(RouteRow {
        destination: read_ipv4(row, 0)?,
        mask: read_ipv4(row, 4)?,
        next_hop: read_ipv4(row, 12)?,
        if_index: read_u32(row, 16)?,
        metric: read_u32(row, 36)?,
    })
}

fn parse_tcp_row(row: &[u8]) -> Option<TcpRow> {
    Some(TcpRow {
        state: read_u32(row, 0)?,
        local_addr: read_ipv4(row, 4)?,
        local_port: read_port(row, 8)?,
        remote_addr: read_ipv4(row, 12)?,
        remote_port: read_port(row, 16)?,
        owner_pid: read_u32(row, 20),
    })
}

fn parse_udp_row(row: &[u8]) -> Option<UdpRow> {
    Some(UdpRow {
        local_addr: read_ipv4(row, 0)?,
        local_port: read_port(row, 4)?,
        owner_pid: read_u32(row, 8),
    })
}

/// Every address of an `IP_ADDR_STRING` list.
///
/// # Safety
///
/// `first` must head a list the system built.
unsafe fn addr_strings(first: &IP_ADDR_STRING) -> Vec<String> {
    let mut list = Vec::new();
    let mut node: *const IP_ADDR_STRING = first;
    while let Some(entry) = node.as_ref() {
        let raw = &entry.IpAddress.String;
        let addr = ansi(raw.as_ptr().cast(), raw.len());
        if !addr.is_empty() {
            list.push(addr);
        }
        node = entry.Next;
    }
    list
}

// ============================================================================
// Terminal services
// ============================================================================

#[repr(C)]
struct WtsSessionInfo {
    session_id: u32,
    win_station_name: PWSTR,
    state: i32,
}

const WTS_ACTIVE: i32 = 0;
const WTS_USER_NAME: i32 = 5;
const WTS_CLIENT_ADDRESS: i32 = 14;
const WTS_CLIENT_PROTOCOL_TYPE: i32 = 16;
const WTS_SESSION_INFO: i32 = 24;
/// Offset of `ConnectTime` in `WTSINFOW`.
const WTSINFO_CONNECT_TIME: usize = 176;
const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;

/// IPv4 address of a `WTS_CLIENT_ADDRESS`.
fn client_ipv4(info: &[u8]) -> Option<Ipv4Addr> {
    if read_u32(info, 0)? != u32::from(AF_INET.0) {
        return None;
    }
    read_ipv4(info, 6)
}

// ============================================================================
// Platform
// ============================================================================

/// The running system.
#[derive(Debug, Default)]
pub struct WindowsPlatform {
    perf_key_open: bool,
}

impl WindowsPlatform {
    pub fn new() -> SysResult<Self> {
        Ok(Self::default())
    }

    fn processor_count() -> usize {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        info.dwNumberOfProcessors as usize
    }

    fn query_session(
        query: WtsQuerySessionInformationFn,
        free: WtsFreeMemoryFn,
        session_id: u32,
        class: i32,
    ) -> Option<Vec<u8>> {
        let mut buffer = PWSTR::null();
        let mut returned = 0u32;
        let ok = unsafe { query(HANDLE::default(), session_id, class, &mut buffer, &mut returned) };
        let memory = WtsMemory {
            ptr: buffer.0.cast::<u8>(),
            free,
        };
        if !ok.as_bool() || memory.ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(memory.ptr, returned as usize) }.to_vec())
    }
}

impl Drop for WindowsPlatform {
    fn drop(&mut self) {
        if self.perf_key_open {
            unsafe {
                let _ = RegCloseKey(HKEY_PERFORMANCE_DATA);
            }
        }
    }
}

impl CounterSource for WindowsPlatform {
    fn read_counters(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ReadError> {
        let name = wide(key);
        let mut len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

        let status = unsafe {
            RegQueryValueExW(
                HKEY_PERFORMANCE_DATA,
                PCWSTR(name.as_ptr()),
                None,
                None,
                Some(buf.as_mut_ptr()),
                Some(&mut len as *mut u32),
            )
        };
        self.perf_key_open = true;

        match status {
            ERROR_SUCCESS => Ok(len as usize),
            ERROR_MORE_DATA => Err(ReadError::MoreData),
            other => Err(ReadError::Os(other.0)),
        }
    }
}

impl ModuleLoader for WindowsPlatform {
    fn load_module(&mut self, name: &str) -> SysResult<ModuleHandle> {
        let name = wide(name);
        unsafe { LoadLibraryW(PCWSTR(name.as_ptr())) }
            .map(|module| ModuleHandle(module.0 as usize))
            .map_err(|e| win32_code(&e))
    }

    fn resolve_symbol(&mut self, module: ModuleHandle, name: &str) -> SysResult<Symbol> {
        let name = CString::new(name).map_err(|_| crate::error::ERROR_INVALID_PARAMETER)?;
        let proc = unsafe {
            GetProcAddress(
                HMODULE(module.0 as *mut c_void),
                PCSTR(name.as_ptr().cast()),
            )
        };
        proc.and_then(|f| Symbol::new(f as usize))
            .ok_or(crate::error::ERROR_PROC_NOT_FOUND)
    }

    fn free_module(&mut self, module: ModuleHandle) {
        unsafe {
            let _ = FreeLibrary(HMODULE(module.0 as *mut c_void));
        }
    }
}

impl SystemApi for WindowsPlatform {
    fn processor_performance(&mut self, query: Symbol) -> SysResult<Vec<ProcessorTimes>> {
        #[repr(C)]
        #[derive(Clone, Copy, Default)]
        struct Record {
            idle: i64,
            kernel: i64,
            user: i64,
            reserved: [i64; 2],
            interrupts: u32,
        }

        let query: NtQuerySystemInformationFn = unsafe { entry(query) };
        let mut records = vec![Record::default(); Self::processor_count().max(1)];
        let mut returned = 0u32;

        let status = unsafe {
            query(
                SYSTEM_PROCESSOR_PERFORMANCE_INFORMATION,
                records.as_mut_ptr().cast(),
                (records.len() * mem::size_of::<Record>()) as u32,
                &mut returned,
            )
        };
        if status != 0 {
            return Err(status as u32);
        }

        records.truncate(returned as usize / mem::size_of::<Record>());
        Ok(records
            .iter()
            .map(|r| ProcessorTimes {
                idle: r.idle as u64,
                kernel: r.kernel as u64,
                user: r.user as u64,
            })
            .collect())
    }

    fn cpu_topology(&mut self) -> SysResult<CpuTopology> {
        let mut len = 0u32;
        unsafe {
            let _ = GetLogicalProcessorInformation(None, &mut len);
        }

        let count = len as usize / mem::size_of::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>();
        let mut buffer = vec![SYSTEM_LOGICAL_PROCESSOR_INFORMATION::default(); count.max(1)];
        unsafe { GetLogicalProcessorInformation(Some(buffer.as_mut_ptr()), &mut len) }
            .map_err(|e| win32_code(&e))?;
        buffer.truncate(len as usize / mem::size_of::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION>());

        let mut physical = 0u32;
        let mut logical = 0u32;
        let mut smt = false;
        for info in buffer.iter().filter(|i| i.Relationship == RelationProcessorCore) {
            physical += 1;
            logical += info.ProcessorMask.count_ones();
            smt |= unsafe { info.Anonymous.ProcessorCore.Flags } == LTP_PC_SMT;
        }

        Ok(CpuTopology {
            physical_cores: physical,
            threads_per_core: if physical == 0 { 1 } else { logical / physical },
            hyperthreading: smt,
        })
    }

    fn enum_processes(&mut self, enum_processes: Symbol, buf: &mut [u8]) -> SysResult<usize> {
        let enum_processes: EnumProcessesFn = unsafe { entry(enum_processes) };
        let mut pids = vec![0u32; buf.len() / 4];
        let mut needed = 0u32;

        let ok = unsafe {
            enum_processes(pids.as_mut_ptr(), (pids.len() * 4) as u32, &mut needed)
        };
        if !ok.as_bool() {
            return Err(last_error());
        }

        let used = (needed as usize).min(pids.len() * 4);
        for (chunk, pid) in buf.chunks_exact_mut(4).zip(&pids).take(used / 4) {
            chunk.copy_from_slice(&pid.to_ne_bytes());
        }
        Ok(used)
    }

    fn memory_status(&mut self, status_ex: Option<Symbol>) -> SysResult<MemoryStatus> {
        if let Some(status_ex) = status_ex {
            let status_ex: GlobalMemoryStatusExFn = unsafe { entry(status_ex) };
            let mut status = MEMORYSTATUSEX {
                dwLength: mem::size_of::<MEMORYSTATUSEX>() as u32,
                ..Default::default()
            };
            if unsafe { status_ex(&mut status) }.as_bool() {
                return Ok(MemoryStatus {
                    total_phys: status.ullTotalPhys,
                    avail_phys: status.ullAvailPhys,
                    total_page_file: status.ullTotalPageFile,
                    avail_page_file: status.ullAvailPageFile,
                });
            }
            debug!(code = last_error(), "extended memory status failed");
        }

        let mut status = MEMORYSTATUS {
            dwLength: mem::size_of::<MEMORYSTATUS>() as u32,
            ..Default::default()
        };
        unsafe { GlobalMemoryStatus(&mut status) };
        Ok(MemoryStatus {
            total_phys: status.dwTotalPhys as u64,
            avail_phys: status.dwAvailPhys as u64,
            total_page_file: status.dwTotalPageFile as u64,
            avail_page_file: status.dwAvailPageFile as u64,
        })
    }

    fn number_of_interfaces(&mut self, get_count: Symbol) -> SysResult<u32> {
        let get_count: GetNumberOfInterfacesFn = unsafe { entry(get_count) };
        let mut count = 0u32;
        match unsafe { get_count(&mut count) } {
            0 => Ok(count),
            code => Err(code),
        }
    }

    fn if_table(&mut self, get_table: Symbol) -> SysResult<Vec<IfRow>> {
        let get_table: GetTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_table(ptr, size, false.into()) })?;
        table_rows(buf.bytes(), IF_ROW_LEN, parse_if_row)
    }

    fn if_entry(&mut self, get_entry: Symbol, row: &mut IfRow) -> SysResult<()> {
        let get_entry: GetIfEntryFn = unsafe { entry(get_entry) };
        let mut raw = vec![0u64; IF_ROW_LEN.div_ceil(8)];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(raw.as_mut_ptr().cast::<u8>(), raw.len() * 8)
        };
        bytes[512..516].copy_from_slice(&row.index.to_le_bytes());

        match unsafe { get_entry(bytes.as_mut_ptr().cast()) } {
            0 => {
                *row = parse_if_row(&bytes[..IF_ROW_LEN]).ok_or(ERROR_INVALID_DATA)?;
                Ok(())
            }
            code => Err(code),
        }
    }

    fn ip_addr_table(&mut self, get_table: Symbol) -> SysResult<Vec<IpAddrRow>> {
        let get_table: GetTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_table(ptr, size, false.into()) })?;
        table_rows(buf.bytes(), 24, parse_ip_addr_row)
    }

    fn adapters_info(&mut self, get_info: Symbol) -> SysResult<Vec<AdapterRow>> {
        let get_info: GetInfoFn = unsafe { entry(get_info) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_info(ptr, size) })?;
        if buf.bytes().len() < mem::size_of::<IP_ADAPTER_INFO>() {
            return Ok(Vec::new());
        }

        let mut adapters = Vec::new();
        let mut node = buf.as_ptr::<IP_ADAPTER_INFO>();
        while let Some(info) = unsafe { node.as_ref() } {
            let name = &info.AdapterName;
            let description = &info.Description;
            let hw_len = (info.AddressLength as usize).min(info.Address.len());
            let (addresses, gateways) =
                unsafe { (addr_strings(&info.IpAddressList), addr_strings(&info.GatewayList)) };

            adapters.push(AdapterRow {
                index: info.Index,
                name: unsafe { ansi(name.as_ptr().cast(), name.len()) },
                description: unsafe { ansi(description.as_ptr().cast(), description.len()) },
                hw_addr: info.Address[..hw_len].to_vec(),
                ip_address: addresses.first().and_then(|a| a.parse().ok()),
                gateway: gateways.first().and_then(|a| a.parse().ok()),
                dhcp_enabled: info.DhcpEnabled != 0,
            });
            node = info.Next;
        }
        Ok(adapters)
    }

    fn network_params(&mut self, get_params: Symbol) -> SysResult<NetworkParams> {
        let get_params: GetInfoFn = unsafe { entry(get_params) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_params(ptr, size) })?;
        if buf.bytes().len() < mem::size_of::<FIXED_INFO_W2KSP1>() {
            return Err(ERROR_INVALID_DATA);
        }

        let info = unsafe { &*buf.as_ptr::<FIXED_INFO_W2KSP1>() };
        Ok(NetworkParams {
            host_name: unsafe { ansi(info.HostName.as_ptr().cast(), info.HostName.len()) },
            domain_name: unsafe { ansi(info.DomainName.as_ptr().cast(), info.DomainName.len()) },
            dns_servers: unsafe { addr_strings(&info.DnsServerList) },
        })
    }

    fn ip_forward_table(&mut self, get_table: Symbol) -> SysResult<Vec<RouteRow>> {
        let get_table: GetTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_table(ptr, size, false.into()) })?;
        table_rows(buf.bytes(), 56, parse_route_row)
    }

    fn tcp_table(&mut self, get_table: Symbol) -> SysResult<Vec<TcpRow>> {
        let get_table: GetTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_table(ptr, size, false.into()) })?;
        table_rows(buf.bytes(), 20, parse_tcp_row)
    }

    fn udp_table(&mut self, get_table: Symbol) -> SysResult<Vec<UdpRow>> {
        let get_table: GetTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe { get_table(ptr, size, false.into()) })?;
        table_rows(buf.bytes(), 8, parse_udp_row)
    }

    fn tcp_owner_table(&mut self, get_table: Symbol) -> SysResult<Vec<TcpRow>> {
        let get_table: GetExtendedTcpTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe {
            get_table(ptr, size, false.into(), AF_INET.0 as u32, TCP_TABLE_OWNER_PID_ALL, 0)
        })?;
        table_rows(buf.bytes(), 24, parse_tcp_row)
    }

    fn udp_owner_table(&mut self, get_table: Symbol) -> SysResult<Vec<UdpRow>> {
        let get_table: GetExtendedUdpTableFn = unsafe { entry(get_table) };
        let buf = TableBuf::fill(|ptr, size| unsafe {
            get_table(ptr, size, false.into(), AF_INET.0 as u32, UDP_TABLE_OWNER_PID, 0)
        })?;
        table_rows(buf.bytes(), 12, parse_udp_row)
    }

    fn disk_free_space(&mut self, path: &str) -> SysResult<DiskSpace> {
        let path = wide(path);
        let mut space = DiskSpace::default();

        unsafe {
            GetDiskFreeSpaceExW(
                PCWSTR(path.as_ptr()),
                Some(&mut space.avail as *mut u64),
                Some(&mut space.total as *mut u64),
                Some(&mut space.free as *mut u64),
            )
        }
        .map_err(|e| win32_code(&e))?;
        Ok(space)
    }

    fn logical_drives(&mut self) -> SysResult<Vec<DriveRow>> {
        let mut buffer = [0u16; 512];
        let len = unsafe { GetLogicalDriveStringsW(Some(&mut buffer)) } as usize;
        if len == 0 || len > buffer.len() {
            return Err(last_error());
        }

        let _mode = ErrorModeGuard::fail_critical_errors();
        let mut drives = Vec::new();

        for root in split_multi_sz(&buffer[..len]) {
            let root_w = wide(&root);
            let drive_type = unsafe { GetDriveTypeW(PCWSTR(root_w.as_ptr())) };

            let mut serial = 0u32;
            let mut fs_name = [0u16; 64];
            let fs_name = match unsafe {
                GetVolumeInformationW(
                    PCWSTR(root_w.as_ptr()),
                    None,
                    Some(&mut serial as *mut u32),
                    None,
                    None,
                    Some(&mut fs_name),
                )
            } {
                Ok(()) => {
                    let end = fs_name.iter().position(|&u| u == 0).unwrap_or(fs_name.len());
                    String::from_utf16_lossy(&fs_name[..end])
                }
                // empty removable drives land here
                Err(_) => String::new(),
            };

            drives.push(DriveRow {
                root,
                drive_type,
                serial,
                fs_name,
            });
        }
        Ok(drives)
    }

    fn environment_block(&mut self, pid: u32) -> SysResult<Vec<u16>> {
        if pid == unsafe { GetCurrentProcessId() } {
            let block = EnvironmentStrings::current()?;
            return Ok(block.units().to_vec());
        }
        RemoteProcess::open(pid)?.environment()
    }

    fn process_times(&mut self, pid: u32) -> SysResult<ProcessTimes> {
        let process = ProcessHandle::open(pid)?;
        let mut start = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe { GetProcessTimes(process.0, &mut start, &mut exit, &mut kernel, &mut user) }
            .map_err(|e| win32_code(&e))?;

        Ok(ProcessTimes {
            start: filetime(&start),
            kernel: filetime(&kernel),
            user: filetime(&user),
        })
    }

    fn process_parameters(&mut self, pid: u32) -> SysResult<ProcessParameters> {
        let process = RemoteProcess::open(pid)?;
        let params = process.parameters()?;
        Ok(ProcessParameters {
            command_line: process.read_unicode_string(params + peb::COMMAND_LINE)?,
            image_path: process.read_unicode_string(params + peb::IMAGE_PATH_NAME)?,
            cwd: process.read_unicode_string(params + peb::CURRENT_DIRECTORY)?,
        })
    }

    fn current_thread_times(&mut self) -> SysResult<ThreadTimes> {
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe {
            GetThreadTimes(GetCurrentThread(), &mut creation, &mut exit, &mut kernel, &mut user)
        }
        .map_err(|e| win32_code(&e))?;

        Ok(ThreadTimes {
            kernel: filetime(&kernel),
            user: filetime(&user),
        })
    }

    fn processor_description(&mut self) -> SysResult<ProcessorDescription> {
        let key = RegistryKey::open(
            HKEY_LOCAL_MACHINE,
            "HARDWARE\\DESCRIPTION\\System\\CentralProcessor\\0",
        )?;
        Ok(ProcessorDescription {
            vendor_id: key.string("VendorIdentifier").unwrap_or_default(),
            name: key.string("ProcessorNameString").unwrap_or_default(),
            mhz: key.dword("~MHz").unwrap_or(0),
        })
    }

    fn process_modules(
        &mut self,
        enum_modules: Symbol,
        module_file_name: Symbol,
        pid: u32,
    ) -> SysResult<Vec<String>> {
        let enum_modules: EnumProcessModulesFn = unsafe { entry(enum_modules) };
        let file_name: GetModuleFileNameExWFn = unsafe { entry(module_file_name) };
        let process = ProcessHandle::open(pid)?;

        let mut modules = vec![HMODULE::default(); 256];
        loop {
            let cb = (modules.len() * mem::size_of::<HMODULE>()) as u32;
            let mut needed = 0u32;
            let ok = unsafe { enum_modules(process.0, modules.as_mut_ptr(), cb, &mut needed) };
            if !ok.as_bool() {
                return Err(last_error());
            }
            let count = needed as usize / mem::size_of::<HMODULE>();
            if count <= modules.len() {
                modules.truncate(count);
                break;
            }
            modules = vec![HMODULE::default(); count];
        }

        let mut names = Vec::with_capacity(modules.len());
        let mut name = [0u16; 1024];
        for module in modules {
            let len = unsafe { file_name(process.0, module, name.as_mut_ptr(), name.len() as u32) };
            if len == 0 {
                return Err(last_error());
            }
            names.push(String::from_utf16_lossy(&name[..len as usize]));
        }
        Ok(names)
    }

    fn net_sessions(&mut self) -> SysResult<Vec<NetSessionRow>> {
        let mut rows = Vec::new();
        let mut resume = 0u32;

        loop {
            let mut buffer: *mut u8 = std::ptr::null_mut();
            let mut read = 0u32;
            let mut total = 0u32;
            let status = unsafe {
                NetSessionEnum(
                    PCWSTR::null(),
                    PCWSTR::null(),
                    PCWSTR::null(),
                    10,
                    &mut buffer,
                    MAX_PREFERRED_LENGTH,
                    &mut read,
                    &mut total,
                    Some(&mut resume as *mut u32),
                )
            };
            let buffer = NetApiBuffer(buffer);
            if status != NERR_SUCCESS && status != ERROR_MORE_DATA.0 {
                if rows.is_empty() {
                    return Err(status);
                }
                break;
            }

            if !buffer.0.is_null() {
                let infos = unsafe {
                    std::slice::from_raw_parts(buffer.0 as *const SessionInfo10, read as usize)
                };
                rows.extend(infos.iter().map(|info| NetSessionRow {
                    user: unsafe { info.user_name.to_string() }.unwrap_or_default(),
                    client: unsafe { info.client_name.to_string() }.unwrap_or_default(),
                    active_secs: u64::from(info.active_secs),
                }));
            }
            if status != ERROR_MORE_DATA.0 {
                break;
            }
        }
        Ok(rows)
    }

    fn user_hives(&mut self) -> SysResult<Vec<UserHive>> {
        let users = RegistryKey::open(HKEY_USERS, "")?;

        Ok(users
            .subkeys()
            .into_iter()
            .map(|name| {
                let account = lookup_account(&name);
                let volatile = account
                    .as_ref()
                    .and_then(|_| {
                        RegistryKey::open(users.0, &format!("{}\\Volatile Environment", name))
                            .ok()
                    })
                    .map(|key| VolatileEnvironment {
                        written: key
                            .last_write()
                            .and_then(filetime_to_unix_secs)
                            .unwrap_or(0),
                        client_name: key.string("CLIENTNAME"),
                        session_name: key.string("SESSIONNAME"),
                    });
                UserHive {
                    name,
                    account,
                    volatile,
                }
            })
            .collect())
    }

    fn terminal_sessions(
        &mut self,
        api: &TerminalServicesApi,
    ) -> SysResult<Vec<TerminalSession>> {
        let enumerate: WtsEnumerateSessionsFn = unsafe { entry(api.enumerate_sessions) };
        let query: WtsQuerySessionInformationFn = unsafe { entry(api.query_session) };
        let free: WtsFreeMemoryFn = unsafe { entry(api.free_memory) };

        let mut sessions: *mut WtsSessionInfo = std::ptr::null_mut();
        let mut count = 0u32;
        if !unsafe { enumerate(HANDLE::default(), 0, 1, &mut sessions, &mut count) }.as_bool() {
            return Err(last_error());
        }
        let sessions = WtsMemory {
            ptr: sessions,
            free,
        };
        if sessions.ptr.is_null() {
            return Ok(Vec::new());
        }

        let list = unsafe { std::slice::from_raw_parts(sessions.ptr, count as usize) };
        Ok(list
            .iter()
            .filter(|s| s.state == WTS_ACTIVE)
            .map(|s| {
                let info = |class| Self::query_session(query, free, s.session_id, class);
                TerminalSession {
                    station: unsafe { s.win_station_name.to_string() }.unwrap_or_default(),
                    protocol: info(WTS_CLIENT_PROTOCOL_TYPE).and_then(|b| read_u16(&b, 0)),
                    client_address: info(WTS_CLIENT_ADDRESS).and_then(|b| client_ipv4(&b)),
                    user: info(WTS_USER_NAME).and_then(|b| read_utf16z(&b, 0, b.len())),
                    connect_time: info(WTS_SESSION_INFO)
                        .and_then(|b| read_u64(&b, WTSINFO_CONNECT_TIME))
                        .and_then(filetime_to_unix_secs)
                        .unwrap_or(0),
                }
            })
            .collect())
    }

    fn os_version(&mut self) -> SysResult<OsVersion> {
        let rtl_get_version: RtlGetVersionFn =
            unsafe { entry(ntdll_entry(::windows::core::s!("RtlGetVersion"))?) };

        let mut info = OSVERSIONINFOW {
            dwOSVersionInfoSize: mem::size_of::<OSVERSIONINFOW>() as u32,
            ..Default::default()
        };
        let status = unsafe { rtl_get_version(&mut info) };
        if status != 0 {
            return Err(status as u32);
        }

        let sp_end = info
            .szCSDVersion
            .iter()
            .position(|&u| u == 0)
            .unwrap_or(info.szCSDVersion.len());

        let mut system = SYSTEM_INFO::default();
        unsafe { GetNativeSystemInfo(&mut system) };
        let arch = match unsafe { system.Anonymous.Anonymous.wProcessorArchitecture.0 } {
            0 => "x86",
            5 => "arm",
            9 => "x86_64",
            12 => "aarch64",
            _ => "unknown",
        };

        Ok(OsVersion {
            major: info.dwMajorVersion,
            minor: info.dwMinorVersion,
            build: info.dwBuildNumber,
            service_pack: String::from_utf16_lossy(&info.szCSDVersion[..sp_end]),
            arch: arch.to_string(),
        })
    }

    fn uptime(&mut self) -> SysResult<Duration> {
        Ok(Duration::from_millis(unsafe { GetTickCount64() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_row_layout() {
        let mut row = vec![0u8; 24];
        row[0..4].copy_from_slice(&2u32.to_le_bytes());
        row[4..8].copy_from_slice(&[127, 0, 0, 1]);
        row[8..10].copy_from_slice(&8080u16.to_be_bytes());
        row[20..24].copy_from_slice(&1234u32.to_le_bytes());

        let parsed = parse_tcp_row(&row).unwrap();
        assert_eq!(parsed.state, TCP_STATE_LISTEN);
        assert_eq!(parsed.local_addr, Ipv4Addr::LOCALHOST);
        assert_eq!(parsed.local_port, 8080);
        assert_eq!(parsed.owner_pid, Some(1234));
        assert_eq!(parse_tcp_row(&row[..20]).unwrap().owner_pid, None);
    }

    #[test]
    fn test_table_rows_checks_declared_count() {
        let mut table = 2u32.to_le_bytes().to_vec();
        table.extend_from_slice(&[0u8; 8]);
        assert_eq!(table_rows(&table, 8, parse_udp_row).unwrap_err(), ERROR_INVALID_DATA);
    }

    #[test]
    fn test_client_address_layout() {
        let mut info = vec![0u8; 24];
        info[0..4].copy_from_slice(&u32::from(AF_INET.0).to_le_bytes());
        info[6..10].copy_from_slice(&[10, 1, 2, 3]);
        assert_eq!(client_ipv4(&info), Some(Ipv4Addr::new(10, 1, 2, 3)));

        info[0..4].copy_from_slice(&23u32.to_le_bytes());
        assert_eq!(client_ipv4(&info), None);
    }

    #[test]
    fn test_filetime_to_unix_secs() {
        assert_eq!(filetime_to_unix_secs(EPOCH_DIFFERENCE + 30_000_000), Some(3));
        assert_eq!(filetime_to_unix_secs(1), None);
    }

    #[test]
    fn test_live_process_parameters() {
        let mut platform = WindowsPlatform::new().unwrap();
        let pid = std::process::id();

        let params = platform.process_parameters(pid).unwrap();
        assert!(params.image_path.to_ascii_lowercase().ends_with(".exe"));
        assert!(!params.cwd.is_empty());
        assert!(platform.process_times(pid).unwrap().start > EPOCH_DIFFERENCE);
    }

    #[test]
    fn test_live_uptime_and_version() {
        let mut platform = WindowsPlatform::new().unwrap();
        assert!(platform.uptime().unwrap() > Duration::ZERO);
        assert!(platform.os_version().unwrap().major >= 6);
    }
}
