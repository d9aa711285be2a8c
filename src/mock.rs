//! In-memory system boundary for tests.
//!
//! [`BlockBuilder`] writes counter blocks in the exact layout the system
//! produces, and [`MockPlatform`] serves them together with canned table rows
//! while counting how often each call is made.

use crate::error::SysResult;
use crate::perf::block::{
    COUNTER_DEFINITION_LEN, DATA_BLOCK_LEN, INSTANCE_DEFINITION_LEN, OBJECT_TYPE_LEN,
    PERF_NO_INSTANCES,
};
use crate::platform::*;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const PERF_COUNTER_RAWCOUNT: u32 = 0x0001_0000;
const PERF_COUNTER_LARGE_RAWCOUNT: u32 = 0x0001_0100;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn put_u32(buf: &mut Vec<u8>, at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[derive(Debug, Clone)]
struct ObjectSpec {
    title: u32,
    counters: Vec<(u32, u32)>,
    instances: Option<Vec<(String, Vec<u64>)>>,
}

impl ObjectSpec {
    /// Offsets of each counter in a counter block, and the block length.
    fn layout(&self) -> (Vec<u32>, usize) {
        // ByteLength plus padding comes first
        let mut at = 8usize;
        let offsets = self
            .counters
            .iter()
            .map(|&(_, size)| {
                if size == 8 {
                    at = align8(at);
                }
                let offset = at as u32;
                at += size as usize;
                offset
            })
            .collect();
        (offsets, align8(at))
    }

    fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let (offsets, block_len) = self.layout();
        let definition_len = OBJECT_TYPE_LEN + COUNTER_DEFINITION_LEN * self.counters.len();

        out.resize(start + definition_len, 0);
        let num_instances = match &self.instances {
            Some(list) => list.len() as i32,
            None => PERF_NO_INSTANCES,
        };
        put_u32(out, start + 4, definition_len as u32);
        put_u32(out, start + 8, OBJECT_TYPE_LEN as u32);
        put_u32(out, start + 12, self.title);
        put_u32(out, start + 32, self.counters.len() as u32);
        put_u32(out, start + 40, num_instances as u32);

        for (i, (&(title, size), &offset)) in self.counters.iter().zip(&offsets).enumerate() {
            let at = start + OBJECT_TYPE_LEN + i * COUNTER_DEFINITION_LEN;
            let counter_type = if size == 8 {
                PERF_COUNTER_LARGE_RAWCOUNT
            } else {
                PERF_COUNTER_RAWCOUNT
            };
            put_u32(out, at, COUNTER_DEFINITION_LEN as u32);
            put_u32(out, at + 4, title);
            put_u32(out, at + 28, counter_type);
            put_u32(out, at + 32, size);
            put_u32(out, at + 36, offset);
        }

        match &self.instances {
            Some(list) => {
                for (name, values) in list {
                    let units: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
                    let name_len = units.len() * 2;
                    let def_len = align8(INSTANCE_DEFINITION_LEN + name_len);

                    let at = out.len();
                    out.resize(at + def_len, 0);
                    put_u32(out, at, def_len as u32);
                    put_u32(out, at + 12, u32::MAX);
                    put_u32(out, at + 16, INSTANCE_DEFINITION_LEN as u32);
                    put_u32(out, at + 20, name_len as u32);
                    for (j, u) in units.iter().enumerate() {
                        let p = at + INSTANCE_DEFINITION_LEN + j * 2;
                        out[p..p + 2].copy_from_slice(&u.to_le_bytes());
                    }

                    self.write_counter_block(out, &offsets, block_len, values);
                }
            }
            None => self.write_counter_block(out, &offsets, block_len, &[]),
        }

        let total = out.len() - start;
        put_u32(out, start, total as u32);
    }

    fn write_counter_block(&self, out: &mut Vec<u8>, offsets: &[u32], len: usize, values: &[u64]) {
        let at = out.len();
        out.resize(at + len, 0);
        put_u32(out, at, len as u32);

        for ((&(_, size), &offset), &value) in self.counters.iter().zip(offsets).zip(values) {
            let p = at + offset as usize;
            if size == 8 {
                out[p..p + 8].copy_from_slice(&value.to_le_bytes());
            } else {
                out[p..p + 4].copy_from_slice(&(value as u32).to_le_bytes());
            }
        }
    }
}

/// Builds a counter block.
///
/// ```ignore
/// let data = BlockBuilder::new()
///     .object(238, &[142, 144])
///     .counter64(1746)
///     .instance("0", &[1, 2, 3])
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockBuilder {
    objects: Vec<ObjectSpec>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an object type with 4-byte counters for `counters` title indexes.
    pub fn object(mut self, title: u32, counters: &[u32]) -> Self {
        self.objects.push(ObjectSpec {
            title,
            counters: counters.iter().map(|&c| (c, 4)).collect(),
            instances: Some(Vec::new()),
        });
        self
    }

    /// Start an object type that reports no instances.
    pub fn no_instances_object(mut self, title: u32) -> Self {
        self.objects.push(ObjectSpec {
            title,
            counters: Vec::new(),
            instances: None,
        });
        self
    }

    /// Add an 8-byte counter to the current object.
    pub fn counter64(mut self, title: u32) -> Self {
        if let Some(object) = self.objects.last_mut() {
            object.counters.push((title, 8));
        }
        self
    }

    /// Add an instance to the current object, with one value per counter in
    /// declaration order. Missing values are zero.
    pub fn instance(mut self, name: &str, values: &[u64]) -> Self {
        if let Some(list) = self.objects.last_mut().and_then(|o| o.instances.as_mut()) {
            list.push((name.to_string(), values.to_vec()));
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; DATA_BLOCK_LEN];
        for (i, u) in "PERF".encode_utf16().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
        }
        put_u32(&mut out, 8, 1);
        put_u32(&mut out, 12, 1);
        put_u32(&mut out, 16, 1);
        put_u32(&mut out, 24, DATA_BLOCK_LEN as u32);
        put_u32(&mut out, 28, self.objects.len() as u32);

        for object in &self.objects {
            object.write(&mut out);
        }

        let total = out.len() as u32;
        put_u32(&mut out, 20, total);
        out
    }
}

/// How many times each boundary call was made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub counter_reads: usize,
    pub module_loads: usize,
    pub module_frees: usize,
    pub processor_performance: usize,
    pub enum_processes: usize,
    pub number_of_interfaces: usize,
    pub if_table: usize,
    pub if_entry: usize,
    pub ip_addr_table: usize,
    pub adapters_info: usize,
}

/// A scripted host.
#[derive(Debug, Default)]
pub struct MockPlatform {
    pub calls: CallCounts,

    /// Counter blocks by key.
    pub counters: HashMap<String, Vec<u8>>,
    /// Keys whose read fails with this code.
    pub counter_errors: HashMap<String, u32>,
    /// Modules whose load fails.
    pub missing_modules: HashSet<String>,
    /// Entry points that fail to resolve in every module.
    pub missing_symbols: HashSet<String>,
    /// Boundary calls that fail with this code, by method name.
    pub call_errors: HashMap<&'static str, u32>,

    pub processor_times: Vec<ProcessorTimes>,
    pub topology: CpuTopology,
    pub pids: Vec<u32>,
    pub memory: MemoryStatus,
    pub interfaces: Vec<IfRow>,
    pub addresses: Vec<IpAddrRow>,
    pub adapters: Vec<AdapterRow>,
    pub network_params: NetworkParams,
    pub routes: Vec<RouteRow>,
    pub tcp: Vec<TcpRow>,
    pub udp: Vec<UdpRow>,
    pub disk_space: HashMap<String, DiskSpace>,
    pub drives: Vec<DriveRow>,
    pub environments: HashMap<u32, Vec<u16>>,
    pub modules: HashMap<u32, Vec<String>>,
    pub process_times: HashMap<u32, ProcessTimes>,
    pub process_parameters: HashMap<u32, ProcessParameters>,
    pub thread_times: ThreadTimes,
    pub processor: ProcessorDescription,
    pub net_sessions: Vec<NetSessionRow>,
    pub user_hives: Vec<UserHive>,
    pub terminal_sessions: Vec<TerminalSession>,
    pub os_version: OsVersion,
    pub uptime: Duration,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counters(mut self, key: &str, block: Vec<u8>) -> Self {
        self.counters.insert(key.to_string(), block);
        self
    }

    pub fn without_module(mut self, name: &str) -> Self {
        self.missing_modules.insert(name.to_string());
        self
    }

    pub fn without_symbol(mut self, name: &str) -> Self {
        self.missing_symbols.insert(name.to_string());
        self
    }

    pub fn with_call_error(mut self, call: &'static str, code: u32) -> Self {
        self.call_errors.insert(call, code);
        self
    }

    fn scripted(&self, call: &'static str) -> SysResult<()> {
        match self.call_errors.get(call) {
            Some(&code) => Err(code),
            None => Ok(()),
        }
    }
}

/// `ERROR_MOD_NOT_FOUND`
const MOD_NOT_FOUND: u32 = 126;
const FILE_NOT_FOUND: u32 = 2;

impl CounterSource for MockPlatform {
    fn read_counters(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.calls.counter_reads += 1;
        if let Some(&code) = self.counter_errors.get(key) {
            return Err(ReadError::Os(code));
        }
        let data = self.counters.get(key).ok_or(ReadError::Os(FILE_NOT_FOUND))?;
        if buf.len() < data.len() {
            return Err(ReadError::MoreData);
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

impl ModuleLoader for MockPlatform {
    fn load_module(&mut self, name: &str) -> SysResult<ModuleHandle> {
        self.calls.module_loads += 1;
        if self.missing_modules.contains(name) {
            return Err(MOD_NOT_FOUND);
        }
        Ok(ModuleHandle(self.calls.module_loads))
    }

    fn resolve_symbol(&mut self, module: ModuleHandle, name: &str) -> SysResult<Symbol> {
        if self.missing_symbols.contains(name) {
            return Err(crate::error::ERROR_PROC_NOT_FOUND);
        }
        Symbol::new(module.0 << 16 | name.len()).ok_or(crate::error::ERROR_PROC_NOT_FOUND)
    }

    fn free_module(&mut self, _module: ModuleHandle) {
        self.calls.module_frees += 1;
    }
}

impl SystemApi for MockPlatform {
    fn processor_performance(&mut self, _query: Symbol) -> SysResult<Vec<ProcessorTimes>> {
        self.calls.processor_performance += 1;
        Ok(self.processor_times.clone())
    }

    fn cpu_topology(&mut self) -> SysResult<CpuTopology> {
        Ok(self.topology)
    }

    fn enum_processes(&mut self, _enum_processes: Symbol, buf: &mut [u8]) -> SysResult<usize> {
        self.calls.enum_processes += 1;
        // fills as much as fits, like the real call
        let mut used = 0;
        for (chunk, pid) in buf.chunks_exact_mut(4).zip(&self.pids) {
            chunk.copy_from_slice(&pid.to_ne_bytes());
            used += 4;
        }
        Ok(used)
    }

    fn memory_status(&mut self, _status_ex: Option<Symbol>) -> SysResult<MemoryStatus> {
        Ok(self.memory)
    }

    fn number_of_interfaces(&mut self, _get_count: Symbol) -> SysResult<u32> {
        self.calls.number_of_interfaces += 1;
        Ok(self.interfaces.len() as u32)
    }

    fn if_table(&mut self, _get_table: Symbol) -> SysResult<Vec<IfRow>> {
        self.calls.if_table += 1;
        Ok(self.interfaces.clone())
    }

    fn if_entry(&mut self, _get_entry: Symbol, row: &mut IfRow) -> SysResult<()> {
        self.calls.if_entry += 1;
        let fresh = self
            .interfaces
            .iter()
            .find(|r| r.index == row.index)
            .ok_or(FILE_NOT_FOUND)?;
        *row = fresh.clone();
        Ok(())
    }

    fn ip_addr_table(&mut self, _get_table: Symbol) -> SysResult<Vec<IpAddrRow>> {
        self.calls.ip_addr_table += 1;
        Ok(self.addresses.clone())
    }

    fn adapters_info(&mut self, _get_info: Symbol) -> SysResult<Vec<AdapterRow>> {
        self.calls.adapters_info += 1;
        Ok(self.adapters.clone())
    }

    fn network_params(&mut self, _get_params: Symbol) -> SysResult<NetworkParams> {
        Ok(self.network_params.clone())
    }

    fn ip_forward_table(&mut self, _get_table: Symbol) -> SysResult<Vec<RouteRow>> {
        Ok(self.routes.clone())
    }

    fn tcp_table(&mut self, _get_table: Symbol) -> SysResult<Vec<TcpRow>> {
        Ok(self
            .tcp
            .iter()
            .map(|row| TcpRow {
                owner_pid: None,
                ..*row
            })
            .collect())
    }

    fn udp_table(&mut self, _get_table: Symbol) -> SysResult<Vec<UdpRow>> {
        Ok(self
            .udp
            .iter()
            .map(|row| UdpRow {
                owner_pid: None,
                ..*row
            })
            .collect())
    }

    fn tcp_owner_table(&mut self, _get_table: Symbol) -> SysResult<Vec<TcpRow>> {
        Ok(self.tcp.clone())
    }

    fn udp_owner_table(&mut self, _get_table: Symbol) -> SysResult<Vec<UdpRow>> {
        Ok(self.udp.clone())
    }

    fn disk_free_space(&mut self, path: &str) -> SysResult<DiskSpace> {
        self.disk_space.get(path).copied().ok_or(FILE_NOT_FOUND)
    }

    fn logical_drives(&mut self) -> SysResult<Vec<DriveRow>> {
        Ok(self.drives.clone())
    }

    fn environment_block(&mut self, pid: u32) -> SysResult<Vec<u16>> {
        self.environments
            .get(&pid)
            .cloned()
            .ok_or(crate::error::ERROR_CALL_NOT_IMPLEMENTED)
    }

    fn process_times(&mut self, pid: u32) -> SysResult<ProcessTimes> {
        self.scripted("process_times")?;
        self.process_times
            .get(&pid)
            .copied()
            .ok_or(crate::error::ERROR_INVALID_PARAMETER)
    }

    fn process_parameters(&mut self, pid: u32) -> SysResult<ProcessParameters> {
        self.scripted("process_parameters")?;
        self.process_parameters
            .get(&pid)
            .cloned()
            .ok_or(crate::error::ERROR_INVALID_PARAMETER)
    }

    fn current_thread_times(&mut self) -> SysResult<ThreadTimes> {
        self.scripted("current_thread_times")?;
        Ok(self.thread_times)
    }

    fn processor_description(&mut self) -> SysResult<ProcessorDescription> {
        self.scripted("processor_description")?;
        Ok(self.processor.clone())
    }

    fn process_modules(
        &mut self,
        _enum_modules: Symbol,
        _module_file_name: Symbol,
        pid: u32,
    ) -> SysResult<Vec<String>> {
        self.modules
            .get(&pid)
            .cloned()
            .ok_or(crate::error::ERROR_INVALID_PARAMETER)
    }

    fn net_sessions(&mut self) -> SysResult<Vec<NetSessionRow>> {
        self.scripted("net_sessions")?;
        Ok(self.net_sessions.clone())
    }

    fn user_hives(&mut self) -> SysResult<Vec<UserHive>> {
        self.scripted("user_hives")?;
        Ok(self.user_hives.clone())
    }

    fn terminal_sessions(
        &mut self,
        _api: &TerminalServicesApi,
    ) -> SysResult<Vec<TerminalSession>> {
        self.scripted("terminal_sessions")?;
        Ok(self.terminal_sessions.clone())
    }

    fn os_version(&mut self) -> SysResult<OsVersion> {
        Ok(self.os_version.clone())
    }

    fn uptime(&mut self) -> SysResult<Duration> {
        Ok(self.uptime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{read_i32, read_u32};

    #[test]
    fn test_block_header_lengths_add_up() {
        let data = BlockBuilder::new()
            .object(230, &[784])
            .instance("System", &[4])
            .build();

        assert_eq!(read_u32(&data, 20), Some(data.len() as u32));
        assert_eq!(read_u32(&data, 28), Some(1));

        let object_total = read_u32(&data, DATA_BLOCK_LEN).unwrap() as usize;
        assert_eq!(DATA_BLOCK_LEN + object_total, data.len());
        assert_eq!(read_i32(&data, DATA_BLOCK_LEN + 40), Some(1));
    }

    #[test]
    fn test_read_counters_asks_for_more_room() {
        let mut mock = MockPlatform::new().with_counters("230", vec![1; 100]);
        let mut small = vec![0; 10];
        assert_eq!(
            mock.read_counters("230", &mut small),
            Err(ReadError::MoreData)
        );

        let mut big = vec![0; 128];
        assert_eq!(mock.read_counters("230", &mut big), Ok(100));
        assert_eq!(mock.calls.counter_reads, 2);
    }

    #[test]
    fn test_enum_processes_truncates_to_buffer() {
        let mut mock = MockPlatform::new();
        mock.pids = vec![0, 4, 8, 12];
        let symbol = Symbol::new(1).unwrap();

        let mut buf = vec![0u8; 8];
        assert_eq!(mock.enum_processes(symbol, &mut buf), Ok(8));
    }
}
