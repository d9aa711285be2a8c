//! Process information module
//!
//! Pids come from `EnumProcesses` when psapi is present and from the process
//! counter object otherwise. The process summary comes from the counter
//! object; times, arguments, executable and environment are read from the
//! process itself.

use crate::capability::{Capability, Module, Resolution};
use crate::error::{ProbeError, Result};
use crate::perf::offsets::counter_fields;
use crate::perf::{self, build_offsets, InstanceWalker, Row, KEY_PROCESS};
use crate::platform::Platform;
use crate::session::{ProcessSnapshot, Session};
use crate::types::{ProcessExe, ProcessInfo, ProcessState, ProcessTime};
use crate::util::{split_command_line, split_multi_sz, ticks_to_ms};
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::trace;

counter_fields! {
    pub(crate) enum ProcessField {
        CpuTime = 6 as Ticks,
        PageFaults = 28,
        VirtualBytes = 174,
        WorkingSet = 180,
        ThreadCount = 680,
        HandleCount = 952,
        Pid = 784,
        ParentPid = 1410,
        Priority = 682,
        StartTime = 684,
    }
}

/// FILETIME value of 1970-01-01, in 100 ns ticks since 1601.
const EPOCH_DIFFERENCE: u64 = 116_444_736_000_000_000;

fn filetime_to_unix_ms(filetime: u64) -> u64 {
    filetime
        .checked_sub(EPOCH_DIFFERENCE)
        .map_or(0, |since_epoch| since_epoch / 10_000)
}

/// `cwd` without its trailing separator and with an uppercase drive letter,
/// plus its drive root.
fn split_cwd(cwd: &str) -> (String, String) {
    if cwd.is_empty() {
        return (String::new(), String::new());
    }
    let root: String = cwd.chars().take(3).collect();
    let cwd = cwd.strip_suffix('\\').unwrap_or(cwd);
    (upper_first(cwd), upper_first(&root))
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn process_from_row(row: &Row<ProcessField>) -> ProcessInfo {
    ProcessInfo {
        pid: row.get(ProcessField::Pid) as u32,
        ppid: row.get(ProcessField::ParentPid) as u32,
        name: row.name.clone(),
        state: ProcessState::Running,
        virtual_memory: row.get(ProcessField::VirtualBytes),
        resident_memory: row.get(ProcessField::WorkingSet),
        page_faults: row.get(ProcessField::PageFaults),
        priority: row.get(ProcessField::Priority) as u32,
        handles: row.get(ProcessField::HandleCount) as u32,
        threads: row.get(ProcessField::ThreadCount) as u32,
        cpu_time_ms: row.get(ProcessField::CpuTime),
        start_time: filetime_to_unix_ms(row.get(ProcessField::StartTime)),
    }
}

impl<P: Platform> Session<P> {
    /// List all process ids. The idle process (pid 0) is never listed.
    pub fn process_list(&mut self) -> Result<Vec<u32>> {
        match self.optional(Capability::EnumProcesses) {
            Some(enum_processes) => self.enumerate_pids(enum_processes),
            None => self.process_list_from_counters(),
        }
    }

    fn enumerate_pids(&mut self, enum_processes: crate::platform::Symbol) -> Result<Vec<u32>> {
        self.buffer.ensure(0);

        // a completely filled buffer may have been truncated
        let used = loop {
            let used = self
                .platform
                .enum_processes(enum_processes, self.buffer.as_mut_slice())
                .map_err(ProbeError::from_os)?;
            if used < self.buffer.capacity() {
                break used;
            }
            let size = self.buffer.grow();
            trace!(size, "pid list filled the buffer, retrying");
        };

        let data = self.buffer.as_slice().get(..used).unwrap_or_default();
        Ok(data
            .chunks_exact(4)
            .filter_map(|chunk| chunk.try_into().ok().map(u32::from_ne_bytes))
            .filter(|&pid| pid != 0)
            .collect())
    }

    fn process_list_from_counters(&mut self) -> Result<Vec<u32>> {
        let object = self.query(KEY_PROCESS)?;
        let offsets = build_offsets::<ProcessField>(&object)?;

        let rows = InstanceWalker::new(&object, &offsets)
            .exclude(|row| row.get(ProcessField::Pid) == 0)
            .collect()?;
        Ok(rows
            .iter()
            .map(|row| row.get(ProcessField::Pid) as u32)
            .collect())
    }

    /// Get information about a specific process.
    ///
    /// A lookup of the same pid within the snapshot lifetime returns the
    /// previous result without walking the counters again.
    pub fn process_info(&mut self, pid: u32) -> Result<ProcessInfo> {
        if let Some(snapshot) = &self.last_process {
            if snapshot.info.pid == pid
                && snapshot.taken.elapsed() < self.config.process_snapshot_ttl
            {
                return Ok(snapshot.info.clone());
            }
        }

        let info = {
            let object = perf::query(&mut self.platform, &mut self.buffer, KEY_PROCESS)?;
            let offsets = build_offsets::<ProcessField>(&object)?;
            InstanceWalker::new(&object, &offsets)
                .find(|row| row.get(ProcessField::Pid) == u64::from(pid))?
                .map(|row| process_from_row(&row))
                .ok_or(ProbeError::NoSuchProcess(pid))?
        };

        self.last_process = Some(ProcessSnapshot {
            info: info.clone(),
            taken: Instant::now(),
        });
        Ok(info)
    }

    /// Visit the `KEY=VALUE` pairs of a process environment.
    ///
    /// Drive-letter entries such as `=C:=C:\` are skipped; an entry without
    /// `=` ends the walk.
    pub fn process_env(
        &mut self,
        pid: u32,
        mut visit: impl FnMut(&str, &str) -> ControlFlow<()>,
    ) -> Result<()> {
        let block = self
            .platform
            .environment_block(pid)
            .map_err(|code| ProbeError::from_process_os(pid, code))?;

        for entry in split_multi_sz(&block) {
            if entry.starts_with('=') {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                break;
            };
            if visit(key, value).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// The value of environment variable `key` in a process, matched
    /// without regard to ASCII case.
    pub fn process_env_var(&mut self, pid: u32, key: &str) -> Result<Option<String>> {
        let mut found = None;
        self.process_env(pid, |name, value| {
            if name.eq_ignore_ascii_case(key) {
                found = Some(value.to_string());
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    /// Start time and accumulated CPU times of a process.
    pub fn process_time(&mut self, pid: u32) -> Result<ProcessTime> {
        let times = self
            .platform
            .process_times(pid)
            .map_err(|code| ProbeError::from_process_os(pid, code))?;

        let user = ticks_to_ms(times.user);
        let sys = ticks_to_ms(times.kernel);
        Ok(ProcessTime {
            start_time: filetime_to_unix_ms(times.start),
            user,
            sys,
            total: user + sys,
        })
    }

    /// Command line arguments of a process, program name first.
    pub fn process_args(&mut self, pid: u32) -> Result<Vec<String>> {
        let params = self
            .platform
            .process_parameters(pid)
            .map_err(|code| ProbeError::from_process_os(pid, code))?;
        Ok(split_command_line(&params.command_line))
    }

    /// Image path, working directory and drive root of a process.
    pub fn process_exe(&mut self, pid: u32) -> Result<ProcessExe> {
        let params = self
            .platform
            .process_parameters(pid)
            .map_err(|code| ProbeError::from_process_os(pid, code))?;

        let (cwd, root) = split_cwd(&params.cwd);
        trace!(pid, image = %params.image_path, "process executable");
        Ok(ProcessExe {
            name: upper_first(&params.image_path),
            cwd,
            root,
        })
    }

    /// Visit the file name of every module loaded into a process.
    pub fn process_modules(
        &mut self,
        pid: u32,
        mut visit: impl FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        self.capabilities
            .resolve(&mut self.platform, Module::Psapi, Resolution::Strict)
            .map_err(|_| ProbeError::NotImplemented(Module::Psapi.file_name()))?;
        let enum_modules = self.require(Capability::EnumProcessModules)?;
        let file_name = self.require(Capability::GetModuleFileNameExW)?;

        let modules = self
            .platform
            .process_modules(enum_modules, file_name, pid)
            .map_err(|code| ProbeError::from_process_os(pid, code))?;

        for module in &modules {
            if visit(module).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{BlockBuilder, MockPlatform};
    use crate::platform::{ProcessParameters, ProcessTimes};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TITLES: [u32; 9] = [6, 28, 174, 180, 680, 952, 784, 1410, 682];

    // 2021-01-01T00:00:00Z as a FILETIME
    const START: u64 = 132_539_328_000_000_000;

    fn process_block() -> Vec<u8> {
        BlockBuilder::new()
            .object(230, &TITLES)
            .counter64(684)
            .instance("Idle", &[0, 0, 0, 0, 1, 0, 0, 0, 0, 0])
            .instance("System", &[50_000, 10, 4096, 2048, 120, 900, 4, 0, 8, START])
            .instance("smss", &[0, 1, 8192, 1024, 2, 50, 388, 4, 11, 0])
            .build()
    }

    fn counters_only() -> MockPlatform {
        MockPlatform::new()
            .without_module("psapi.dll")
            .with_counters(KEY_PROCESS, process_block())
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(filetime_to_unix_ms(START), 1_609_459_200_000);
        assert_eq!(filetime_to_unix_ms(EPOCH_DIFFERENCE - 1), 0);
    }

    #[test]
    fn test_process_list_skips_idle_from_counters() {
        let mut session = Session::with_platform(counters_only(), SessionConfig::default());
        assert_eq!(session.process_list().unwrap(), vec![4, 388]);
    }

    #[test]
    fn test_process_list_prefers_psapi() {
        let mut platform = MockPlatform::new();
        platform.pids = vec![0, 4, 388, 1024];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(session.process_list().unwrap(), vec![4, 388, 1024]);
        assert_eq!(session.platform().calls.counter_reads, 0);
    }

    #[test]
    fn test_process_list_grows_when_buffer_fills() {
        let mut platform = MockPlatform::new();
        platform.pids = (1..=10).collect();
        let config = SessionConfig::default().with_buffer_increment(16);
        let mut session = Session::with_platform(platform, config);

        assert_eq!(session.process_list().unwrap().len(), 10);
        assert_eq!(session.platform().calls.enum_processes, 3);
    }

    #[test]
    fn test_process_info_decodes_row() {
        let mut session = Session::with_platform(counters_only(), SessionConfig::default());

        let info = session.process_info(4).unwrap();
        assert_eq!(
            info,
            ProcessInfo {
                pid: 4,
                ppid: 0,
                name: "System".to_string(),
                state: ProcessState::Running,
                virtual_memory: 4096,
                resident_memory: 2048,
                page_faults: 10,
                priority: 8,
                handles: 900,
                threads: 120,
                cpu_time_ms: 5,
                start_time: 1_609_459_200_000,
            }
        );
    }

    #[test]
    fn test_process_info_unknown_pid() {
        let mut session = Session::with_platform(counters_only(), SessionConfig::default());
        assert_eq!(
            session.process_info(9999).unwrap_err(),
            ProbeError::NoSuchProcess(9999)
        );
        assert!(session.last_process.is_none());
    }

    #[test]
    fn test_process_info_reuses_snapshot() {
        let mut session = Session::with_platform(counters_only(), SessionConfig::default());

        session.process_info(388).unwrap();
        session.process_info(388).unwrap();
        assert_eq!(session.platform().calls.counter_reads, 1);

        session.process_info(4).unwrap();
        assert_eq!(session.platform().calls.counter_reads, 2);
    }

    #[test]
    fn test_expired_snapshot_is_refreshed() {
        let config = SessionConfig::default().with_process_snapshot_ttl(Duration::ZERO);
        let mut session = Session::with_platform(counters_only(), config);

        session.process_info(388).unwrap();
        session.process_info(388).unwrap();
        assert_eq!(session.platform().calls.counter_reads, 2);
    }

    #[test]
    fn test_process_env_walk() {
        let mut platform = MockPlatform::new();
        platform.environments.insert(
            7,
            "=C:=C:\\\0PATH=C:\\bin\0HOME=C:\\Users\\me\0broken\0LATE=1\0\0"
                .encode_utf16()
                .collect(),
        );
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let mut seen = Vec::new();
        session
            .process_env(7, |key, value| {
                seen.push(format!("{}={}", key, value));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, vec!["PATH=C:\\bin", "HOME=C:\\Users\\me"]);

        let mut count = 0;
        session
            .process_env(7, |_, _| {
                count += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unreadable_environment_is_not_implemented() {
        let mut session = Session::with_platform(MockPlatform::new(), SessionConfig::default());
        assert!(matches!(
            session.process_env(1234, |_, _| ControlFlow::Continue(())),
            Err(ProbeError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_process_env_var() {
        let mut platform = MockPlatform::new();
        platform.environments.insert(
            1234,
            "=C:=C:\\\0Path=C:\\bin\0TEMP=C:\\tmp\0\0"
                .encode_utf16()
                .collect(),
        );
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session.process_env_var(1234, "PATH").unwrap().as_deref(),
            Some("C:\\bin")
        );
        assert_eq!(session.process_env_var(1234, "HOME").unwrap(), None);
        assert!(matches!(
            session.process_env_var(99, "PATH"),
            Err(ProbeError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_process_time() {
        let mut platform = MockPlatform::new();
        platform.process_times.insert(
            4,
            ProcessTimes {
                start: START,
                kernel: 25_000_000,
                user: 10_000_000,
            },
        );
        platform.process_times.insert(
            8,
            ProcessTimes {
                start: 0x0000_0000_ffff_ffff,
                ..Default::default()
            },
        );
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session.process_time(4).unwrap(),
            ProcessTime {
                start_time: 1_609_459_200_000,
                user: 1000,
                sys: 2500,
                total: 3500,
            }
        );
        // a start time before 1970 reads as unknown
        assert_eq!(session.process_time(8).unwrap().start_time, 0);
        assert_eq!(
            session.process_time(5).unwrap_err(),
            ProbeError::NoSuchProcess(5)
        );
    }

    fn parameters(command_line: &str, image_path: &str, cwd: &str) -> ProcessParameters {
        ProcessParameters {
            command_line: command_line.into(),
            image_path: image_path.into(),
            cwd: cwd.into(),
        }
    }

    #[test]
    fn test_process_args() {
        let mut platform = MockPlatform::new();
        platform.process_parameters.insert(
            300,
            parameters(
                r#""C:\Program Files\svc.exe" --port 8080 "--name=web one""#,
                "",
                "",
            ),
        );
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session.process_args(300).unwrap(),
            vec![
                r"C:\Program Files\svc.exe",
                "--port",
                "8080",
                "--name=web one",
            ]
        );
        assert_eq!(
            session.process_args(301).unwrap_err(),
            ProbeError::NoSuchProcess(301)
        );
    }

    #[test]
    fn test_process_exe() {
        let mut platform = MockPlatform::new();
        platform.process_parameters.insert(
            300,
            parameters("", r"c:\svc\svc.exe", r"d:\work\logs\"),
        );
        platform
            .process_parameters
            .insert(301, parameters("", r"C:\a.exe", r"c:\"));
        platform.process_parameters.insert(302, parameters("", "", ""));
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session.process_exe(300).unwrap(),
            ProcessExe {
                name: r"C:\svc\svc.exe".into(),
                cwd: r"D:\work\logs".into(),
                root: r"D:\".into(),
            }
        );
        let at_root = session.process_exe(301).unwrap();
        assert_eq!((at_root.cwd.as_str(), at_root.root.as_str()), ("C:", r"C:\"));
        assert_eq!(session.process_exe(302).unwrap(), ProcessExe::default());
    }

    #[test]
    fn test_process_parameters_unreadable() {
        let platform = MockPlatform::new().with_call_error("process_parameters", 299);
        let mut session = Session::with_platform(platform, SessionConfig::default());
        assert_eq!(session.process_exe(4).unwrap_err(), ProbeError::Os(299));
    }

    #[test]
    fn test_process_modules() {
        let mut platform = MockPlatform::new();
        platform.modules.insert(
            4,
            vec!["C:\\app.exe".to_string(), "C:\\ntdll.dll".to_string()],
        );
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let mut modules = Vec::new();
        session
            .process_modules(4, |path| {
                modules.push(path.to_string());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(modules.len(), 2);

        assert_eq!(
            session
                .process_modules(5, |_| ControlFlow::Continue(()))
                .unwrap_err(),
            ProbeError::NoSuchProcess(5)
        );
    }

    #[test]
    fn test_process_modules_need_all_of_psapi() {
        let platform = MockPlatform::new().without_symbol("GetModuleFileNameExW");
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session
                .process_modules(4, |_| ControlFlow::Continue(()))
                .unwrap_err(),
            ProbeError::NotImplemented("psapi.dll")
        );
    }
}
