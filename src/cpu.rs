//! CPU times
//!
//! Processor times come from the kernel's per-processor performance records
//! when `NtQuerySystemInformation` is available, and from the processor
//! counter object otherwise. Processor descriptions come from the
//! registry entry of processor 0.

use crate::capability::Capability;
use crate::error::{ProbeError, Result};
use crate::perf::offsets::counter_fields;
use crate::perf::{self, build_offsets, InstanceWalker, OffsetTable, Row, KEY_PROCESSOR};
use crate::platform::{Platform, ProcessorTimes};
use crate::session::Session;
use crate::types::{Cpu, CpuInfo, ThreadCpu};
use crate::util::ticks_to_ms;
use tracing::warn;

counter_fields! {
    /// Processor counters, all in 100 ns ticks.
    pub(crate) enum CpuField {
        Sys = 144 as Ticks,
        User = 142 as Ticks,
        Idle = 1746 as Ticks,
    }
}

impl<P: Platform> Session<P> {
    /// Times summed over every processor.
    pub fn cpu(&mut self) -> Result<Cpu> {
        match self.optional(Capability::NtQuerySystemInformation) {
            Some(query) => {
                let records = self
                    .platform
                    .processor_performance(query)
                    .map_err(ProbeError::from_os)?;
                let total = records
                    .iter()
                    .map(cpu_from_times)
                    .fold(Cpu::default(), merge);
                Ok(total.finish())
            }
            None => self.cpu_from_counters(),
        }
    }

    /// Times per CPU. Processor records that look like hyper-threads of one
    /// core are merged according to the session's sibling policy.
    pub fn cpu_list(&mut self) -> Result<Vec<Cpu>> {
        let topology = self.platform.cpu_topology().map_err(ProbeError::from_os)?;

        if let Some(query) = self.optional(Capability::NtQuerySystemInformation) {
            let records = self
                .platform
                .processor_performance(query)
                .map_err(ProbeError::from_os)?;
            let group = self.siblings.group_size(&topology, records.len());
            return Ok(merge_groups(records.iter().map(cpu_from_times), group));
        }

        let object = perf::query(&mut self.platform, &mut self.buffer, KEY_PROCESSOR)?;
        let offsets = build_offsets::<CpuField>(&object)?;
        warn_missing_idle(&offsets);

        // the first instance is _Total
        let per_cpu = usize::try_from(object.num_instances())
            .unwrap_or(0)
            .saturating_sub(1);
        let group = self.siblings.group_size(&topology, per_cpu);

        let rows = InstanceWalker::new(&object, &offsets)
            .skip_first()
            .merge_siblings(group)
            .collect()?;
        Ok(rows.iter().map(|row| cpu_from_row(row).finish()).collect())
    }

    /// One description per logical CPU. Every entry describes processor 0.
    pub fn cpu_info_list(&mut self) -> Result<Vec<CpuInfo>> {
        let topology = self.platform.cpu_topology().map_err(ProbeError::from_os)?;
        let description = self
            .platform
            .processor_description()
            .map_err(ProbeError::from_os)?;

        let logical = topology.physical_cores * topology.threads_per_core.max(1);
        let info = CpuInfo {
            vendor: vendor_name(description.vendor_id.trim()).to_string(),
            model_name: description.name.trim().to_string(),
            frequency_mhz: u64::from(description.mhz),
            physical_cores: topology.physical_cores,
            logical_cores: logical,
        };
        Ok(vec![info; logical.max(1) as usize])
    }

    /// CPU times of the calling thread, which is the only thread `0` names.
    pub fn thread_cpu(&mut self, thread: u64) -> Result<ThreadCpu> {
        if thread != 0 {
            return Err(ProbeError::NotImplemented("cpu times of another thread"));
        }
        let times = self
            .platform
            .current_thread_times()
            .map_err(ProbeError::from_os)?;

        // 100 ns ticks to ns
        let user = times.user * 100;
        let sys = times.kernel * 100;
        Ok(ThreadCpu {
            user,
            sys,
            total: user + sys,
        })
    }

    fn cpu_from_counters(&mut self) -> Result<Cpu> {
        let object = self.query(KEY_PROCESSOR)?;
        let offsets = build_offsets::<CpuField>(&object)?;
        warn_missing_idle(&offsets);

        let total = InstanceWalker::new(&object, &offsets)
            .find(|_| true)?
            .ok_or_else(|| ProbeError::NoInstances(KEY_PROCESSOR.to_string()))?;
        Ok(cpu_from_row(&total).finish())
    }
}

fn vendor_name(vendor_id: &str) -> &str {
    match vendor_id {
        "GenuineIntel" => "Intel",
        "AuthenticAMD" => "AMD",
        "CentaurHauls" => "VIA",
        other => other,
    }
}

fn warn_missing_idle(offsets: &OffsetTable<CpuField>) {
    if !offsets.is_present(CpuField::Idle) {
        warn!("processor counters have no idle time, reporting idle as 0");
    }
}

fn cpu_from_row(row: &Row<CpuField>) -> Cpu {
    Cpu {
        sys: row.get(CpuField::Sys),
        user: row.get(CpuField::User),
        idle: row.get(CpuField::Idle),
        ..Default::default()
    }
}

// kernel time includes idle time
fn cpu_from_times(times: &ProcessorTimes) -> Cpu {
    Cpu {
        idle: ticks_to_ms(times.idle),
        user: ticks_to_ms(times.user),
        sys: ticks_to_ms(times.kernel.saturating_sub(times.idle)),
        ..Default::default()
    }
}

fn merge(acc: Cpu, cpu: Cpu) -> Cpu {
    Cpu {
        user: acc.user + cpu.user,
        sys: acc.sys + cpu.sys,
        idle: acc.idle + cpu.idle,
        ..acc
    }
}

fn merge_groups(cpus: impl Iterator<Item = Cpu>, group: Option<usize>) -> Vec<Cpu> {
    let k = group.unwrap_or(1).max(1);
    let mut list: Vec<Cpu> = Vec::new();

    for (i, cpu) in cpus.enumerate() {
        match list.last_mut() {
            Some(last) if i % k != 0 => *last = merge(*last, cpu),
            _ => list.push(cpu),
        }
    }

    list.into_iter().map(Cpu::finish).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{BlockBuilder, MockPlatform};
    use crate::perf::NoSiblingMerge;
    use crate::platform::{CpuTopology, ProcessorDescription, ThreadTimes};
    use pretty_assertions::assert_eq;

    fn counters_only(block: Vec<u8>) -> MockPlatform {
        MockPlatform::new()
            .without_module("ntdll.dll")
            .with_counters(KEY_PROCESSOR, block)
    }

    fn processor_block(per_cpu: &[[u64; 3]]) -> Vec<u8> {
        let mut total = [0u64; 3];
        for cpu in per_cpu {
            for (t, v) in total.iter_mut().zip(cpu) {
                *t += v;
            }
        }

        let mut builder = BlockBuilder::new()
            .object(238, &[144, 142, 1746])
            .instance("_Total", &total);
        for (i, cpu) in per_cpu.iter().enumerate() {
            builder = builder.instance(&i.to_string(), cpu);
        }
        builder.build()
    }

    #[test]
    fn test_cpu_list_from_counters() {
        let block = processor_block(&[[100_000, 200_000, 300_000]; 3]);
        let mut session = Session::with_platform(counters_only(block), SessionConfig::default());

        let cpus = session.cpu_list().unwrap();
        assert_eq!(cpus.len(), 3);
        for cpu in cpus {
            assert_eq!(
                cpu,
                Cpu {
                    sys: 10,
                    user: 20,
                    idle: 30,
                    total: 60,
                    ..Default::default()
                }
            );
        }
    }

    #[test]
    fn test_cpu_total_is_first_instance() {
        let block = processor_block(&[[100_000, 200_000, 300_000]; 2]);
        let mut session = Session::with_platform(counters_only(block), SessionConfig::default());

        let cpu = session.cpu().unwrap();
        assert_eq!((cpu.sys, cpu.user, cpu.idle, cpu.total), (20, 40, 60, 120));
    }

    #[test]
    fn test_hyperthreads_merge_from_counters() {
        let block = processor_block(&[[10_000, 10_000, 10_000]; 4]);
        let mut platform = counters_only(block);
        platform.topology = CpuTopology {
            physical_cores: 2,
            threads_per_core: 2,
            hyperthreading: true,
        };
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let cpus = session.cpu_list().unwrap();
        assert_eq!(cpus.len(), 2);
        assert_eq!((cpus[0].sys, cpus[0].total), (2, 6));
    }

    #[test]
    fn test_sibling_policy_is_swappable() {
        let block = processor_block(&[[10_000, 10_000, 10_000]; 4]);
        let mut platform = counters_only(block);
        platform.topology = CpuTopology {
            physical_cores: 2,
            threads_per_core: 2,
            hyperthreading: true,
        };
        let mut session = Session::with_platform(platform, SessionConfig::default())
            .with_sibling_policy(NoSiblingMerge);

        assert_eq!(session.cpu_list().unwrap().len(), 4);
    }

    #[test]
    fn test_kernel_records_preferred() {
        let mut platform = MockPlatform::new();
        platform.processor_times = vec![
            ProcessorTimes {
                idle: 300_000,
                kernel: 400_000,
                user: 200_000,
            };
            2
        ];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let cpu = session.cpu().unwrap();
        assert_eq!((cpu.sys, cpu.user, cpu.idle, cpu.total), (20, 40, 60, 120));

        let cpus = session.cpu_list().unwrap();
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[1].sys, 10);
        assert_eq!(session.platform().calls.counter_reads, 0);
    }

    #[test]
    fn test_missing_idle_counter_reads_zero() {
        let block = BlockBuilder::new()
            .object(238, &[144, 142])
            .instance("_Total", &[100_000, 100_000])
            .build();
        let mut session = Session::with_platform(counters_only(block), SessionConfig::default());

        let cpu = session.cpu().unwrap();
        assert_eq!((cpu.idle, cpu.total), (0, 20));
    }

    #[test]
    fn test_merge_groups() {
        let one = Cpu {
            user: 1,
            ..Default::default()
        };
        let merged = merge_groups(std::iter::repeat(one).take(5), Some(2));
        assert_eq!(
            merged.iter().map(|c| c.user).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[test]
    fn test_cpu_info_list_repeats_per_logical_cpu() {
        let mut platform = MockPlatform::new();
        platform.topology = CpuTopology {
            physical_cores: 4,
            threads_per_core: 2,
            hyperthreading: true,
        };
        platform.processor = ProcessorDescription {
            vendor_id: "GenuineIntel".into(),
            name: "  Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz".into(),
            mhz: 2112,
        };
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let infos = session.cpu_info_list().unwrap();
        assert_eq!(infos.len(), 8);
        assert_eq!(
            infos[7],
            CpuInfo {
                vendor: "Intel".into(),
                model_name: "Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz".into(),
                frequency_mhz: 2112,
                physical_cores: 4,
                logical_cores: 8,
            }
        );
    }

    #[test]
    fn test_cpu_info_list_without_topology() {
        let mut platform = MockPlatform::new();
        platform.processor.vendor_id = "HygonGenuine".into();
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let infos = session.cpu_info_list().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].vendor, "HygonGenuine");
    }

    #[test]
    fn test_cpu_info_list_registry_failure() {
        let platform = MockPlatform::new().with_call_error("processor_description", 2);
        let mut session = Session::with_platform(platform, SessionConfig::default());
        assert_eq!(session.cpu_info_list().unwrap_err(), ProbeError::Os(2));
    }

    #[test]
    fn test_thread_cpu() {
        let mut platform = MockPlatform::new();
        platform.thread_times = ThreadTimes {
            kernel: 15,
            user: 40,
        };
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert_eq!(
            session.thread_cpu(0).unwrap(),
            ThreadCpu {
                user: 4000,
                sys: 1500,
                total: 5500,
            }
        );
        assert!(matches!(
            session.thread_cpu(42),
            Err(ProbeError::NotImplemented(_))
        ));
    }
}
