//! Disk information module
//!
//! Volume space and drive enumeration come from the system tables, I/O
//! counters from the logical disk counter object.

use crate::error::{ProbeError, Result};
use crate::perf::offsets::counter_fields;
use crate::perf::{build_offsets, InstanceWalker, Row, KEY_DISK};
use crate::platform::{
    DriveRow, Platform, DRIVE_CDROM, DRIVE_FIXED, DRIVE_RAMDISK, DRIVE_REMOTE,
};
use crate::session::Session;
use crate::types::{DiskIo, FileSystem, FileSystemUsage, FsType};
use tracing::debug;

counter_fields! {
    pub(crate) enum DiskField {
        Reads = 208,
        Writes = 210,
        ReadBytes = 220,
        WriteBytes = 222,
        Queue = 1028,
    }
}

/// Drive part of a logical disk instance name: `"0 C:"` is `"C:"`.
fn instance_drive(name: &str) -> &str {
    let rest = name.trim_start_matches(|c: char| c.is_ascii_digit());
    match rest.strip_prefix(' ') {
        Some(drive) if rest.len() < name.len() => drive,
        _ => name,
    }
}

/// Whether an instance name refers to the drive of `dir`; only the drive
/// letter and colon are compared.
fn same_drive(instance: &str, dir: &str) -> bool {
    let drive = instance_drive(instance);
    match (drive.get(..2), dir.get(..2)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn disk_from_row(row: &Row<DiskField>) -> DiskIo {
    DiskIo {
        reads: row.get(DiskField::Reads),
        writes: row.get(DiskField::Writes),
        read_bytes: row.get(DiskField::ReadBytes),
        write_bytes: row.get(DiskField::WriteBytes),
        queue: row.get(DiskField::Queue),
    }
}

fn fs_type_of(drive_type: u32) -> FsType {
    match drive_type {
        DRIVE_FIXED => FsType::LocalDisk,
        DRIVE_REMOTE => FsType::Network,
        DRIVE_CDROM => FsType::Cdrom,
        DRIVE_RAMDISK => FsType::RamDisk,
        _ => FsType::None,
    }
}

impl<P: Platform> Session<P> {
    /// I/O counters of the logical disk holding `dir`.
    pub fn disk_io(&mut self, dir: &str) -> Result<DiskIo> {
        let object = self.query(KEY_DISK)?;
        let offsets = build_offsets::<DiskField>(&object)?;
        if !offsets.found_any() {
            return Err(ProbeError::NotFound(format!("disk counters for {}", dir)));
        }

        InstanceWalker::new(&object, &offsets)
            .find(|row| same_drive(&row.name, dir))?
            .map(|row| disk_from_row(&row))
            .ok_or_else(|| ProbeError::NotFound(dir.to_string()))
    }

    /// Space usage of the volume holding `dir`, in KiB.
    pub fn filesystem_usage(&mut self, dir: &str) -> Result<FileSystemUsage> {
        let space = self
            .platform
            .disk_free_space(dir)
            .map_err(ProbeError::from_os)?;

        let total = space.total / 1024;
        let free = space.free / 1024;
        let avail = space.avail / 1024;
        let used = total.saturating_sub(free);

        let usable = used + avail;
        let use_percent = if usable == 0 {
            0.0
        } else {
            used as f64 / usable as f64
        };

        let disk = match self.disk_io(dir) {
            Ok(disk) => Some(disk),
            Err(err) => {
                debug!(dir, error = %err, "no disk counters for volume");
                None
            }
        };

        Ok(FileSystemUsage {
            total,
            free,
            avail,
            used,
            use_percent,
            disk,
        })
    }

    /// Mounted volumes. Fixed drives without a volume serial are not
    /// formatted and are left out.
    pub fn filesystem_list(&mut self) -> Result<Vec<FileSystem>> {
        let drives = self
            .platform
            .logical_drives()
            .map_err(ProbeError::from_os)?;

        Ok(drives
            .into_iter()
            .filter(|drive| !(drive.drive_type == DRIVE_FIXED && drive.serial == 0))
            .map(filesystem_from_drive)
            .collect())
    }
}

fn filesystem_from_drive(drive: DriveRow) -> FileSystem {
    let fs_type = fs_type_of(drive.drive_type);
    let sys_type_name = if drive.fs_name.is_empty() {
        fs_type.type_name().to_string()
    } else {
        drive.fs_name
    };

    FileSystem {
        dev_name: drive.root.clone(),
        dir_name: drive.root,
        fs_type,
        type_name: fs_type.type_name().to_string(),
        sys_type_name,
    }
}
