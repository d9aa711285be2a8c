//! Host implementations of the system boundary.

#[cfg(target_os = "windows")]
pub mod windows;
