//! Operating system identity, logged-in users and uptime.
//!
//! Logged-in users are gathered from three independent sources, in order:
//! clients of local shares, user hives loaded in the registry, and remote
//! terminal services sessions. A source that is unavailable contributes
//! nothing.

use crate::capability::{Capability, Module, Resolution};
use crate::error::{ProbeError, Result};
use crate::platform::{
    NetSessionRow, OsVersion, Platform, TerminalServicesApi, TerminalSession, UserHive,
    WTS_PROTOCOL_TYPE_CONSOLE,
};
use crate::session::Session;
use crate::types::{SysInfo, Who};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const UNKNOWN: &str = "unknown";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}

fn share_who(row: NetSessionRow, now: u64) -> Who {
    Who {
        user: row.user,
        device: "network share".to_string(),
        host: row.client,
        time: now.saturating_sub(row.active_secs),
    }
}

fn hive_who(hive: UserHive) -> Option<Who> {
    if hive.name.starts_with('.') || hive.name.contains("_Classes") {
        return None;
    }
    let account = hive.account?;
    let mut who = Who {
        user: account.user,
        device: "console".to_string(),
        host: account.domain,
        time: 0,
    };

    if let Some(volatile) = hive.volatile {
        who.time = volatile.written;
        if let Some(client) = volatile.client_name {
            if !client.is_empty() && client != "Console" {
                who.host = client;
            }
        }
        if let Some(session_name) = volatile.session_name {
            who.device = session_name;
        }
    }
    Some(who)
}

fn terminal_who(session: TerminalSession) -> Option<Who> {
    if session.protocol == Some(WTS_PROTOCOL_TYPE_CONSOLE) {
        return None;
    }
    Some(Who {
        user: session.user.unwrap_or_else(|| UNKNOWN.to_string()),
        device: session.station,
        host: session
            .client_address
            .map_or_else(|| UNKNOWN.to_string(), |addr| addr.to_string()),
        time: session.connect_time,
    })
}

/// Marketing name and code name of a Windows version.
fn vendor_of(version: &OsVersion) -> (&'static str, &'static str) {
    match (version.major, version.minor) {
        (4, _) => ("NT", ""),
        (5, 0) => ("2000", ""),
        (5, 1) => ("XP", "Whistler"),
        (5, 2) => ("2003", "Whistler Server"),
        (6, 0) => ("Vista", "Longhorn"),
        (6, 1) => ("7", "Windows 7"),
        (6, 2) => ("8", ""),
        (6, 3) => ("8.1", ""),
        // Windows 11 still reports 10.0
        (10, _) if version.build >= 22000 => ("11", ""),
        (10, _) => ("10", ""),
        _ => ("Unknown", ""),
    }
}

impl<P: Platform> Session<P> {
    /// Logged-in users from every source the host offers.
    pub fn who_list(&mut self) -> Result<Vec<Who>> {
        let mut who = Vec::new();

        match self.platform.net_sessions() {
            Ok(rows) => {
                let now = unix_now();
                who.extend(rows.into_iter().map(|row| share_who(row, now)));
            }
            Err(code) => debug!(code, "share sessions unavailable"),
        }

        match self.platform.user_hives() {
            Ok(hives) => who.extend(hives.into_iter().filter_map(hive_who)),
            Err(code) => debug!(code, "user hives unavailable"),
        }

        if let Some(api) = self.terminal_services() {
            match self.platform.terminal_sessions(&api) {
                Ok(sessions) => who.extend(sessions.into_iter().filter_map(terminal_who)),
                Err(code) => debug!(code, "terminal sessions unavailable"),
            }
        }

        Ok(who)
    }

    /// The terminal services entry points, when the whole module resolves.
    fn terminal_services(&mut self) -> Option<TerminalServicesApi> {
        if let Err(err) =
            self.capabilities
                .resolve(&mut self.platform, Module::Wtsapi32, Resolution::Strict)
        {
            debug!(error = %err, "terminal services api not available");
            return None;
        }

        Some(TerminalServicesApi {
            enumerate_sessions: self.optional(Capability::WTSEnumerateSessionsW)?,
            query_session: self.optional(Capability::WTSQuerySessionInformationW)?,
            free_memory: self.optional(Capability::WTSFreeMemory)?,
        })
    }

    pub fn sys_info(&mut self) -> Result<SysInfo> {
        let version = self.platform.os_version().map_err(ProbeError::from_os)?;
        let (vendor_version, code_name) = vendor_of(&version);

        Ok(SysInfo {
            name: "Win32".to_string(),
            version: format!("{}.{}", version.major, version.minor),
            arch: version.arch.clone(),
            description: format!("Microsoft Windows {}", vendor_version),
            patch_level: version.service_pack.clone(),
            vendor: "Microsoft".to_string(),
            vendor_name: format!("Windows {}", vendor_version),
            vendor_version: vendor_version.to_string(),
            vendor_code_name: code_name.to_string(),
        })
    }

    /// Time since boot.
    pub fn uptime(&mut self) -> Result<Duration> {
        self.platform.uptime().map_err(ProbeError::from_os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::capability::ModuleState;
    use crate::mock::MockPlatform;
    use crate::platform::{Account, VolatileEnvironment};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn version(major: u32, minor: u32, build: u32) -> OsVersion {
        OsVersion {
            major,
            minor,
            build,
            service_pack: String::new(),
            arch: "x86_64".to_string(),
        }
    }

    #[test]
    fn test_vendor_mapping() {
        assert_eq!(vendor_of(&version(5, 1, 2600)), ("XP", "Whistler"));
        assert_eq!(vendor_of(&version(5, 2, 3790)), ("2003", "Whistler Server"));
        assert_eq!(vendor_of(&version(6, 3, 9600)).0, "8.1");
        assert_eq!(vendor_of(&version(10, 0, 19045)).0, "10");
        assert_eq!(vendor_of(&version(10, 0, 22631)).0, "11");
    }

    #[test]
    fn test_sys_info() {
        let mut platform = MockPlatform::new();
        platform.os_version = OsVersion {
            service_pack: "Service Pack 1".to_string(),
            ..version(6, 1, 7601)
        };
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let info = session.sys_info().unwrap();
        assert_eq!(info.name, "Win32");
        assert_eq!(info.version, "6.1");
        assert_eq!(info.vendor, "Microsoft");
        assert_eq!(info.vendor_name, "Windows 7");
        assert_eq!(info.description, "Microsoft Windows 7");
        assert_eq!(info.patch_level, "Service Pack 1");
        assert_eq!(info.arch, "x86_64");
    }

    fn remote_session(user: Option<&str>, address: Option<[u8; 4]>) -> TerminalSession {
        TerminalSession {
            station: "RDP-Tcp#3".into(),
            protocol: Some(2),
            client_address: address.map(Ipv4Addr::from),
            user: user.map(String::from),
            connect_time: 1_700_000_000,
        }
    }

    #[test]
    fn test_who_list_merges_every_source() {
        let mut platform = MockPlatform::new();
        platform.net_sessions = vec![NetSessionRow {
            user: "bob".into(),
            client: "\\\\10.0.0.7".into(),
            active_secs: 60,
        }];
        platform.user_hives = vec![UserHive {
            name: "S-1-5-21-1000".into(),
            account: Some(Account {
                user: "alice".into(),
                domain: "CORP".into(),
            }),
            volatile: None,
        }];
        platform.terminal_sessions = vec![remote_session(Some("carol"), Some([10, 0, 0, 9]))];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let who = session.who_list().unwrap();
        assert_eq!(who.len(), 3);

        assert_eq!(who[0].user, "bob");
        assert_eq!(who[0].device, "network share");
        assert!(who[0].time > 0 && who[0].time <= unix_now() - 60);

        assert_eq!(
            who[1],
            Who {
                user: "alice".into(),
                device: "console".into(),
                host: "CORP".into(),
                time: 0,
            }
        );
        assert_eq!(
            who[2],
            Who {
                user: "carol".into(),
                device: "RDP-Tcp#3".into(),
                host: "10.0.0.9".into(),
                time: 1_700_000_000,
            }
        );
    }

    #[test]
    fn test_user_hives_skip_non_accounts() {
        let account = || {
            Some(Account {
                user: "alice".into(),
                domain: "CORP".into(),
            })
        };
        let mut platform = MockPlatform::new();
        platform.user_hives = vec![
            UserHive {
                name: ".DEFAULT".into(),
                account: account(),
                volatile: None,
            },
            UserHive {
                name: "S-1-5-21-1000_Classes".into(),
                account: account(),
                volatile: None,
            },
            UserHive {
                name: "S-1-5-18".into(),
                account: None,
                volatile: None,
            },
            UserHive {
                name: "S-1-5-21-1000".into(),
                account: account(),
                volatile: Some(VolatileEnvironment {
                    written: 1_650_000_000,
                    client_name: Some("LAPTOP-7".into()),
                    session_name: Some("RDP-Tcp#0".into()),
                }),
            },
            UserHive {
                name: "S-1-5-21-1001".into(),
                account: account(),
                volatile: Some(VolatileEnvironment {
                    written: 1_650_000_100,
                    client_name: Some("Console".into()),
                    session_name: None,
                }),
            },
        ];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let who = session.who_list().unwrap();
        assert_eq!(who.len(), 2);
        assert_eq!(
            (who[0].host.as_str(), who[0].device.as_str(), who[0].time),
            ("LAPTOP-7", "RDP-Tcp#0", 1_650_000_000)
        );
        assert_eq!(
            (who[1].host.as_str(), who[1].device.as_str(), who[1].time),
            ("CORP", "console", 1_650_000_100)
        );
    }

    #[test]
    fn test_terminal_sessions_skip_console_and_fill_unknown() {
        let mut platform = MockPlatform::new();
        platform.terminal_sessions = vec![
            TerminalSession {
                protocol: Some(WTS_PROTOCOL_TYPE_CONSOLE),
                ..remote_session(Some("admin"), None)
            },
            remote_session(None, None),
            remote_session(Some(""), Some([192, 168, 4, 2])),
        ];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let who = session.who_list().unwrap();
        assert_eq!(who.len(), 2);
        assert_eq!((who[0].user.as_str(), who[0].host.as_str()), (UNKNOWN, UNKNOWN));
        // an empty user name is still a session
        assert_eq!((who[1].user.as_str(), who[1].host.as_str()), ("", "192.168.4.2"));
    }

    #[test]
    fn test_who_list_without_wtsapi_uses_other_sources() {
        let mut platform = MockPlatform::new().without_module("wtsapi32.dll");
        platform.net_sessions = vec![NetSessionRow {
            user: "bob".into(),
            ..Default::default()
        }];
        platform.terminal_sessions = vec![remote_session(Some("carol"), None)];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let who = session.who_list().unwrap();
        assert_eq!(who.len(), 1);
        assert_eq!(who[0].user, "bob");
        assert_eq!(
            session.capabilities().state(Module::Wtsapi32),
            ModuleState::Unavailable(126)
        );
    }

    #[test]
    fn test_who_list_without_one_wts_symbol() {
        let mut platform = MockPlatform::new().without_symbol("WTSFreeMemory");
        platform.terminal_sessions = vec![remote_session(Some("carol"), None)];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        assert!(session.who_list().unwrap().is_empty());
    }

    #[test]
    fn test_who_list_survives_failing_sources() {
        let mut platform = MockPlatform::new()
            .with_call_error("net_sessions", 5)
            .with_call_error("user_hives", 5);
        platform.terminal_sessions = vec![remote_session(Some("carol"), None)];
        let mut session = Session::with_platform(platform, SessionConfig::default());

        let who = session.who_list().unwrap();
        assert_eq!(who.len(), 1);
        assert_eq!(who[0].user, "carol");
    }

    #[test]
    fn test_uptime() {
        let mut platform = MockPlatform::new();
        platform.uptime = Duration::from_secs(3600);
        let mut session = Session::with_platform(platform, SessionConfig::default());
        assert_eq!(session.uptime().unwrap(), Duration::from_secs(3600));
    }
}
