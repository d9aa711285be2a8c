//! Socket/Network connection information module
//!
//! Connections come from the IPv4 TCP and UDP tables. The owner tables
//! (`GetExtendedTcpTable`, `GetExtendedUdpTable`) are only consulted to map a
//! port back to its process.

use crate::capability::Capability;
use crate::error::{ProbeError, Result};
use crate::platform::*;
use crate::session::Session;
use crate::types::{NetConnFlags, NetConnection, SocketProtocol, SocketState};
use std::net::Ipv4Addr;
use std::ops::ControlFlow;

fn tcp_state(state: u32) -> SocketState {
    match state {
        TCP_STATE_CLOSED => SocketState::Closed,
        TCP_STATE_LISTEN => SocketState::Listen,
        TCP_STATE_SYN_SENT => SocketState::SynSent,
        TCP_STATE_SYN_RCVD => SocketState::SynReceived,
        TCP_STATE_ESTAB => SocketState::Established,
        TCP_STATE_FIN_WAIT1 => SocketState::FinWait1,
        TCP_STATE_FIN_WAIT2 => SocketState::FinWait2,
        TCP_STATE_CLOSE_WAIT => SocketState::CloseWait,
        TCP_STATE_CLOSING => SocketState::Closing,
        TCP_STATE_LAST_ACK => SocketState::LastAck,
        TCP_STATE_TIME_WAIT => SocketState::TimeWait,
        _ => SocketState::Unknown,
    }
}

fn wants_tcp_row(flags: NetConnFlags, row: &TcpRow) -> bool {
    if row.state == TCP_STATE_LISTEN {
        flags.contains(NetConnFlags::SERVER)
    } else {
        flags.contains(NetConnFlags::CLIENT)
    }
}

impl<P: Platform> Session<P> {
    /// Visit every connection selected by `flags`.
    ///
    /// `TCP` and `UDP` pick the tables; `SERVER` selects listening TCP
    /// sockets and every UDP socket, `CLIENT` the other TCP sockets. TCP rows
    /// are visited last row first. Breaking stops the whole walk.
    pub fn connection_walk(
        &mut self,
        flags: NetConnFlags,
        mut visit: impl FnMut(&NetConnection) -> ControlFlow<()>,
    ) -> Result<()> {
        if flags.contains(NetConnFlags::TCP) {
            let get_table = self.require(Capability::GetTcpTable)?;
            let rows = self
                .platform
                .tcp_table(get_table)
                .map_err(ProbeError::from_os)?;

            for row in rows.iter().rev().filter(|row| wants_tcp_row(flags, row)) {
                let conn = NetConnection {
                    protocol: SocketProtocol::Tcp,
                    local_address: row.local_addr,
                    local_port: row.local_port,
                    remote_address: row.remote_addr,
                    remote_port: row.remote_port,
                    state: tcp_state(row.state),
                };
                if visit(&conn).is_break() {
                    return Ok(());
                }
            }
        }

        if flags.contains(NetConnFlags::UDP) && flags.contains(NetConnFlags::SERVER) {
            let get_table = self.require(Capability::GetUdpTable)?;
            let rows = self
                .platform
                .udp_table(get_table)
                .map_err(ProbeError::from_os)?;

            for row in &rows {
                let conn = NetConnection {
                    protocol: SocketProtocol::Udp,
                    local_address: row.local_addr,
                    local_port: row.local_port,
                    remote_address: Ipv4Addr::UNSPECIFIED,
                    remote_port: 0,
                    state: SocketState::Unknown,
                };
                if visit(&conn).is_break() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Every connection selected by `flags`, see [`Session::connection_walk`].
    pub fn network_connections(&mut self, flags: NetConnFlags) -> Result<Vec<NetConnection>> {
        let mut list = Vec::new();
        self.connection_walk(flags, |conn| {
            list.push(conn.clone());
            ControlFlow::Continue(())
        })?;
        Ok(list)
    }

    /// Pid of the process listening on a TCP port or bound to a UDP port.
    pub fn process_port(&mut self, protocol: SocketProtocol, port: u16) -> Result<u32> {
        let owner = match protocol {
            SocketProtocol::Tcp => {
                let get_table = self.require(Capability::GetExtendedTcpTable)?;
                self.platform
                    .tcp_owner_table(get_table)
                    .map_err(ProbeError::from_os)?
                    .iter()
                    .find(|row| row.state == TCP_STATE_LISTEN && row.local_port == port)
                    .and_then(|row| row.owner_pid)
            }
            SocketProtocol::Udp => {
                let get_table = self.require(Capability::GetExtendedUdpTable)?;
                self.platform
                    .udp_owner_table(get_table)
                    .map_err(ProbeError::from_os)?
                    .iter()
                    .find(|row| row.local_port == port)
                    .and_then(|row| row.owner_pid)
            }
        };

        owner.ok_or_else(|| ProbeError::NotFound(format!("{} port {}", protocol, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::MockPlatform;
    use pretty_assertions::assert_eq;

    fn tcp(state: u32, local_port: u16, remote_port: u16, pid: u32) -> TcpRow {
        TcpRow {
            state,
            local_addr: Ipv4Addr::new(127, 0, 0, 1),
            local_port,
            remote_addr: Ipv4Addr::new(127, 0, 0, 1),
            remote_port,
            owner_pid: Some(pid),
        }
    }

    fn sockets() -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.tcp = vec![
            tcp(TCP_STATE_LISTEN, 80, 0, 100),
            tcp(TCP_STATE_ESTAB, 50000, 80, 200),
            tcp(TCP_STATE_LISTEN, 443, 0, 300),
            tcp(TCP_STATE_TIME_WAIT, 50001, 443, 0),
        ];
        platform.udp = vec![UdpRow {
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_port: 53,
            owner_pid: Some(400),
        }];
        platform
    }

    fn ports(list: &[NetConnection]) -> Vec<u16> {
        list.iter().map(|c| c.local_port).collect()
    }

    #[test]
    fn test_server_connections() {
        let mut session = Session::with_platform(sockets(), SessionConfig::default());

        let list = session
            .network_connections(NetConnFlags::TCP | NetConnFlags::UDP | NetConnFlags::SERVER)
            .unwrap();
        assert_eq!(ports(&list), vec![443, 80, 53]);
        assert_eq!(list[0].state, SocketState::Listen);
        assert_eq!(list[2].protocol, SocketProtocol::Udp);
        assert_eq!(list[2].state, SocketState::Unknown);
    }

    #[test]
    fn test_client_connections() {
        let mut session = Session::with_platform(sockets(), SessionConfig::default());

        let list = session
            .network_connections(NetConnFlags::TCP | NetConnFlags::UDP | NetConnFlags::CLIENT)
            .unwrap();
        assert_eq!(ports(&list), vec![50001, 50000]);
        assert_eq!(list[0].state, SocketState::TimeWait);
        assert_eq!(list[1].remote_port, 80);
    }

    #[test]
    fn test_break_stops_the_walk() {
        let mut session = Session::with_platform(sockets(), SessionConfig::default());

        let mut seen = 0;
        session
            .connection_walk(
                NetConnFlags::TCP | NetConnFlags::UDP | NetConnFlags::SERVER | NetConnFlags::CLIENT,
                |_| {
                    seen += 1;
                    if seen == 2 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            )
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_process_port() {
        let mut session = Session::with_platform(sockets(), SessionConfig::default());

        assert_eq!(session.process_port(SocketProtocol::Tcp, 443).unwrap(), 300);
        assert_eq!(session.process_port(SocketProtocol::Udp, 53).unwrap(), 400);
        // an established connection is not a listener
        assert!(session
            .process_port(SocketProtocol::Tcp, 50000)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_tcp_state_mapping() {
        assert_eq!(tcp_state(TCP_STATE_CLOSED), SocketState::Closed);
        assert_eq!(tcp_state(TCP_STATE_DELETE_TCB), SocketState::Unknown);
        assert_eq!(tcp_state(TCP_STATE_SYN_RCVD), SocketState::SynReceived);
        assert_eq!(tcp_state(99), SocketState::Unknown);
    }
}
