//! Network interfaces, addresses, adapters and routes
//!
//! Interface rows are cached per session under a hash of the name this
//! module gives them (`eth0`, `lo0`, `la0`). The first lookup enumerates
//! the whole table; later lookups of interface rows refresh the single
//! entry with `GetIfEntry`. Address and adapter rows are enumerated once
//! per session and never refreshed.

use crate::cache::netif_hash;
use crate::capability::Capability;
use crate::error::{ProbeError, Result};
use crate::platform::{AdapterRow, IfRow, IpAddrRow, Platform, IF_TYPE_ETHERNET, IF_TYPE_LOOPBACK};
use crate::session::Session;
use crate::types::{
    InterfaceConfig, InterfaceFlags, InterfaceStats, NetInfo, NetRoute, RouteFlags, NIC_ETHERNET,
    NIC_LOOPBACK,
};
use std::net::Ipv4Addr;
use tracing::debug;

const LOOPBACK_ADAPTER: &str = "Microsoft Loopback Adapter";

/// Assigns `laN`, `loN` and `ethN` names in table order.
#[derive(Debug, Default)]
struct InterfaceNamer {
    la: u32,
    lo: u32,
    eth: u32,
}

impl InterfaceNamer {
    fn name(&mut self, row: &IfRow) -> Option<String> {
        let (prefix, counter) = if row.description == LOOPBACK_ADAPTER {
            ("la", &mut self.la)
        } else {
            match row.if_type {
                IF_TYPE_LOOPBACK => ("lo", &mut self.lo),
                IF_TYPE_ETHERNET => ("eth", &mut self.eth),
                _ => return None,
            }
        };
        let name = format!("{}{}", prefix, counter);
        *counter += 1;
        Some(name)
    }
}

fn format_hwaddr(bytes: &[u8]) -> String {
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(bytes) {
        *dst = *src;
    }
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn broadcast_of(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let a = u32::from(addr);
    let m = u32::from(mask);
    Ipv4Addr::from((a & m) | !m)
}

impl<P: Platform> Session<P> {
    /// Names of every ethernet and loopback interface, in table order.
    ///
    /// The interface cache is created on the first successful listing and
    /// its entries are overwritten in place on every later one.
    pub fn interface_list(&mut self) -> Result<Vec<String>> {
        let get_table = self.require(Capability::GetIfTable)?;
        let rows = self
            .platform
            .if_table(get_table)
            .map_err(ProbeError::from_os)?;

        let mut cache = match self.interfaces.take() {
            Some(cache) => cache,
            None => self.new_netif_cache("interfaces"),
        };
        let mut namer = InterfaceNamer::default();
        let mut names = Vec::with_capacity(rows.len());

        for row in &rows {
            let Some(name) = namer.name(row) else {
                continue;
            };
            cache.update(netif_hash(&name), row);
            names.push(name);
        }
        debug!(cache = "interfaces", rows = names.len(), "row cache populated");

        self.interfaces = Some(cache);
        Ok(names)
    }

    /// The interface row named `name`.
    ///
    /// A row already in the cache is refreshed from the system before it is
    /// returned. Without `GetIfEntry` the cached row is returned as is.
    pub fn if_row(&mut self, name: &str) -> Result<IfRow> {
        let key = netif_hash(name);

        if self.interfaces.is_none() {
            self.interface_list()?;
            return self
                .interfaces
                .as_ref()
                .and_then(|cache| cache.get(key))
                .cloned()
                .ok_or_else(|| ProbeError::NotFound(name.to_string()));
        }

        let get_entry = self.optional(Capability::GetIfEntry);
        let row = self
            .interfaces
            .as_mut()
            .and_then(|cache| cache.get_mut(key))
            .ok_or_else(|| ProbeError::NotFound(name.to_string()))?;
        let Some(get_entry) = get_entry else {
            return Ok(row.clone());
        };
        self.platform
            .if_entry(get_entry, row)
            .map_err(ProbeError::from_os)?;
        Ok(row.clone())
    }

    /// The primary IPv4 address row of interface `index`.
    pub fn ip_addr(&mut self, index: u32) -> Result<IpAddrRow> {
        if self.addresses.is_none() {
            let get_table = self.require(Capability::GetIpAddrTable)?;
            let rows = self
                .platform
                .ip_addr_table(get_table)
                .map_err(ProbeError::from_os)?;

            let mut cache = self.new_netif_cache("addresses");
            cache.populate_all(rows.iter().filter(|row| row.is_primary()), |row| row.index);
            self.addresses = Some(cache);
        }

        self.addresses
            .as_ref()
            .and_then(|cache| cache.get(index))
            .copied()
            .ok_or_else(|| ProbeError::NotFound(format!("address of interface {}", index)))
    }

    /// The adapter record with interface index `index`.
    pub fn adapter_info(&mut self, index: u32) -> Result<AdapterRow> {
        if self.adapters.is_none() {
            let get_info = self.require(Capability::GetAdaptersInfo)?;
            let rows = self
                .platform
                .adapters_info(get_info)
                .map_err(ProbeError::from_os)?;

            let mut cache = self.new_netif_cache("adapters");
            cache.populate_all(&rows, |row| row.index);
            self.adapters = Some(cache);
        }

        self.adapters
            .as_ref()
            .and_then(|cache| cache.get(index))
            .cloned()
            .ok_or_else(|| ProbeError::NotFound(format!("adapter {}", index)))
    }

    /// Configuration of interface `name`.
    pub fn interface_config(&mut self, name: &str) -> Result<InterfaceConfig> {
        let row = self.if_row(name)?;
        let address = match self.ip_addr(row.index) {
            Ok(address) => Some(address),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        let mut config = InterfaceConfig {
            name: name.to_string(),
            if_type: String::new(),
            description: row.description.clone(),
            hwaddr: format_hwaddr(&row.phys_addr),
            address: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            broadcast: Ipv4Addr::UNSPECIFIED,
            flags: InterfaceFlags::empty(),
            mtu: row.mtu,
        };

        if row.is_operational() {
            config.flags |= InterfaceFlags::UP | InterfaceFlags::RUNNING;
        }

        if let Some(address) = &address {
            config.address = address.addr;
            config.netmask = address.mask;
            if row.if_type != IF_TYPE_LOOPBACK && address.bcast_addr != 0 {
                config.broadcast = broadcast_of(address.addr, address.mask);
                config.flags |= InterfaceFlags::BROADCAST;
            }
        }

        if row.if_type == IF_TYPE_LOOPBACK || name.starts_with("la") {
            config.flags |= InterfaceFlags::LOOPBACK;
            config.if_type = NIC_LOOPBACK.to_string();
        } else {
            if address.is_some() {
                config.flags |= InterfaceFlags::MULTICAST;
            }
            config.if_type = NIC_ETHERNET.to_string();
        }

        Ok(config)
    }

    /// Traffic counters of interface `name`.
    pub fn interface_stats(&mut self, name: &str) -> Result<InterfaceStats> {
        let row = self.if_row(name)?;

        Ok(InterfaceStats {
            rx_bytes: row.in_octets,
            rx_packets: row.in_ucast_pkts + row.in_nucast_pkts,
            rx_errors: row.in_errors,
            rx_dropped: row.in_discards,
            tx_bytes: row.out_octets,
            tx_packets: row.out_ucast_pkts + row.out_nucast_pkts,
            tx_errors: row.out_errors,
            tx_dropped: row.out_discards,
            speed: row.speed,
        })
    }

    /// Host name, domain, DNS servers and default gateway.
    pub fn net_info(&mut self) -> Result<NetInfo> {
        let get_params = self.require(Capability::GetNetworkParams)?;
        let params = self
            .platform
            .network_params(get_params)
            .map_err(ProbeError::from_os)?;

        let mut info = NetInfo {
            host_name: params.host_name,
            domain_name: params.domain_name,
            ..Default::default()
        };
        let mut dns = params.dns_servers.into_iter();
        info.primary_dns = dns.next().unwrap_or_default();
        info.secondary_dns = dns.next().unwrap_or_default();

        // the adapter cache is left alone, a fresh list is wanted here
        if let Some(get_info) = self.optional(Capability::GetAdaptersInfo) {
            match self.platform.adapters_info(get_info) {
                Ok(adapters) => {
                    if let Some(gateway) = adapters
                        .iter()
                        .filter_map(|adapter| adapter.gateway)
                        .filter(|gateway| !gateway.is_unspecified())
                        .last()
                    {
                        info.default_gateway = gateway.to_string();
                    }
                }
                Err(code) => debug!(code, "adapter list unavailable, no default gateway"),
            }
        }

        Ok(info)
    }

    /// The IPv4 routing table.
    pub fn route_list(&mut self) -> Result<Vec<NetRoute>> {
        let get_table = self.require(Capability::GetIpForwardTable)?;
        let rows = self
            .platform
            .ip_forward_table(get_table)
            .map_err(ProbeError::from_os)?;

        Ok(rows
            .iter()
            .map(|row| {
                let mut flags = RouteFlags::UP;
                if row.destination.is_unspecified() && row.mask.is_unspecified() {
                    flags |= RouteFlags::GATEWAY;
                }
                NetRoute {
                    destination: row.destination,
                    mask: row.mask,
                    gateway: row.next_hop,
                    metric: row.metric,
                    flags,
                }
            })
            .collect())
    }
}
