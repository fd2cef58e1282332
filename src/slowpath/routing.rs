use anyhow::{anyhow, Result};

use crate::config::Config;

/// Routing table entry: destination network and next hop (0 = on-link).
#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    dest_ip: u32,
    dest_mask: u32,
    next_hop: u32,
}

/// One-hop routing table: the local network route plus configured routes.
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

fn prefix_len_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        !((1u64 << (32 - len)) - 1) as u32
    }
}

impl RoutingTable {
    pub fn new(cfg: &Config) -> Result<RoutingTable> {
        let mut entries = Vec::with_capacity(cfg.routes.len() + 1);

        // the local network first
        let mask = prefix_len_mask(cfg.ip_prefix);
        entries.push(RouteEntry {
            dest_ip: cfg.ip & mask,
            dest_mask: mask,
            next_hop: 0,
        });

        for r in &cfg.routes {
            let mask = prefix_len_mask(r.prefix);
            if r.ip & mask != r.ip {
                return Err(anyhow!(
                    "route {:#x}/{} has bits outside the mask",
                    r.ip,
                    r.prefix
                ));
            }
            entries.push(RouteEntry {
                dest_ip: r.ip,
                dest_mask: mask,
                next_hop: r.next_hop,
            });
        }

        Ok(RoutingTable { entries })
    }

    /// IP to actually resolve on the link for `ip`: either `ip` itself when
    /// on-link, or the next hop.
    pub fn resolve(&self, mut ip: u32) -> Option<u32> {
        loop {
            let rte = self
                .entries
                .iter()
                .find(|e| e.dest_ip == (ip & e.dest_mask))?;
            if rte.next_hop == 0 {
                return Some(ip);
            }
            ip = rte.next_hop;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRoute;

    #[test]
    fn on_link_resolves_to_itself() {
        let cfg = Config {
            ip: 0x0a000001,
            ip_prefix: 24,
            ..Default::default()
        };
        let rt = RoutingTable::new(&cfg).unwrap();
        assert_eq!(rt.resolve(0x0a000042), Some(0x0a000042));
        assert_eq!(rt.resolve(0x0b000001), None);
    }

    #[test]
    fn gateway_route() {
        let cfg = Config {
            ip: 0x0a000001,
            ip_prefix: 24,
            routes: vec![ConfigRoute {
                ip: 0xc0a80000,
                prefix: 16,
                next_hop: 0x0a0000fe,
            }],
            ..Default::default()
        };
        let rt = RoutingTable::new(&cfg).unwrap();
        // off-link destination resolves through the gateway
        assert_eq!(rt.resolve(0xc0a80123), Some(0x0a0000fe));
    }
}
