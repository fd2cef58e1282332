use std::net::Ipv4Addr;

use log::{debug, warn};

use super::{ArpEntry, SlowPath};
use crate::time::now_us64;
use crate::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, ARP_PACKET_LEN};

use super::timeouts::TimeoutType;

impl SlowPath {
    /// Seed the cache with our own address.
    pub(crate) fn arp_init(&mut self) {
        let ip = self.cfg.ip;
        let entry = ArpEntry {
            mac: self.eth_addr,
            resolved: true,
            waiters: Vec::new(),
            timeout_us: self.cfg.arp_to,
            to_key: None,
        };
        if self.arp.insert(ip, entry).is_err() {
            warn!("arp_init: cache full");
        }
        debug!(
            "host ip: {} mac: {}",
            Ipv4Addr::from(ip),
            self.eth_addr
        );
    }

    /// Resolve `ip` to a MAC address.
    ///
    /// Returns `Ok(Some(mac))` on a cache hit. On a miss, sends a request,
    /// arms the retry timeout, parks `waiter` (a connection id) for the
    /// asynchronous completion, and returns `Ok(None)`.
    pub(crate) fn arp_request(
        &mut self,
        ip: u32,
        waiter: usize,
    ) -> Result<Option<EthernetAddress>, ()> {
        if let Some(ae) = self.arp.get_mut(&ip) {
            if ae.resolved {
                debug!("arp: lookup hit ({})", Ipv4Addr::from(ip));
                return Ok(Some(ae.mac));
            }
            // request still pending, add to the wait list
            debug!("arp: request pending ({})", Ipv4Addr::from(ip));
            ae.waiters.push(waiter);
            return Ok(None);
        }

        let timeout = self.cfg.arp_to;
        let to_key = self
            .timeouts
            .arm(now_us64(), timeout, TimeoutType::ArpReq, ip as u64);
        let entry = ArpEntry {
            mac: EthernetAddress::default(),
            resolved: false,
            waiters: vec![waiter],
            timeout_us: timeout,
            to_key: Some(to_key),
        };
        if self.arp.insert(ip, entry).is_err() {
            warn!("arp_request: cache full");
            self.timeouts.disarm(to_key);
            return Err(());
        }

        if self.arp_request_tx(ip).is_err() {
            // the timeout takes care of retrying
            warn!("arp_request: sending request failed");
        }
        debug!("arp: request sent ({})", Ipv4Addr::from(ip));
        Ok(None)
    }

    /// Handle a received ARP packet: answer requests for our IP, absorb
    /// replies and release waiters.
    pub(crate) fn arp_packet(&mut self, pkt: &[u8]) {
        let repr = match ArpPacket::new_checked(pkt).and_then(|p| ArpRepr::parse(&p)) {
            Ok(r) => r,
            Err(_) => {
                warn!("arp_packet: invalid packet received");
                return;
            }
        };

        match repr.operation {
            ArpOperation::Request => {
                if u32::from(repr.target_protocol_addr) != self.cfg.ip {
                    return;
                }
                if self
                    .arp_response_tx(repr.source_hardware_addr, u32::from(repr.source_protocol_addr))
                    .is_err()
                {
                    warn!("arp_packet: sending response failed");
                }
            }
            ArpOperation::Reply => {
                let ip = u32::from(repr.source_protocol_addr);
                let Some(ae) = self.arp.get_mut(&ip) else {
                    debug!("arp_packet: reply has no entry ({})", Ipv4Addr::from(ip));
                    return;
                };

                if let Some(key) = ae.to_key.take() {
                    self.timeouts.disarm(key);
                }
                ae.mac = repr.source_hardware_addr;
                ae.resolved = true;
                let mac = ae.mac;
                let waiters = std::mem::take(&mut ae.waiters);

                for conn in waiters {
                    self.conn_mut(conn).remote_mac = mac;
                    self.async_q
                        .push_back(super::AsyncCompletion { conn, status: 0 });
                }
            }
            _ => warn!("arp_packet: unsupported operation"),
        }
    }

    /// Retry timer fired: double the timeout and resend, or fail all
    /// waiters once the ceiling is reached and drop the entry.
    pub(crate) fn arp_timeout(&mut self, ip: u32) {
        let arp_to_max = self.cfg.arp_to_max;
        let Some(ae) = self.arp.get_mut(&ip) else {
            warn!("arp_timeout: no entry for {}", Ipv4Addr::from(ip));
            return;
        };
        if ae.resolved {
            warn!("arp_timeout: entry already resolved");
            return;
        }
        ae.to_key = None;

        if ae.timeout_us * 2 >= arp_to_max {
            debug!("arp_timeout: request for {} timed out", Ipv4Addr::from(ip));
            let waiters = std::mem::take(&mut ae.waiters);
            self.arp.remove(&ip);
            for conn in waiters {
                self.async_q
                    .push_back(super::AsyncCompletion { conn, status: -1 });
            }
            return;
        }

        if self.arp_request_tx(ip).is_err() {
            warn!("arp_timeout: sending request failed");
        }

        let ae = self.arp.get_mut(&ip).unwrap();
        ae.timeout_us *= 2;
        let timeout = ae.timeout_us;
        ae.to_key = Some(
            self.timeouts
                .arm(now_us64(), timeout, TimeoutType::ArpReq, ip as u64),
        );
    }

    fn arp_request_tx(&mut self, dst_ip: u32) -> Result<(), ()> {
        self.arp_tx(
            ArpOperation::Request,
            EthernetAddress::BROADCAST,
            dst_ip,
        )
    }

    fn arp_response_tx(&mut self, dst_mac: EthernetAddress, dst_ip: u32) -> Result<(), ()> {
        self.arp_tx(ArpOperation::Reply, dst_mac, dst_ip)
    }

    fn arp_tx(
        &mut self,
        operation: ArpOperation,
        dst_mac: EthernetAddress,
        dst_ip: u32,
    ) -> Result<(), ()> {
        use crate::wire::{EthernetFrame, EthernetProtocol, ETHERNET_HEADER_LEN};

        let len = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;
        let mut frame_buf = [0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];

        let mut frame = EthernetFrame::new_unchecked(&mut frame_buf[..]);
        frame.set_dst_addr(dst_mac);
        frame.set_src_addr(self.eth_addr);
        frame.set_ethertype(EthernetProtocol::Arp);

        let repr = ArpRepr {
            operation,
            source_hardware_addr: self.eth_addr,
            source_protocol_addr: Ipv4Addr::from(self.cfg.ip),
            target_hardware_addr: if operation == ArpOperation::Reply {
                dst_mac
            } else {
                EthernetAddress::default()
            },
            target_protocol_addr: Ipv4Addr::from(dst_ip),
        };
        let mut packet = ArpPacket::new_unchecked(frame.payload_mut());
        repr.emit(&mut packet);

        self.nicif_tx(&frame_buf[..len], false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slowpath::tests_common::test_slowpath;

    fn arp_reply_frame(sp: &SlowPath, ip: u32, mac: EthernetAddress) -> Vec<u8> {
        use crate::wire::{EthernetFrame, EthernetProtocol, ETHERNET_HEADER_LEN};
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        frame.set_dst_addr(sp.eth_addr);
        frame.set_src_addr(mac);
        frame.set_ethertype(EthernetProtocol::Arp);
        let repr = ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: mac,
            source_protocol_addr: Ipv4Addr::from(ip),
            target_hardware_addr: sp.eth_addr,
            target_protocol_addr: Ipv4Addr::from(sp.cfg.ip),
        };
        repr.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
        buf[ETHERNET_HEADER_LEN..].to_vec()
    }

    #[test]
    fn own_ip_resolves_immediately() {
        let mut sp = test_slowpath(1);
        let ip = sp.cfg.ip;
        assert_eq!(sp.arp_request(ip, 0), Ok(Some(sp.eth_addr)));
    }

    #[test]
    fn miss_sends_request_and_reply_completes() {
        let mut sp = test_slowpath(1);
        let conn = sp.tcp_test_conn();
        let target = 0x0a000099;

        assert_eq!(sp.arp_request(target, conn), Ok(None));
        // a broadcast request went out through the admin tx queue
        assert!(sp.nic_tx_frames().iter().any(|f| {
            crate::wire::EthernetFrame::new_checked(&f[..])
                .map(|e| e.ethertype() == crate::wire::EthernetProtocol::Arp)
                .unwrap_or(false)
        }));

        let mac = EthernetAddress([0x02, 9, 9, 9, 9, 9]);
        let reply = arp_reply_frame(&sp, target, mac);
        sp.arp_packet(&reply);

        assert_eq!(sp.conn(conn).remote_mac, mac);
        assert_eq!(sp.async_q.len(), 1);
        assert_eq!(sp.async_q[0].status, 0);
        // subsequent lookups hit
        assert_eq!(sp.arp_request(target, conn), Ok(Some(mac)));
    }

    #[test]
    fn timeout_doubles_then_fails_waiters() {
        let mut sp = test_slowpath(1);
        let conn = sp.tcp_test_conn();
        let target = 0x0a0000aa;
        sp.cfg.arp_to = 100;
        sp.cfg.arp_to_max = 500;

        sp.arp_request(target, conn).unwrap();
        assert_eq!(sp.arp.get(&target).unwrap().timeout_us, 100);

        sp.arp_timeout(target);
        assert_eq!(sp.arp.get(&target).unwrap().timeout_us, 200);
        sp.arp_timeout(target);
        assert_eq!(sp.arp.get(&target).unwrap().timeout_us, 400);

        // 400 * 2 >= 500: give up, fail the waiter, drop the entry
        sp.arp_timeout(target);
        assert!(sp.arp.get(&target).is_none());
        assert_eq!(sp.async_q.back().unwrap().status, -1);
    }
}
