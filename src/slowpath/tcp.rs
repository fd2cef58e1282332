use std::collections::VecDeque;

use log::{debug, warn};
use rand::Rng;

use super::nicif::ConnParams;
use super::timeouts::TimeoutType;
use super::{
    AsyncCompletion, BacklogSlot, CcConn, ConnStatus, Connection, Listener, PortState, SlowPath,
};
use crate::time::now_us64;
use crate::wire::{
    emit_mss_option, emit_ts_option, emit_ws_option, tcpflags, EthernetAddress, EthernetFrame,
    EthernetProtocol, IpProtocol, Ipv4Packet, TcpOpts, TcpPacket, ETHERNET_HEADER_LEN,
    IPV4_HEADER_LEN, TCP_HEADER_LEN,
};

/// First ephemeral port.
pub const PORT_FIRST_EPH: u16 = 8192;
/// Maximum listeners sharing a port through reuseport.
const LISTEN_MULTI_MAX: usize = 32;
/// MSS advertised in handshakes.
const HANDSHAKE_MSS: u16 = 1460;
/// Longest SYN frame kept in a backlog slot.
const BACKLOG_BUF_LEN: usize = 126;
/// Linger before a closed connection's state is released [us].
const CLOSE_LINGER_US: u32 = 10_000;

impl SlowPath {
    /// Drain completed asynchronous operations (ARP resolutions, flow
    /// registrations) and advance their handshakes.
    pub(crate) fn tcp_poll(&mut self) {
        while let Some(AsyncCompletion { conn, status }) = self.async_q.pop_front() {
            if self.conns.get(conn).map_or(true, |c| c.is_none()) {
                continue;
            }
            match self.conn(conn).status {
                ConnStatus::ArpPending => {
                    if status != 0 {
                        self.conn_failed(conn, status);
                    } else if self.conn_arp_done(conn).is_err() {
                        self.conn_failed(conn, -1);
                    }
                }
                ConnStatus::RegSynack => {
                    if status != 0 {
                        self.conn_failed(conn, status);
                    } else {
                        self.conn_reg_synack(conn);
                    }
                }
                other => warn!("tcp_poll: unexpected conn state {other:?}"),
            }
        }
    }

    /// Open a connection on behalf of an application. Completion arrives
    /// asynchronously through `appif_conn_opened`.
    pub(crate) fn tcp_open(
        &mut self,
        app_id: u16,
        ctx_id: usize,
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
        db_id: u16,
    ) -> Result<usize, i32> {
        let (rx_handle, tx_handle, rx_off, tx_off) = self.conn_alloc_buffers().ok_or(-1)?;

        let Some(local_port) = self.port_alloc() else {
            warn!("tcp_open: port allocation failed");
            self.pktmem.free(rx_handle);
            self.pktmem.free(tx_handle);
            return Err(-1);
        };

        let conn = Connection {
            opaque,
            app_id,
            ctx_id,
            db_id,
            rx_handle: Some(rx_handle),
            tx_handle: Some(tx_handle),
            rx_off,
            tx_off,
            rx_len: self.cfg.tcp_rxbuf_len,
            tx_len: self.cfg.tcp_txbuf_len,
            remote_mac: EthernetAddress::default(),
            remote_ip,
            local_ip: self.cfg.ip,
            remote_port,
            local_port,
            status: ConnStatus::ArpPending,
            remote_seq: 0,
            local_seq: 0,
            syn_ts: 0,
            tx_window_scale: 0,
            rx_window_scale: self.cfg.tcp_window_scale,
            timeout_us: 0,
            to_key: None,
            to_attempts: 0,
            cc: CcConn::new(&self.cfg, self.cur_ts),
            ecn: false,
            flow_id: 0,
            fn_core: 0,
            flow_group: 0,
            comp_status: 0,
        };
        let id = self.conn_alloc_slot(conn);
        self.ports[local_port as usize] = PortState::Conn(id);
        self.conn_register(id);

        // resolve the next hop, possibly asynchronously
        let Some(hop_ip) = self.routing.resolve(remote_ip) else {
            warn!("tcp_open: routing failed");
            self.conn_failed(id, -1);
            return Err(-1);
        };
        match self.arp_request(hop_ip, id) {
            Ok(Some(mac)) => {
                self.conn_mut(id).remote_mac = mac;
                if self.conn_arp_done(id).is_err() {
                    self.conn_failed(id, -1);
                    return Err(-1);
                }
            }
            Ok(None) => debug!("tcp_open: arp resolution pending"),
            Err(()) => {
                self.conn_failed(id, -1);
                return Err(-1);
            }
        }
        Ok(id)
    }

    /// Open a listener on `local_port`.
    pub(crate) fn tcp_listen(
        &mut self,
        app_id: u16,
        ctx_id: usize,
        opaque: u64,
        local_port: u16,
        backlog: u32,
        reuseport: bool,
    ) -> Result<usize, i32> {
        match &self.ports[local_port as usize] {
            PortState::Unused => (),
            PortState::ListenMulti(ls) if reuseport => {
                if ls.len() >= LISTEN_MULTI_MAX {
                    warn!("tcp_listen: no more listeners supported on port");
                    return Err(-1);
                }
            }
            _ => {
                warn!("tcp_listen: port {local_port} not available");
                return Err(-1);
            }
        }

        let lst = Listener {
            opaque,
            app_id,
            ctx_id,
            port: local_port,
            backlog: (0..backlog).map(|_| None).collect(),
            backlog_pos: 0,
            backlog_used: 0,
            wait_conns: VecDeque::new(),
            ecn: false,
        };
        let lid = match self.listeners.iter().position(|l| l.is_none()) {
            Some(i) => {
                self.listeners[i] = Some(lst);
                i
            }
            None => {
                self.listeners.push(Some(lst));
                self.listeners.len() - 1
            }
        };

        match &mut self.ports[local_port as usize] {
            p @ PortState::Unused => {
                *p = if reuseport {
                    PortState::ListenMulti(vec![lid])
                } else {
                    PortState::Listen(lid)
                };
            }
            PortState::ListenMulti(ls) => ls.push(lid),
            _ => unreachable!(),
        }

        Ok(lid)
    }

    /// Queue an accept: pairs with a backlog SYN immediately if one waits.
    pub(crate) fn tcp_accept(
        &mut self,
        app_id: u16,
        ctx_id: usize,
        opaque: u64,
        listener_id: usize,
        db_id: u16,
    ) -> Result<(), i32> {
        let (rx_handle, tx_handle, rx_off, tx_off) = self.conn_alloc_buffers().ok_or(-1)?;

        let Some(Some(lst)) = self.listeners.get(listener_id) else {
            self.pktmem.free(rx_handle);
            self.pktmem.free(tx_handle);
            return Err(-1);
        };
        let local_port = lst.port;
        let ecn = lst.ecn;

        let conn = Connection {
            opaque,
            app_id,
            ctx_id,
            db_id,
            rx_handle: Some(rx_handle),
            tx_handle: Some(tx_handle),
            rx_off,
            tx_off,
            rx_len: self.cfg.tcp_rxbuf_len,
            tx_len: self.cfg.tcp_txbuf_len,
            remote_mac: EthernetAddress::default(),
            remote_ip: 0,
            local_ip: self.cfg.ip,
            remote_port: 0,
            local_port,
            status: ConnStatus::SynWait,
            remote_seq: 0,
            local_seq: 0,
            syn_ts: 0,
            tx_window_scale: 0,
            rx_window_scale: self.cfg.tcp_window_scale,
            timeout_us: 0,
            to_key: None,
            to_attempts: 0,
            cc: CcConn::new(&self.cfg, self.cur_ts),
            ecn,
            flow_id: 0,
            fn_core: 0,
            flow_group: 0,
            comp_status: 0,
        };
        let id = self.conn_alloc_slot(conn);

        let lst = self.listeners[listener_id].as_mut().unwrap();
        lst.wait_conns.push_back(id);
        if lst.backlog_used > 0 {
            self.listener_accept(listener_id);
        }
        Ok(())
    }

    /// RX processing for a TCP packet the fast path handed up.
    pub(crate) fn tcp_packet(&mut self, pkt: &[u8], fn_core: u16, flow_group: u16) {
        let Some((hdr, opts)) = parse_tcp(pkt) else {
            warn!("tcp_packet: parsing failed");
            return;
        };
        if hdr.dst_ip != self.cfg.ip {
            warn!("tcp_packet: unexpected destination IP");
            return;
        }

        if let Some(id) = self.conn_lookup(hdr.src_ip, hdr.dst_port, hdr.src_port) {
            self.conn_packet(id, &hdr, &opts, fn_core, flow_group, pkt);
        } else if let Some(lid) = self.listener_lookup(hdr.src_ip, hdr.src_port, hdr.dst_port) {
            self.listener_packet(lid, &hdr, pkt, fn_core, flow_group);
        } else if hdr.flags & tcpflags::RST == 0 && self.cfg.kni_name.is_none() {
            self.send_reset(&hdr, &opts);
        }
    }

    /// Close an open connection: take it off the fast path and linger.
    pub(crate) fn tcp_close(&mut self, id: usize) -> Result<(), i32> {
        if self.conn(id).status != ConnStatus::Open {
            warn!("tcp_close: connection not open");
            return Err(-1);
        }

        let flow_id = self.conn(id).flow_id;
        let (tx_seq, rx_seq, tx_closed, rx_closed) = self.nicif_connection_disable(flow_id);
        {
            let c = self.conn_mut(id);
            c.local_seq = tx_seq;
            c.remote_seq = rx_seq;
        }

        if !tx_closed || !rx_closed {
            self.send_control(id, tcpflags::RST, None, None, None);
        }

        self.cc_conn_remove(id);
        self.conn_mut(id).status = ConnStatus::Closed;

        let key = self
            .timeouts
            .arm(now_us64(), CLOSE_LINGER_US, TimeoutType::TcpClosed, id as u64);
        self.conn_mut(id).to_key = Some(key);
        Ok(())
    }

    pub(crate) fn tcp_timeout(&mut self, tt: TimeoutType, id: usize) {
        if self.conns.get(id).map_or(true, |c| c.is_none()) {
            warn!("tcp_timeout: stale connection");
            return;
        }
        self.conn_mut(id).to_key = None;

        match tt {
            TimeoutType::TcpClosed => self.conn_close_timeout(id),
            TimeoutType::TcpHandshake => {
                if self.conn(id).status != ConnStatus::SynSent {
                    warn!(
                        "tcp_timeout: unexpected connection state {:?}",
                        self.conn(id).status
                    );
                    return;
                }

                let retries = self.cfg.tcp_handshake_retries;
                let c = self.conn_mut(id);
                c.to_attempts += 1;
                if c.to_attempts > retries {
                    warn!("tcp_timeout: giving up after too many retries");
                    self.conn_failed(id, -1);
                    return;
                }

                c.timeout_us *= 2;
                self.conn_timeout_arm(id);
                let ws = self.conn(id).rx_window_scale;
                self.send_control(
                    id,
                    tcpflags::SYN | tcpflags::ECE | tcpflags::CWR,
                    Some(0),
                    Some(HANDSHAKE_MSS),
                    ws_opt(ws),
                );
            }
            _ => warn!("tcp_timeout: unexpected timeout type"),
        }
    }

    /*************************************************************************/
    /* Connection state machine internals */

    fn conn_packet(
        &mut self,
        id: usize,
        hdr: &TcpHdr,
        opts: &TcpOpts,
        fn_core: u16,
        flow_group: u16,
        _pkt: &[u8],
    ) {
        let status = self.conn(id).status;
        match status {
            ConnStatus::SynSent => {
                {
                    let c = self.conn_mut(id);
                    c.fn_core = fn_core;
                    c.flow_group = flow_group;
                }
                if self.conn_syn_sent_packet(id, hdr, opts).is_err() {
                    self.conn_failed(id, -1);
                }
            }
            ConnStatus::Open if hdr.flags & !(tcpflags::ECE | tcpflags::CWR) == tcpflags::SYN => {
                // retransmitted SYN for a lost SYN-ACK
                if opts.ts.is_none() {
                    warn!("conn_packet: retransmitted SYN without timestamp option");
                    self.conn_failed(id, -1);
                    return;
                }
                let ecn_fl = if self.conn(id).ecn { tcpflags::ECE } else { 0 };
                let (syn_ts, ws) = {
                    let c = self.conn(id);
                    (opts.ts.unwrap().ts_val, c.rx_window_scale)
                };
                self.conn_mut(id).syn_ts = syn_ts;
                self.send_control(
                    id,
                    tcpflags::SYN | tcpflags::ACK | ecn_fl,
                    Some(syn_ts),
                    Some(HANDSHAKE_MSS),
                    ws_opt(ws),
                );
            }
            ConnStatus::Open if hdr.flags & tcpflags::SYN != 0 => {
                // stray retransmitted SYN-ACK, ignore
            }
            ConnStatus::Closed if hdr.flags & tcpflags::FIN != 0 => {
                // the peer retransmits its FIN into our linger window
                self.send_control(id, tcpflags::ACK, Some(0), None, None);
            }
            other => warn!("conn_packet: unexpected connection state {other:?}"),
        }
    }

    /// ARP resolved: move to SYN_SENT and fire the first SYN.
    pub(crate) fn conn_arp_done(&mut self, id: usize) -> Result<(), ()> {
        let handshake_to = self.cfg.tcp_handshake_to;
        {
            let c = self.conn_mut(id);
            c.status = ConnStatus::SynSent;
            c.to_attempts = 0;
            c.timeout_us = handshake_to;
        }
        self.conn_timeout_arm(id);

        let ws = self.conn(id).rx_window_scale;
        self.send_control(
            id,
            tcpflags::SYN | tcpflags::ECE | tcpflags::CWR,
            Some(0),
            Some(HANDSHAKE_MSS),
            ws_opt(ws),
        );
        debug!("conn {id}: SYN sent");
        Ok(())
    }

    fn conn_syn_sent_packet(&mut self, id: usize, hdr: &TcpHdr, opts: &TcpOpts) -> Result<(), ()> {
        self.conn_timeout_disarm(id);

        if hdr.flags & (tcpflags::SYN | tcpflags::ACK) != (tcpflags::SYN | tcpflags::ACK) {
            warn!("conn_syn_sent_packet: unexpected flags {:x}", hdr.flags);
            return Err(());
        }
        let Some(ts) = opts.ts else {
            warn!("conn_syn_sent_packet: no timestamp option received");
            return Err(());
        };

        let ecn = hdr.flags & (tcpflags::ECE | tcpflags::CWR) == tcpflags::ECE;
        {
            let cfg = self.cfg.clone();
            let cur_ts = self.cur_ts;
            let c = self.conn_mut(id);
            c.remote_seq = hdr.seq.wrapping_add(1);
            c.local_seq = hdr.ack;
            c.syn_ts = ts.ts_val;
            c.tx_window_scale = opts.wscale.unwrap_or(0);
            if ecn {
                c.ecn = true;
            }
            c.cc = CcConn::new(&cfg, cur_ts);
        }

        let flow_id = self.register_flow(id)?;
        {
            let c = self.conn_mut(id);
            c.flow_id = flow_id;
            c.status = ConnStatus::Open;
        }
        self.cc_conn_register(id);

        let syn_ts = self.conn(id).syn_ts;
        self.send_control(id, tcpflags::ACK, Some(syn_ts), None, None);
        self.appif_conn_opened(id, 0);
        debug!("conn {id}: opened");
        Ok(())
    }

    /// Flow registration done for an accepted connection: answer SYN-ACK.
    fn conn_reg_synack(&mut self, id: usize) {
        self.conn_mut(id).status = ConnStatus::Open;
        self.cc_conn_register(id);

        let (ecn_fl, syn_ts, ws) = {
            let c = self.conn(id);
            (
                if c.ecn { tcpflags::ECE } else { 0 },
                c.syn_ts,
                c.rx_window_scale,
            )
        };
        self.send_control(
            id,
            tcpflags::SYN | tcpflags::ACK | ecn_fl,
            Some(syn_ts),
            Some(HANDSHAKE_MSS),
            ws_opt(ws),
        );
        self.appif_accept_conn(id, 0);
    }

    /// Register the connection's flow with the fast path.
    fn register_flow(&mut self, id: usize) -> Result<u32, ()> {
        let p = {
            let c = self.conn(id);
            ConnParams {
                db_id: c.db_id,
                vm_id: 0,
                mac_remote: c.remote_mac,
                ip_local: c.local_ip,
                port_local: c.local_port,
                ip_remote: c.remote_ip,
                port_remote: c.remote_port,
                rx_base: c.rx_off,
                rx_len: c.rx_len,
                tx_base: c.tx_off,
                tx_len: c.tx_len,
                remote_seq: c.remote_seq,
                local_seq: if c.status == ConnStatus::RegSynack {
                    // our SYN-ACK consumes one sequence number
                    c.local_seq.wrapping_add(1)
                } else {
                    c.local_seq
                },
                app_opaque: c.opaque,
                ecn: c.ecn,
                rate: c.cc.rate,
                rx_window_scale: c.rx_window_scale,
                tx_window_scale: c.tx_window_scale,
                flow_group: c.flow_group,
            }
        };
        self.nicif_connection_add(&p)
    }

    fn conn_failed(&mut self, id: usize, status: i32) {
        self.conn_unregister(id);
        if self.conn(id).to_key.is_some() {
            self.conn_timeout_disarm(id);
        }
        self.conn_mut(id).status = ConnStatus::Failed;
        self.appif_conn_opened(id, status);
    }

    fn conn_timeout_arm(&mut self, id: usize) {
        debug_assert!(self.conn(id).to_key.is_none());
        let base = self.conn(id).timeout_us.max(1);
        // +/- 50% jitter against synchronized retries
        let to = base / 2 + self.rng.gen_range(0..base);
        let key = self
            .timeouts
            .arm(now_us64(), to, TimeoutType::TcpHandshake, id as u64);
        self.conn_mut(id).to_key = Some(key);
    }

    fn conn_timeout_disarm(&mut self, id: usize) {
        if let Some(key) = self.conn_mut(id).to_key.take() {
            self.timeouts.disarm(key);
        }
    }

    fn conn_close_timeout(&mut self, id: usize) {
        let local_port = self.conn(id).local_port;
        if matches!(self.ports[local_port as usize], PortState::Conn(_)) {
            self.ports[local_port as usize] = PortState::Unused;
        }
        self.conn_unregister(id);

        let flow_id = self.conn(id).flow_id;
        let c = self.conn_mut(id);
        let rx = c.rx_handle.take();
        let tx = c.tx_handle.take();
        if let Some(h) = rx {
            self.pktmem.free(h);
        }
        if let Some(h) = tx {
            self.pktmem.free(h);
        }
        self.nicif_connection_free(flow_id);

        self.appif_conn_closed(id, 0);
        self.conn_free_slot(id);
    }

    fn conn_alloc_buffers(&mut self) -> Option<(crate::shm::PktMemHandle, crate::shm::PktMemHandle, u64, u64)> {
        let rx = self.pktmem.alloc(self.cfg.tcp_rxbuf_len as u64).ok()?;
        let tx = match self.pktmem.alloc(self.cfg.tcp_txbuf_len as u64) {
            Ok(t) => t,
            Err(_) => {
                self.pktmem.free(rx);
                return None;
            }
        };
        let (rx_off, tx_off) = (rx.base(), tx.base());
        Some((rx, tx, rx_off, tx_off))
    }

    fn conn_register(&mut self, id: usize) {
        let c = self.conn(id);
        self.conn_ht
            .insert((c.remote_ip, c.local_port, c.remote_port), id);
    }

    fn conn_unregister(&mut self, id: usize) {
        let c = self.conn(id);
        let key = (c.remote_ip, c.local_port, c.remote_port);
        if self.conn_ht.get(&key) == Some(&id) {
            self.conn_ht.remove(&key);
        }
    }

    fn conn_lookup(&self, remote_ip: u32, local_port: u16, remote_port: u16) -> Option<usize> {
        self.conn_ht
            .get(&(remote_ip, local_port, remote_port))
            .copied()
    }

    /// Pick an unused ephemeral port starting from the rotating hint.
    fn port_alloc(&mut self) -> Option<u16> {
        let start = self.port_eph_hint.max(PORT_FIRST_EPH);
        let mut p = start;
        loop {
            let next = if p.checked_add(1).map_or(true, |n| n < PORT_FIRST_EPH) {
                PORT_FIRST_EPH
            } else {
                p + 1
            };
            if matches!(self.ports[p as usize], PortState::Unused) {
                self.port_eph_hint = next;
                return Some(p);
            }
            p = next;
            if p == start {
                return None;
            }
        }
    }

    /*************************************************************************/
    /* Listeners */

    fn listener_lookup(&mut self, remote_ip: u32, remote_port: u16, local_port: u16) -> Option<usize> {
        match &self.ports[local_port as usize] {
            PortState::Listen(l) => Some(*l),
            PortState::ListenMulti(ls) => {
                // hash the remote tuple onto one of the listeners
                let h = hash_64_to_32(
                    ((remote_ip as u64) << 32)
                        | ((remote_port as u64) << 16)
                        | local_port as u64,
                );
                Some(ls[h as usize % ls.len()])
            }
            _ => None,
        }
    }

    fn listener_packet(
        &mut self,
        lid: usize,
        hdr: &TcpHdr,
        pkt: &[u8],
        fn_core: u16,
        flow_group: u16,
    ) {
        if hdr.flags & !(tcpflags::ECE | tcpflags::CWR) != tcpflags::SYN {
            warn!("listener_packet: not a SYN (flags {:x})", hdr.flags);
            let opts = parse_tcp(pkt).map(|(_, o)| o).unwrap_or_default();
            self.send_reset(hdr, &opts);
            return;
        }

        if pkt.len() > BACKLOG_BUF_LEN {
            warn!("listener_packet: SYN larger than backlog buffer, dropping");
            return;
        }

        let lst = self.listeners[lid].as_mut().unwrap();

        // duplicate SYN already parked?
        for n in 0..lst.backlog_used {
            let bp = (lst.backlog_pos + n) % lst.backlog.len();
            if let Some(slot) = &lst.backlog[bp] {
                if let Some((shdr, _)) = parse_tcp(&slot.buf) {
                    if shdr.src_ip == hdr.src_ip && shdr.src_port == hdr.src_port {
                        return;
                    }
                }
            }
        }

        if lst.backlog_used == lst.backlog.len() {
            warn!("listener_packet: backlog queue full");
            return;
        }

        let bp = (lst.backlog_pos + lst.backlog_used) % lst.backlog.len();
        lst.backlog[bp] = Some(BacklogSlot {
            buf: pkt.to_vec(),
            core: fn_core,
            flow_group,
        });
        lst.backlog_used += 1;

        let (opaque, has_waiting) = (lst.opaque, !lst.wait_conns.is_empty());
        let (app_id, ctx_id) = (lst.app_id, lst.ctx_id);
        self.appif_listen_newconn(app_id, ctx_id, opaque, hdr.src_ip, hdr.src_port);

        if has_waiting {
            self.listener_accept(lid);
        }
    }

    /// Pair the backlog head with the first waiting accept.
    fn listener_accept(&mut self, lid: usize) {
        let (slot, conn_id) = {
            let lst = self.listeners[lid].as_mut().unwrap();
            debug_assert!(lst.backlog_used > 0);
            let Some(conn_id) = lst.wait_conns.pop_front() else {
                return;
            };
            let bp = lst.backlog_pos;
            let slot = lst.backlog[bp].take();
            lst.backlog_pos = (bp + 1) % lst.backlog.len();
            lst.backlog_used -= 1;
            (slot, conn_id)
        };
        let Some(slot) = slot else {
            warn!("listener_accept: empty backlog slot");
            return;
        };

        let Some((hdr, opts)) = parse_tcp(&slot.buf) else {
            warn!("listener_accept: parsing backlog SYN failed");
            return;
        };
        let Some(ts) = opts.ts else {
            warn!("listener_accept: SYN without timestamp option");
            return;
        };

        let frame = EthernetFrame::new_unchecked(&slot.buf[..]);
        let ecn_offered =
            hdr.flags & (tcpflags::ECE | tcpflags::CWR) == (tcpflags::ECE | tcpflags::CWR);

        {
            let cfg = self.cfg.clone();
            let cur_ts = self.cur_ts;
            let c = self.conn_mut(conn_id);
            c.fn_core = slot.core;
            c.flow_group = slot.flow_group;
            c.remote_mac = frame.src_addr();
            c.remote_ip = hdr.src_ip;
            c.remote_port = hdr.src_port;
            c.remote_seq = hdr.seq.wrapping_add(1);
            c.local_seq = 1;
            c.syn_ts = ts.ts_val;
            c.tx_window_scale = opts.wscale.unwrap_or(0);
            if ecn_offered {
                c.ecn = true;
            }
            c.cc = CcConn::new(&cfg, cur_ts);
            c.status = ConnStatus::RegSynack;
        }

        match self.register_flow(conn_id) {
            Ok(flow_id) => {
                self.conn_mut(conn_id).flow_id = flow_id;
                self.conn_register(conn_id);
                self.async_q.push_back(AsyncCompletion {
                    conn: conn_id,
                    status: 0,
                });
            }
            Err(()) => warn!("listener_accept: flow registration failed"),
        }
    }

    /*************************************************************************/
    /* Control segment emission */

    pub(crate) fn send_control(
        &mut self,
        id: usize,
        flags: u16,
        ts_echo: Option<u32>,
        mss: Option<u16>,
        ws: Option<u8>,
    ) {
        let (mac, rip, rp, lp, lseq, rseq) = {
            let c = self.conn(id);
            (
                c.remote_mac,
                c.remote_ip,
                c.remote_port,
                c.local_port,
                c.local_seq,
                c.remote_seq,
            )
        };
        self.send_control_raw(mac, rip, rp, lp, lseq, rseq, flags, ts_echo, mss, ws);
    }

    #[allow(clippy::too_many_arguments)]
    fn send_control_raw(
        &mut self,
        remote_mac: EthernetAddress,
        remote_ip: u32,
        remote_port: u16,
        local_port: u16,
        local_seq: u32,
        remote_seq: u32,
        flags: u16,
        ts_echo: Option<u32>,
        mss: Option<u16>,
        ws: Option<u8>,
    ) {
        // options area, padded to 4 bytes
        let mut opt_buf = [0u8; 24];
        let mut optlen = 0;
        if let Some(mss) = mss {
            optlen += emit_mss_option(&mut opt_buf[optlen..], mss);
        }
        if let Some(ws) = ws {
            optlen += emit_ws_option(&mut opt_buf[optlen..], ws);
        }
        if let Some(echo) = ts_echo {
            // ts_val is injected by the fast path on transmit
            optlen += emit_ts_option(&mut opt_buf[optlen..], 0, echo);
        }
        optlen = (optlen + 3) & !3;

        let tcp_hdr = TCP_HEADER_LEN + optlen;
        let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_hdr;
        let mut buf = [0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + 24];
        let frame_bytes = &mut buf[..total];

        let mut frame = EthernetFrame::new_unchecked(&mut *frame_bytes);
        frame.set_dst_addr(remote_mac);
        frame.set_src_addr(self.eth_addr);
        frame.set_ethertype(EthernetProtocol::Ipv4);

        let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
        ip.set_version(4);
        ip.set_header_len(IPV4_HEADER_LEN as u8);
        ip.set_dscp_ecn(0);
        ip.set_total_len((IPV4_HEADER_LEN + tcp_hdr) as u16);
        ip.set_ident(3);
        ip.set_flags_frag_offset(0);
        ip.set_hop_limit(0xff);
        ip.set_next_header(IpProtocol::Tcp);
        ip.set_src_addr(self.cfg.ip.into());
        ip.set_dst_addr(remote_ip.into());

        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.set_src_port(local_port);
        tcp.set_dst_port(remote_port);
        tcp.set_seq_number(local_seq);
        tcp.set_ack_number(remote_seq);
        tcp.set_header_len_flags(tcp_hdr as u8, flags);
        tcp.set_window_len(11_680);
        tcp.set_urgent_at(0);
        tcp.options_mut().copy_from_slice(&opt_buf[..optlen]);

        tcp.fill_checksum(self.cfg.ip.into(), remote_ip.into());
        ip.fill_checksum();

        if self.nicif_tx(frame_bytes, ts_echo.is_none()).is_err() {
            warn!("send_control: admin tx queue full");
        }
    }

    fn send_reset(&mut self, hdr: &TcpHdr, opts: &TcpOpts) {
        let ts_echo = opts.ts.map(|t| t.ts_val);
        self.send_control_raw(
            hdr.src_mac,
            hdr.src_ip,
            hdr.src_port,
            hdr.dst_port,
            hdr.ack,
            hdr.seq.wrapping_add(1),
            tcpflags::RST | tcpflags::ACK,
            ts_echo,
            None,
            None,
        );
    }
}

/// The slice of a TCP frame the slow path cares about.
pub(crate) struct TcpHdr {
    pub src_mac: EthernetAddress,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u16,
}

pub(crate) fn parse_tcp(pkt: &[u8]) -> Option<(TcpHdr, TcpOpts)> {
    let frame = EthernetFrame::new_checked(pkt).ok()?;
    if frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    let opts = tcp.options().ok()?;
    Some((
        TcpHdr {
            src_mac: frame.src_addr(),
            src_ip: ip.src_addr().into(),
            dst_ip: ip.dst_addr().into(),
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            seq: tcp.seq_number(),
            ack: tcp.ack_number(),
            flags: tcp.flags(),
        },
        opts,
    ))
}

fn ws_opt(scale: u8) -> Option<u8> {
    (scale != 0).then_some(scale)
}

/// Hash 64 bits down to 32 for reuseport listener selection.
fn hash_64_to_32(mut key: u64) -> u32 {
    key = (!key).wrapping_add(key << 18);
    key ^= key >> 31;
    key = key.wrapping_mul(21);
    key ^= key >> 11;
    key = key.wrapping_add(key << 6);
    key ^= key >> 22;
    key as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastpath::flowht;
    use crate::slowpath::tests_common::test_slowpath;
    use crate::slowpath::ConnStatus;
    use crate::wire::{ArpOperation, ArpPacket, ArpRepr, TS_OPT_LEN_PADDED};

    fn build_tcp_frame(
        src_mac: EthernetAddress,
        src_ip: u32,
        dst_ip: u32,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u16,
        with_ws: bool,
    ) -> Vec<u8> {
        let mut opt_buf = [0u8; 24];
        let mut optlen = 0;
        optlen += emit_mss_option(&mut opt_buf[optlen..], 1460);
        if with_ws {
            optlen += emit_ws_option(&mut opt_buf[optlen..], 7);
        }
        optlen += emit_ts_option(&mut opt_buf[optlen..], 4242, 0);
        optlen = (optlen + 3) & !3;

        let tcp_hdr = TCP_HEADER_LEN + optlen;
        let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_hdr;
        let mut buf = vec![0u8; total];

        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        frame.set_dst_addr(EthernetAddress([0x02, 0, 0, 0, 0, 1]));
        frame.set_src_addr(src_mac);
        frame.set_ethertype(EthernetProtocol::Ipv4);

        let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
        ip.set_version(4);
        ip.set_header_len(IPV4_HEADER_LEN as u8);
        ip.set_total_len((IPV4_HEADER_LEN + tcp_hdr) as u16);
        ip.set_hop_limit(64);
        ip.set_next_header(IpProtocol::Tcp);
        ip.set_src_addr(src_ip.into());
        ip.set_dst_addr(dst_ip.into());

        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.set_src_port(src_port);
        tcp.set_dst_port(dst_port);
        tcp.set_seq_number(seq);
        tcp.set_ack_number(ack);
        tcp.set_header_len_flags(tcp_hdr as u8, flags);
        tcp.set_window_len(8192);
        tcp.set_urgent_at(0);
        tcp.options_mut().copy_from_slice(&opt_buf[..optlen]);

        ip.fill_checksum();
        buf
    }

    fn tx_tcp_frames(sp: &mut SlowPath) -> Vec<Vec<u8>> {
        sp.nic_tx_frames()
            .into_iter()
            .filter(|f| parse_tcp(f).is_some())
            .collect()
    }

    const PEER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 2]);
    const PEER_IP: u32 = 0x0a000002;

    #[test]
    fn open_handshake_completes() {
        let mut sp = test_slowpath(1);
        let id = sp
            .tcp_open(0, 0, 0x1111, PEER_IP, 80, 1)
            .expect("tcp_open");
        assert_eq!(sp.conn(id).status, ConnStatus::ArpPending);
        let local_port = sp.conn(id).local_port;
        assert!(local_port >= PORT_FIRST_EPH);

        // resolve ARP
        let mut arp = vec![0u8; crate::wire::ARP_PACKET_LEN];
        ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: PEER_MAC,
            source_protocol_addr: PEER_IP.into(),
            target_hardware_addr: sp.eth_addr,
            target_protocol_addr: sp.cfg.ip.into(),
        }
        .emit(&mut ArpPacket::new_unchecked(&mut arp[..]));
        sp.arp_packet(&arp);
        sp.tcp_poll();
        assert_eq!(sp.conn(id).status, ConnStatus::SynSent);

        // the SYN went out with MSS, WS deferred (scale 0), TS options
        let syns = tx_tcp_frames(&mut sp);
        let (hdr, opts) = parse_tcp(syns.last().unwrap()).unwrap();
        assert_eq!(
            hdr.flags,
            tcpflags::SYN | tcpflags::ECE | tcpflags::CWR
        );
        assert_eq!(hdr.dst_port, 80);
        assert_eq!(opts.mss, Some(HANDSHAKE_MSS));
        assert!(opts.ts.is_some());

        // SYN-ACK from the peer opens the connection and registers the flow
        let synack = build_tcp_frame(
            PEER_MAC,
            PEER_IP,
            sp.cfg.ip,
            80,
            local_port,
            999,
            hdr.seq.wrapping_add(1),
            tcpflags::SYN | tcpflags::ACK,
            true,
        );
        sp.tcp_packet(&synack, 0, 3);

        let c = sp.conn(id);
        assert_eq!(c.status, ConnStatus::Open);
        assert_eq!(c.remote_seq, 1000);
        assert_eq!(c.tx_window_scale, 7);
        assert_eq!(c.flow_group, 3);
        let flow_id = c.flow_id;

        assert_eq!(
            flowht::lookup(&sp.pl.flowht, &sp.pl.flowst, sp.cfg.ip, local_port, PEER_IP, 80),
            Some(flow_id)
        );
        {
            let fs = sp.pl.flowst[flow_id as usize].lock();
            assert_eq!(fs.rx_next_seq, 1000);
            assert_eq!(fs.tx_window_scale, 7);
        }

        // final handshake ACK went out
        let acks = tx_tcp_frames(&mut sp);
        let (hdr, _) = parse_tcp(acks.last().unwrap()).unwrap();
        assert_eq!(hdr.flags, tcpflags::ACK);
        assert_eq!(hdr.ack, 1000);
    }

    #[test]
    fn handshake_timeout_backs_off_then_fails() {
        let mut sp = test_slowpath(1);
        sp.cfg.tcp_handshake_retries = 2;
        let id = sp.tcp_open(0, 0, 1, PEER_IP, 80, 1).unwrap();

        // resolve arp inline
        let mut arp = vec![0u8; crate::wire::ARP_PACKET_LEN];
        ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: PEER_MAC,
            source_protocol_addr: PEER_IP.into(),
            target_hardware_addr: sp.eth_addr,
            target_protocol_addr: sp.cfg.ip.into(),
        }
        .emit(&mut ArpPacket::new_unchecked(&mut arp[..]));
        sp.arp_packet(&arp);
        sp.tcp_poll();
        let to0 = sp.conn(id).timeout_us;

        sp.tcp_timeout(TimeoutType::TcpHandshake, id);
        assert_eq!(sp.conn(id).status, ConnStatus::SynSent);
        assert_eq!(sp.conn(id).timeout_us, to0 * 2);

        sp.tcp_timeout(TimeoutType::TcpHandshake, id);
        assert_eq!(sp.conn(id).timeout_us, to0 * 4);

        // third expiry exceeds the retry budget
        sp.tcp_timeout(TimeoutType::TcpHandshake, id);
        assert_eq!(sp.conn(id).status, ConnStatus::Failed);
    }

    #[test]
    fn listener_backlog_and_accept() {
        let mut sp = test_slowpath(1);
        let lid = sp.tcp_listen(0, 0, 0x22, 8080, 4, false).unwrap();

        // SYN arrives before any accept: parked in the backlog
        let syn = build_tcp_frame(
            PEER_MAC,
            PEER_IP,
            sp.cfg.ip,
            5555,
            8080,
            100,
            0,
            tcpflags::SYN,
            false,
        );
        sp.tcp_packet(&syn, 0, 9);
        assert_eq!(sp.listeners[lid].as_ref().unwrap().backlog_used, 1);

        // duplicate SYN is not parked twice
        sp.tcp_packet(&syn, 0, 9);
        assert_eq!(sp.listeners[lid].as_ref().unwrap().backlog_used, 1);

        // accept pairs with the parked SYN
        sp.tcp_accept(0, 0, 0x33, lid, 2).unwrap();
        assert_eq!(sp.listeners[lid].as_ref().unwrap().backlog_used, 0);
        sp.tcp_poll();

        // connection is open with the SYN's placement and a flow published
        let id = sp.conn_lookup(PEER_IP, 8080, 5555).unwrap();
        let c = sp.conn(id);
        assert_eq!(c.status, ConnStatus::Open);
        assert_eq!(c.remote_seq, 101);
        assert_eq!(c.flow_group, 9);
        assert_eq!(c.opaque, 0x33);

        // SYN-ACK went out
        let frames = tx_tcp_frames(&mut sp);
        let (hdr, opts) = parse_tcp(frames.last().unwrap()).unwrap();
        assert_eq!(hdr.flags & (tcpflags::SYN | tcpflags::ACK), tcpflags::SYN | tcpflags::ACK);
        assert_eq!(hdr.ack, 101);
        assert_eq!(opts.mss, Some(HANDSHAKE_MSS));
    }

    #[test]
    fn accept_first_then_syn() {
        let mut sp = test_slowpath(1);
        let lid = sp.tcp_listen(0, 0, 0x22, 8080, 4, false).unwrap();
        sp.tcp_accept(0, 0, 0x44, lid, 2).unwrap();
        assert_eq!(sp.listeners[lid].as_ref().unwrap().wait_conns.len(), 1);

        let syn = build_tcp_frame(
            PEER_MAC,
            PEER_IP,
            sp.cfg.ip,
            6666,
            8080,
            200,
            0,
            tcpflags::SYN,
            false,
        );
        sp.tcp_packet(&syn, 0, 1);
        sp.tcp_poll();

        let id = sp.conn_lookup(PEER_IP, 8080, 6666).unwrap();
        assert_eq!(sp.conn(id).status, ConnStatus::Open);
        assert!(sp.listeners[lid].as_ref().unwrap().wait_conns.is_empty());
    }

    #[test]
    fn non_syn_to_listener_draws_reset() {
        let mut sp = test_slowpath(1);
        sp.tcp_listen(0, 0, 0x22, 8080, 4, false).unwrap();

        let stray = build_tcp_frame(
            PEER_MAC,
            PEER_IP,
            sp.cfg.ip,
            7000,
            8080,
            1,
            1,
            tcpflags::ACK,
            false,
        );
        sp.tcp_packet(&stray, 0, 0);

        let frames = tx_tcp_frames(&mut sp);
        let (hdr, _) = parse_tcp(frames.last().unwrap()).unwrap();
        assert!(hdr.flags & tcpflags::RST != 0);
    }

    #[test]
    fn unknown_tuple_draws_reset() {
        let mut sp = test_slowpath(1);
        let stray = build_tcp_frame(
            PEER_MAC,
            PEER_IP,
            sp.cfg.ip,
            7000,
            12345,
            500,
            0,
            tcpflags::ACK,
            false,
        );
        sp.tcp_packet(&stray, 0, 0);
        let frames = tx_tcp_frames(&mut sp);
        let (hdr, _) = parse_tcp(frames.last().unwrap()).unwrap();
        assert!(hdr.flags & tcpflags::RST != 0);
        assert_eq!(hdr.ack, 501);
    }

    #[test]
    fn reuseport_spreads_by_remote_tuple() {
        let mut sp = test_slowpath(1);
        let l0 = sp.tcp_listen(0, 0, 1, 8080, 4, true).unwrap();
        let l1 = sp.tcp_listen(0, 0, 2, 8080, 4, true).unwrap();
        assert_ne!(l0, l1);

        // the same remote tuple always lands on the same listener
        let a = sp.listener_lookup(PEER_IP, 1000, 8080).unwrap();
        let b = sp.listener_lookup(PEER_IP, 1000, 8080).unwrap();
        assert_eq!(a, b);

        // different tuples spread across both eventually
        let mut seen = std::collections::HashSet::new();
        for p in 1000..1100u16 {
            seen.insert(sp.listener_lookup(PEER_IP, p, 8080).unwrap());
        }
        assert_eq!(seen.len(), 2);

        // non-reuseport on the same port is rejected
        assert!(sp.tcp_listen(0, 0, 3, 8080, 4, false).is_err());
    }

    #[test]
    fn close_disables_flow_and_lingers() {
        let mut sp = test_slowpath(1);
        let id = sp.tcp_test_conn();
        {
            let c = sp.conn_mut(id);
            c.status = ConnStatus::Open;
        }
        sp.conn_register(id);
        // give it a registered flow
        let flow_id = {
            let c = sp.conn(id);
            let p = super::super::nicif::ConnParams {
                db_id: 1,
                vm_id: 0,
                mac_remote: PEER_MAC,
                ip_local: c.local_ip,
                port_local: c.local_port,
                ip_remote: c.remote_ip,
                port_remote: c.remote_port,
                rx_base: 0x40000,
                rx_len: 4096,
                tx_base: 0x42000,
                tx_len: 4096,
                remote_seq: 50,
                local_seq: 60,
                app_opaque: 0,
                ecn: false,
                rate: 0,
                rx_window_scale: 0,
                tx_window_scale: 0,
                flow_group: 0,
            };
            sp.nicif_connection_add(&p).unwrap()
        };
        sp.conn_mut(id).flow_id = flow_id;
        sp.cc_conn_register(id);

        sp.tcp_close(id).unwrap();
        assert_eq!(sp.conn(id).status, ConnStatus::Closed);
        assert_eq!(sp.conn(id).remote_seq, 50);
        assert_eq!(sp.conn(id).local_seq, 60);
        // unclean close sends a RST
        let frames = tx_tcp_frames(&mut sp);
        let (hdr, _) = parse_tcp(frames.last().unwrap()).unwrap();
        assert!(hdr.flags & tcpflags::RST != 0);

        // linger expiry frees the slot
        sp.tcp_timeout(TimeoutType::TcpClosed, id);
        assert!(sp.conns[id].is_none());
    }

    #[test]
    fn ephemeral_ports_unique() {
        let mut sp = test_slowpath(1);
        let a = sp.port_alloc().unwrap();
        sp.ports[a as usize] = PortState::Conn(0);
        let b = sp.port_alloc().unwrap();
        assert_ne!(a, b);
        assert!(a >= PORT_FIRST_EPH && b >= PORT_FIRST_EPH);
    }

    #[test]
    fn control_segment_padding() {
        // options always pad the TCP header to a 4-byte boundary
        let mut sp = test_slowpath(1);
        let id = sp.tcp_test_conn();
        sp.send_control(
            id,
            tcpflags::SYN,
            Some(0),
            Some(HANDSHAKE_MSS),
            Some(7),
        );
        let frames = tx_tcp_frames(&mut sp);
        let f = frames.last().unwrap();
        let (_, opts) = parse_tcp(f).unwrap();
        assert_eq!(opts.mss, Some(HANDSHAKE_MSS));
        assert_eq!(opts.wscale, Some(7));
        assert!(opts.ts.is_some());
        let tcp_len = f.len() - ETHERNET_HEADER_LEN - IPV4_HEADER_LEN;
        assert_eq!(tcp_len % 4, 0);
        // mss (4) + ws (3) + padded ts (12), rounded up to 20
        assert_eq!(tcp_len, TCP_HEADER_LEN + 20);
        let _ = TS_OPT_LEN_PADDED;
    }
}
