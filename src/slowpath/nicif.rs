use std::sync::atomic::Ordering;

use anyhow::{anyhow, Context, Result};
use log::warn;

use super::SlowPath;
use crate::fastpath::context::notify_fd;
use crate::fastpath::flowht;
use crate::fastpath::state::{FLOWST_ECN, FLOWST_RXFIN, FLOWST_SLOWPATH, FLOWST_TXFIN};
use crate::phy::PKTBUF_SIZE;
use crate::shm::layout::{KrxPacket, KtxMsg, KRX_PACKET, KRX_SIZE, KTX_SIZE};
use crate::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet};

/// Cumulative per-flow counters read for the CC loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NicStats {
    pub drops: u32,
    pub acks: u32,
    pub ackb: u32,
    pub ecnb: u32,
    pub txp: bool,
    pub rtt: u32,
}

/// Parameters for registering a flow with the fast path.
pub struct ConnParams {
    pub db_id: u16,
    pub vm_id: u16,
    pub mac_remote: EthernetAddress,
    pub ip_local: u32,
    pub port_local: u16,
    pub ip_remote: u32,
    pub port_remote: u16,
    pub rx_base: u64,
    pub rx_len: u32,
    pub tx_base: u64,
    pub tx_len: u32,
    pub remote_seq: u32,
    pub local_seq: u32,
    pub app_opaque: u64,
    pub ecn: bool,
    pub rate: u32,
    pub rx_window_scale: u8,
    pub tx_window_scale: u8,
    pub flow_group: u16,
}

impl SlowPath {
    /// Set up the per-core admin queue pairs and their packet buffers in
    /// DMA memory, and publish the ring registers to the fast path.
    pub(crate) fn nicif_init(&mut self, cores: usize) -> Result<()> {
        self.nic.rxq_len = self.cfg.nic_rx_len;
        self.nic.txq_len = self.cfg.nic_tx_len;

        for core in 0..cores {
            self.nicif_init_core(core)?;
        }
        Ok(())
    }

    fn nicif_init_core(&mut self, core: usize) -> Result<()> {
        let rx_entries = self.nic.rxq_len as u64;
        let tx_entries = self.nic.txq_len as u64;

        // one contiguous buffer region, then the two rings
        let sz_bufs = ((rx_entries + tx_entries) * PKTBUF_SIZE as u64 + 0xfff) & !0xfff;
        let bufs = self
            .pktmem
            .alloc(sz_bufs)
            .map_err(|e| anyhow!(e))
            .with_context(|| context!())?;
        let rx_ring = self
            .pktmem
            .alloc(rx_entries * KRX_SIZE as u64)
            .map_err(|e| anyhow!(e))
            .with_context(|| context!())?;
        let tx_ring = self
            .pktmem
            .alloc(tx_entries * KTX_SIZE as u64)
            .map_err(|e| anyhow!(e))
            .with_context(|| context!())?;

        self.dma.zero(rx_ring.base(), rx_ring.len() as usize);
        self.dma.zero(tx_ring.base(), tx_ring.len() as usize);

        // per-slot packet buffers; receive slots carry their buffer address
        // in the entry for the fast path to fill
        let mut off = bufs.base();
        let mut rx_bufs = Vec::with_capacity(rx_entries as usize);
        for i in 0..rx_entries {
            rx_bufs.push(off);
            self.dma
                .write(rx_ring.base() + i * KRX_SIZE as u64, &off.to_le_bytes());
            off += PKTBUF_SIZE as u64;
        }
        let mut tx_bufs = Vec::with_capacity(tx_entries as usize);
        for _ in 0..tx_entries {
            tx_bufs.push(off);
            off += PKTBUF_SIZE as u64;
        }

        let kctx = &self.pl.kctx[core];
        kctx.rx_base.store(rx_ring.base(), Ordering::Relaxed);
        kctx.tx_base.store(tx_ring.base(), Ordering::Relaxed);
        kctx.tx_len
            .store((tx_entries * KTX_SIZE as u64) as u32, Ordering::Release);
        kctx.rx_len
            .store((rx_entries * KRX_SIZE as u64) as u32, Ordering::Release);

        self.nic.rxq_base.push(rx_ring.base());
        self.nic.rxq_tail.push(0);
        self.nic.rxq_bufs.push(rx_bufs);
        self.nic.txq_base.push(tx_ring.base());
        self.nic.txq_tail.push(0);
        self.nic.txq_bufs.push(tx_bufs);

        // the extents stay allocated for the lifetime of the service
        let _ = (bufs, rx_ring, tx_ring);
        Ok(())
    }

    /// Drain the admin rx queues (packets the fast path handed up).
    pub(crate) fn nicif_poll(&mut self) -> usize {
        let mut n = 0;
        for _ in 0..512 {
            if !self.rxq_poll() {
                break;
            }
            n += 1;
        }
        n
    }

    fn rxq_poll(&mut self) -> bool {
        let cores = self.nic.rxq_base.len();
        if cores == 0 {
            return false;
        }
        let core = self.nic.rxq_next;
        self.nic.rxq_next = (core + 1) % cores;

        let tail = self.nic.rxq_tail[core];
        let off = self.nic.rxq_base[core] + (tail as u64 * KRX_SIZE as u64);

        let t = self.dma.slot_type(off, KRX_SIZE);
        if t == 0 {
            return false;
        }

        let mut payload = [0u8; KRX_SIZE - 1];
        self.dma.read(off, &mut payload);

        if t == KRX_PACKET {
            let e = KrxPacket::parse(&payload);
            let mut pkt = vec![0u8; e.len as usize];
            self.dma.read(e.addr, &mut pkt);
            self.process_packet(&pkt, e.fn_core, e.flow_group);
        } else {
            warn!("rxq_poll: unknown rx type {t}");
        }

        // restore the buffer address and release the slot
        let addr = self.nic.rxq_bufs[core][tail as usize];
        self.dma.write(off, &addr.to_le_bytes());
        self.dma.clear_slot(off, KRX_SIZE);

        self.nic.rxq_tail[core] = (tail + 1) % self.nic.rxq_len;
        true
    }

    /// Dispatch a packet the fast path could not place.
    fn process_packet(&mut self, pkt: &[u8], fn_core: u16, flow_group: u16) {
        let Ok(frame) = EthernetFrame::new_checked(pkt) else {
            warn!("process_packet: short frame");
            return;
        };
        match frame.ethertype() {
            EthernetProtocol::Arp => self.arp_packet(frame.payload()),
            EthernetProtocol::Ipv4 => {
                let Ok(ip) = Ipv4Packet::new_checked(frame.payload()) else {
                    warn!("process_packet: short ip packet");
                    return;
                };
                if ip.next_header() == IpProtocol::Tcp {
                    self.tcp_packet(pkt, fn_core, flow_group);
                }
                // everything else would go to the host tap; out of our hands
            }
            _ => (),
        }
    }

    /// Send a raw frame through core 0's admin tx queue.
    pub(crate) fn nicif_tx(&mut self, frame: &[u8], no_ts: bool) -> Result<(), ()> {
        if self.nic.txq_base.is_empty() {
            return Err(());
        }
        let core = 0usize;
        let tail = self.nic.txq_tail[core];
        let slot = self.nic.txq_base[core] + tail as u64 * KTX_SIZE as u64;

        // queue full?
        if self.dma.slot_type(slot, KTX_SIZE) != 0 {
            return Err(());
        }

        let buf = self.nic.txq_bufs[core][tail as usize];
        self.dma.write(buf, frame);

        let msg = if no_ts {
            KtxMsg::PacketNoTs {
                addr: buf,
                len: frame.len() as u16,
            }
        } else {
            KtxMsg::Packet {
                addr: buf,
                len: frame.len() as u16,
            }
        };
        let mut payload = [0u8; KTX_SIZE - 1];
        msg.emit(&mut payload);
        self.dma.publish_slot(slot, KTX_SIZE, &payload, msg.type_byte());

        self.nic.txq_tail[core] = (tail + 1) % self.nic.txq_len;
        self.notify_core(0);
        Ok(())
    }

    /// Ask a flow's home core to start retransmitting.
    pub(crate) fn nicif_connection_retransmit(
        &mut self,
        flow_id: u32,
        flow_group: u16,
    ) -> Result<(), ()> {
        let core = self.pl.steering(flow_group) as usize;
        if core >= self.nic.txq_base.len() {
            return Err(());
        }
        let tail = self.nic.txq_tail[core];
        let slot = self.nic.txq_base[core] + tail as u64 * KTX_SIZE as u64;
        if self.dma.slot_type(slot, KTX_SIZE) != 0 {
            return Err(());
        }

        let msg = KtxMsg::ConnRetran { flow_id };
        let mut payload = [0u8; KTX_SIZE - 1];
        msg.emit(&mut payload);
        self.dma.publish_slot(slot, KTX_SIZE, &payload, msg.type_byte());

        self.nic.txq_tail[core] = (tail + 1) % self.nic.txq_len;
        self.notify_core(core);
        Ok(())
    }

    fn notify_core(&self, core: usize) {
        notify_fd(self.pl.kctx[core].evfd.load(Ordering::Acquire));
    }

    /// Register a flow: allocate an id, initialize its state, and publish
    /// it in the lookup table.
    pub(crate) fn nicif_connection_add(&mut self, p: &ConnParams) -> Result<u32, ()> {
        let flow_id = self.flow_id_free.pop().ok_or(())?;

        let hash = flowht::flow_hash(p.ip_local, p.port_local, p.ip_remote, p.port_remote);

        let fst = &self.pl.flowst[flow_id as usize];
        {
            let mut fs = fst.lock();
            fs.opaque = p.app_opaque;
            fs.rx_base_sp = p.rx_base | if p.ecn { FLOWST_ECN } else { 0 };
            fs.tx_base = p.tx_base;
            fs.rx_len = p.rx_len;
            fs.tx_len = p.tx_len;
            fs.local_ip = p.ip_local;
            fs.remote_ip = p.ip_remote;
            fs.local_port = p.port_local;
            fs.remote_port = p.port_remote;
            fs.remote_mac = p.mac_remote;
            fs.db_id = p.db_id;
            fs.vm_id = p.vm_id;
            fs.flow_group = p.flow_group;
            fs.bump_seq = 0;
            fs.tx_window_scale = p.tx_window_scale;
            fs.rx_window_scale = p.rx_window_scale;

            fs.rx_dupack_cnt = 0;
            fs.rx_avail = p.rx_len;
            fs.rx_next_pos = 0;
            fs.rx_next_seq = p.remote_seq;
            fs.rx_remote_avail = p.rx_len;
            fs.rx_ooo_start = 0;
            fs.rx_ooo_len = 0;

            fs.tx_avail = 0;
            fs.tx_sent = 0;
            fs.tx_next_pos = 0;
            fs.tx_next_seq = p.local_seq;
            fs.tx_next_ts = 0;
            fs.tx_rate = p.rate;
            fs.cnt_tx_drops = 0;
            fs.cnt_rx_acks = 0;
            fs.cnt_rx_ack_bytes = 0;
            fs.cnt_rx_ecn_bytes = 0;
            fs.rtt_est = 0;
        }
        fst.set_tuple(p.ip_local, p.ip_remote, p.port_local, p.port_remote);

        if flowht::insert(&self.pl.flowht, hash, flow_id).is_err() {
            warn!("nicif_connection_add: allocating hash slot failed");
            self.flow_id_free.push(flow_id);
            return Err(());
        }
        Ok(flow_id)
    }

    /// Take a flow away from the fast path: latch SLOWPATH, snapshot the
    /// sequence state, and unpublish the lookup entry.
    ///
    /// Returns `(tx_seq, rx_seq, tx_closed, rx_closed)`.
    pub(crate) fn nicif_connection_disable(&mut self, flow_id: u32) -> (u32, u32, bool, bool) {
        let fst = &self.pl.flowst[flow_id as usize];
        let (tx_seq, rx_seq, tx_closed, rx_closed, tuple) = {
            let mut fs = fst.lock();
            fs.rx_base_sp |= FLOWST_SLOWPATH;
            (
                fs.tx_next_seq,
                fs.rx_next_seq,
                fs.rx_base_sp & FLOWST_TXFIN != 0 && fs.tx_sent == 0,
                fs.rx_base_sp & FLOWST_RXFIN != 0,
                (fs.local_ip, fs.local_port, fs.remote_ip, fs.remote_port),
            )
        };

        let hash = flowht::flow_hash(tuple.0, tuple.1, tuple.2, tuple.3);
        let _ = flowht::remove(&self.pl.flowht, hash, flow_id);

        (tx_seq, rx_seq, tx_closed, rx_closed)
    }

    pub(crate) fn nicif_connection_free(&mut self, flow_id: u32) {
        self.flow_id_free.push(flow_id);
    }

    /// Move notifications of a flow to another app context (doorbell).
    pub(crate) fn nicif_connection_move(&mut self, flow_id: u32, db_id: u16) {
        let mut fs = self.pl.flowst[flow_id as usize].lock();
        fs.db_id = db_id;
    }

    pub(crate) fn nicif_connection_stats(&self, flow_id: u32) -> NicStats {
        let fs = self.pl.flowst[flow_id as usize].lock();
        NicStats {
            drops: fs.cnt_tx_drops as u32,
            acks: fs.cnt_rx_acks as u32,
            ackb: fs.cnt_rx_ack_bytes,
            ecnb: fs.cnt_rx_ecn_bytes,
            txp: fs.tx_sent != 0,
            rtt: fs.rtt_est,
        }
    }

    pub(crate) fn nicif_connection_setrate(&self, flow_id: u32, rate: u32) {
        let mut fs = self.pl.flowst[flow_id as usize].lock();
        fs.tx_rate = rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slowpath::tests_common::test_slowpath;

    #[test]
    fn connection_add_publishes_lookup() {
        let mut sp = test_slowpath(1);
        let params = ConnParams {
            db_id: 1,
            vm_id: 0,
            mac_remote: EthernetAddress([2, 0, 0, 0, 0, 9]),
            ip_local: sp.cfg.ip,
            port_local: 1234,
            ip_remote: 0x0a000002,
            port_remote: 80,
            rx_base: 0x10000,
            rx_len: 8192,
            tx_base: 0x12000,
            tx_len: 8192,
            remote_seq: 1000,
            local_seq: 2000,
            app_opaque: 0xfeed,
            ecn: true,
            rate: 5_000,
            rx_window_scale: 0,
            tx_window_scale: 0,
            flow_group: 3,
        };
        let fid = sp.nicif_connection_add(&params).unwrap();

        let found = flowht::lookup(
            &sp.pl.flowht,
            &sp.pl.flowst,
            sp.cfg.ip,
            1234,
            0x0a000002,
            80,
        );
        assert_eq!(found, Some(fid));

        let fs = sp.pl.flowst[fid as usize].lock();
        assert_eq!(fs.rx_next_seq, 1000);
        assert_eq!(fs.tx_next_seq, 2000);
        assert_eq!(fs.rx_avail, 8192);
        assert!(fs.rx_base_sp & FLOWST_ECN != 0);
        assert_eq!(fs.rx_base_sp & !63, 0x10000);
        drop(fs);

        // disable removes it from the table and latches SLOWPATH
        let (tx_seq, rx_seq, tx_c, rx_c) = sp.nicif_connection_disable(fid);
        assert_eq!((tx_seq, rx_seq), (2000, 1000));
        assert!(!tx_c && !rx_c);
        assert!(sp.pl.flowst[fid as usize].lock().rx_base_sp & FLOWST_SLOWPATH != 0);
        assert_eq!(
            flowht::lookup(&sp.pl.flowht, &sp.pl.flowst, sp.cfg.ip, 1234, 0x0a000002, 80),
            None
        );
    }

    #[test]
    fn retransmit_lands_on_steered_core() {
        let mut sp = test_slowpath(2);
        sp.pl.flow_group_steering[5].store(1, Ordering::Relaxed);

        sp.nicif_connection_retransmit(42, 5).unwrap();

        // entry sits in core 1's ktx ring
        let slot = sp.nic.txq_base[1];
        assert_eq!(sp.dma.slot_type(slot, KTX_SIZE), crate::shm::layout::KTX_CONNRETRAN);
        let mut payload = [0u8; KTX_SIZE - 1];
        sp.dma.read(slot, &mut payload);
        assert_eq!(
            KtxMsg::parse(crate::shm::layout::KTX_CONNRETRAN, &payload),
            Some(KtxMsg::ConnRetran { flow_id: 42 })
        );
    }

    #[test]
    fn stats_and_setrate_roundtrip() {
        let sp = test_slowpath(1);
        {
            let mut fs = sp.pl.flowst[7].lock();
            fs.cnt_tx_drops = 2;
            fs.cnt_rx_acks = 30;
            fs.cnt_rx_ack_bytes = 4000;
            fs.cnt_rx_ecn_bytes = 100;
            fs.tx_sent = 10;
            fs.rtt_est = 55;
        }
        let s = sp.nicif_connection_stats(7);
        assert_eq!(s.drops, 2);
        assert_eq!(s.acks, 30);
        assert_eq!(s.ackb, 4000);
        assert_eq!(s.ecnb, 100);
        assert!(s.txp);
        assert_eq!(s.rtt, 55);

        sp.nicif_connection_setrate(7, 1234);
        assert_eq!(sp.pl.flowst[7].lock().tx_rate, 1234);
    }
}
