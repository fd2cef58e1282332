use std::sync::atomic::Ordering;

use log::warn;

use super::flows::{self, FlowsEnv};
use super::state::PipelineState;
use crate::phy::PacketBuf;
use crate::shm::layout::{KrxPacket, KtxMsg, KRX_PACKET, KRX_SIZE, KTX_SIZE};
use crate::shm::DmaMem;
use crate::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket};

/// One admin command processed from the slow path's KTX queue: raw packet
/// out (with or without timestamp injection) or a retransmit trigger.
///
/// Returns `false` when the queue is empty.
pub fn kernel_poll<E: FlowsEnv>(env: &mut E, pl: &PipelineState, core: u16, ts: u32) -> bool {
    let kctx = &pl.kctx[core as usize];
    let tx_len = kctx.tx_len.load(Ordering::Acquire);
    if tx_len == 0 {
        return false;
    }
    let tx_base = kctx.tx_base.load(Ordering::Relaxed);
    let head = kctx.tx_head.load(Ordering::Relaxed);
    let off = tx_base + head as u64;

    let t = env.dma().slot_type(off, KTX_SIZE);
    if t == 0 {
        return false;
    }
    let mut payload = [0u8; KTX_SIZE - 1];
    env.dma().read(off, &mut payload);
    let Some(msg) = KtxMsg::parse(t, &payload) else {
        warn!("kernel_poll: unknown type {t}");
        env.dma().clear_slot(off, KTX_SIZE);
        advance_head(kctx, head, tx_len);
        return true;
    };

    match msg {
        KtxMsg::Packet { addr, len } => {
            let mut buf = PacketBuf::new();
            buf.set_len(len as usize);
            env.dma().read(addr, buf.bytes_mut());
            inject_tcp_ts(env, &mut buf, ts);
            env.tx_frame(buf);
        }
        KtxMsg::PacketNoTs { addr, len } => {
            let mut buf = PacketBuf::new();
            buf.set_len(len as usize);
            env.dma().read(addr, buf.bytes_mut());
            env.tx_frame(buf);
        }
        KtxMsg::ConnRetran { flow_id } => {
            if (flow_id as usize) < pl.flowst.len() {
                flows::flows_retransmit(env, pl, flow_id);
            } else {
                warn!("kernel_poll: invalid flow id {flow_id}");
            }
        }
    }

    env.dma().clear_slot(off, KTX_SIZE);
    advance_head(kctx, head, tx_len);
    true
}

fn advance_head(kctx: &super::state::AppCtxRegs, head: u32, len: u32) {
    let mut nhead = head + KTX_SIZE as u32;
    if nhead >= len {
        nhead -= len;
    }
    kctx.tx_head.store(nhead, Ordering::Relaxed);
}

/// Route a frame the fast path cannot handle to the slow path's KRX queue.
///
/// When the queue is full the frame is dropped and counted; the slow path
/// notices stalls through its own timeouts.
pub fn kernel_packet(
    pl: &PipelineState,
    dma: &DmaMem,
    core: u16,
    buf: &PacketBuf,
    kernel_drop: &mut u64,
) -> bool {
    let kctx = &pl.kctx[core as usize];
    let rx_len = kctx.rx_len.load(Ordering::Acquire);
    if rx_len == 0 {
        // queue not initialized yet
        return false;
    }
    let rx_base = kctx.rx_base.load(Ordering::Relaxed);
    let head = kctx.rx_head.load(Ordering::Relaxed);
    let off = rx_base + head as u64;

    if dma.slot_type(off, KRX_SIZE) != 0 {
        *kernel_drop += 1;
        return false;
    }

    let mut nhead = head + KRX_SIZE as u32;
    if nhead >= rx_len {
        nhead -= rx_len;
    }
    kctx.rx_head.store(nhead, Ordering::Relaxed);

    // the packet buffer for this slot was assigned by the slow path at init
    let mut addr_bytes = [0u8; 8];
    dma.read(off, &mut addr_bytes);
    let addr = u64::from_le_bytes(addr_bytes);

    dma.write(addr, buf.bytes());

    let entry = KrxPacket {
        addr,
        len: buf.len() as u16,
        fn_core: core,
        flow_group: buf.flow_group(),
    };
    let mut payload = [0u8; KRX_SIZE - 1];
    entry.emit(&mut payload);
    dma.publish_slot(off, KRX_SIZE, &payload, KRX_PACKET);
    true
}

/// Patch the current timestamp into the tsval option of a slow-path packet
/// and refresh its checksums.
fn inject_tcp_ts<E: FlowsEnv>(env: &E, buf: &mut PacketBuf, ts: u32) {
    fn locate(buf: &PacketBuf) -> Option<(usize, u32)> {
        let frame = EthernetFrame::new_checked(buf.bytes()).ok()?;
        if frame.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
        if ip.next_header() != IpProtocol::Tcp {
            return None;
        }
        let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
        let opts = tcp
            .options()
            .map_err(|e| {
                warn!("inject_tcp_ts: parsing options failed");
                e
            })
            .ok()?;
        opts.ts.map(|t| (opts.ts_off, t.ts_ecr))
    }

    let Some((off, ecr)) = locate(buf) else {
        return;
    };

    let mut frame = EthernetFrame::new_unchecked(buf.bytes_mut());
    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp.patch_timestamps(off, ts, ecr);

    flows::kernel_checksums(env, buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::KTX_CONNRETRAN;

    #[test]
    fn kernel_packet_publishes_and_drops_when_full() {
        let pl = PipelineState::new(1, 4);
        let dma = DmaMem::alloc("krx_test", 16 * 1024, false).unwrap();

        // two-slot KRX ring at 0, packet buffers at 4k/8k
        let kctx = &pl.kctx[0];
        kctx.rx_base.store(0, Ordering::Relaxed);
        dma.write(0, &4096u64.to_le_bytes());
        dma.write(KRX_SIZE as u64, &8192u64.to_le_bytes());
        kctx.rx_len.store(2 * KRX_SIZE as u32, Ordering::Release);

        let frame = PacketBuf::from_frame(&[0xabu8; 100], 7);
        let mut drops = 0;
        assert!(kernel_packet(&pl, &dma, 0, &frame, &mut drops));
        assert!(kernel_packet(&pl, &dma, 0, &frame, &mut drops));
        // ring full now
        assert!(!kernel_packet(&pl, &dma, 0, &frame, &mut drops));
        assert_eq!(drops, 1);

        // first slot: packet copied to its buffer, entry published
        assert_eq!(dma.slot_type(0, KRX_SIZE), KRX_PACKET);
        let mut payload = [0u8; KRX_SIZE - 1];
        dma.read(0, &mut payload);
        let e = KrxPacket::parse(&payload);
        assert_eq!(e.addr, 4096);
        assert_eq!(e.len, 100);
        assert_eq!(e.flow_group, 7);
        let mut copied = [0u8; 100];
        dma.read(4096, &mut copied);
        assert_eq!(copied, [0xab; 100]);
    }

    struct NullEnv {
        dma: DmaMem,
        frames: Vec<PacketBuf>,
    }

    impl FlowsEnv for NullEnv {
        fn dma(&self) -> &DmaMem {
            &self.dma
        }
        fn local_mac(&self) -> crate::wire::EthernetAddress {
            crate::wire::EthernetAddress([2, 0, 0, 0, 0, 1])
        }
        fn offloads_checksum(&self) -> bool {
            true
        }
        fn qman_set(&mut self, _: u16, _: u32, _: u32, _: u32, _: u16, _: u8) {}
        fn tx_frame(&mut self, frame: PacketBuf) {
            self.frames.push(frame);
        }
        fn arx_add(&mut self, _: u16, _: u16, _: crate::shm::layout::ArxConnUpdate) {}
    }

    #[test]
    fn ktx_packet_roundtrip() {
        let pl = PipelineState::new(1, 4);
        let mut env = NullEnv {
            dma: DmaMem::alloc("ktx_test", 16 * 1024, false).unwrap(),
            frames: Vec::new(),
        };

        let kctx = &pl.kctx[0];
        kctx.tx_base.store(0, Ordering::Relaxed);
        kctx.tx_len.store(2 * KTX_SIZE as u32, Ordering::Release);

        assert!(!kernel_poll(&mut env, &pl, 0, 100));

        // packet staged at 4096
        env.dma.write(4096, &[0x55u8; 60]);
        let msg = KtxMsg::PacketNoTs {
            addr: 4096,
            len: 60,
        };
        let mut payload = [0u8; KTX_SIZE - 1];
        msg.emit(&mut payload);
        env.dma.publish_slot(0, KTX_SIZE, &payload, msg.type_byte());

        assert!(kernel_poll(&mut env, &pl, 0, 100));
        assert_eq!(env.frames.len(), 1);
        assert_eq!(env.frames[0].bytes(), &[0x55u8; 60][..]);
        // slot released
        assert_eq!(env.dma.slot_type(0, KTX_SIZE), 0);
    }

    #[test]
    fn ktx_retransmit_reaches_flow() {
        let pl = PipelineState::new(1, 4);
        let mut env = NullEnv {
            dma: DmaMem::alloc("ktx_rt_test", 16 * 1024, false).unwrap(),
            frames: Vec::new(),
        };
        {
            let mut fs = pl.flowst[1].lock();
            fs.tx_len = 1024;
            fs.tx_sent = 64;
            fs.tx_next_pos = 64;
            fs.tx_next_seq = 64;
            fs.tx_rate = 1000;
        }

        let kctx = &pl.kctx[0];
        kctx.tx_base.store(0, Ordering::Relaxed);
        kctx.tx_len.store(2 * KTX_SIZE as u32, Ordering::Release);

        let msg = KtxMsg::ConnRetran { flow_id: 1 };
        let mut payload = [0u8; KTX_SIZE - 1];
        msg.emit(&mut payload);
        env.dma.publish_slot(0, KTX_SIZE, &payload, KTX_CONNRETRAN);

        assert!(kernel_poll(&mut env, &pl, 0, 100));
        let fs = pl.flowst[1].lock();
        assert_eq!(fs.tx_sent, 0);
        assert_eq!(fs.tx_next_pos, 0);
        assert_eq!(fs.cnt_tx_drops, 1);
    }
}
