use std::net::Ipv4Addr;

use log::{debug, warn};

use super::state::{
    FlowState, PipelineState, FLOWST_ECN, FLOWST_RXFIN, FLOWST_SLOWPATH, FLOWST_TXFIN,
};
use super::{qman, TCP_MAX_RTT, TCP_MSS};
use crate::phy::PacketBuf;
use crate::shm::layout::ArxConnUpdate;
use crate::shm::layout::ARX_FL_RXDONE;
use crate::shm::DmaMem;
use crate::wire::ipv4::ecn;
use crate::wire::{
    emit_ts_option, tcpflags, EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol,
    Ipv4Packet, TcpOpts, TcpPacket, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN,
    TS_OPT_LEN_PADDED,
};

/// Environment the per-flow fast path acts on: the DMA region, the pacer,
/// the transmit array, and the batched ARX notifications. Implemented by
/// the dataplane context; tests substitute a recording double.
pub trait FlowsEnv {
    fn dma(&self) -> &DmaMem;
    fn local_mac(&self) -> EthernetAddress;
    fn offloads_checksum(&self) -> bool;
    /// Accept acks beyond the sent range (runtime toggle, default off).
    fn allow_future_acks(&self) -> bool {
        false
    }
    fn qman_set(&mut self, vm_id: u16, flow_id: u32, rate: u32, avail: u32, max_chunk: u16, flags: u8);
    /// Append a finished frame to the transmit array.
    fn tx_frame(&mut self, frame: PacketBuf);
    /// Queue an ARX connupdate for the owning app context.
    fn arx_add(&mut self, vm_id: u16, db_id: u16, update: ArxConnUpdate);
}

/// What became of a received frame.
#[derive(Debug)]
pub enum RxVerdict {
    /// Frame was turned into an ACK and handed to the transmit array.
    Consumed,
    /// Frame fully processed; buffer is free.
    Free(PacketBuf),
    /// Not a fast-path case; hand the frame to the slow path.
    SlowPath(PacketBuf),
}

/// Outcome of serving one pacer grant.
#[derive(Debug, PartialEq, Eq)]
pub enum QmanVerdict {
    /// A segment was built and queued.
    Sent,
    /// Nothing to send (grant raced with state changes).
    Empty,
    /// Flow is steered to another core now; forward it there.
    Forward(u16),
}

/// Bytes that may be sent: unsent buffer bytes limited by the peer window.
#[inline]
pub fn tcp_txavail(fs: &FlowState, tx_avail: Option<u32>) -> u32 {
    let buf_avail = tx_avail.unwrap_or(fs.tx_avail);
    let fc_avail = fs.rx_remote_avail.wrapping_sub(fs.tx_sent);
    buf_avail.min(fc_avail)
}

/// Validate a received ack number against the in-flight range
/// `(tx_next_seq - tx_sent, tx_next_seq]` (modular). Returns the number of
/// newly acknowledged bytes.
#[inline]
pub fn tcp_valid_rxack(fs: &FlowState, ack: u32, allow_future: bool) -> Result<u32, ()> {
    let fsack_a = fs.tx_next_seq.wrapping_sub(fs.tx_sent);
    let mut fsack_b = fs.tx_next_seq;
    if allow_future {
        fsack_b = fsack_b.wrapping_add(fs.tx_avail);
    }

    if fsack_a <= fsack_b {
        if ack < fsack_a || ack > fsack_b {
            return Err(());
        }
    } else if fsack_a > ack && ack > fsack_b {
        return Err(());
    }
    Ok(ack.wrapping_sub(fsack_a))
}

/// Check whether part of the segment fits the unused receive buffer window
/// `[rx_next_seq, rx_next_seq + rx_avail)`, even out of order. Returns how
/// much to trim off the front and back, or `Err` to drop the segment.
///
/// Both the packet interval and the window may wrap the sequence space,
/// hence the four-way case split.
pub fn tcp_trim_rxbuf(fs: &FlowState, pkt_seq: u32, pkt_bytes: u16) -> Result<(u16, u16), ()> {
    let pseq_a = pkt_seq;
    let pseq_b = pkt_seq.wrapping_add(pkt_bytes as u32);
    let sseq_a = fs.rx_next_seq;
    let sseq_b = fs.rx_next_seq.wrapping_add(fs.rx_avail);

    let trim_start;
    let trim_end;
    if pseq_a <= pseq_b && sseq_a <= sseq_b {
        // neither interval wraps
        if pseq_b < sseq_a || pseq_a > sseq_b {
            return Err(());
        }
        trim_start = if pseq_a < sseq_a { sseq_a - pseq_a } else { 0 };
        trim_end = if pseq_b > sseq_b { pseq_b - sseq_b } else { 0 };
    } else if pseq_a <= pseq_b && sseq_a > sseq_b {
        // window wraps, packet does not
        if pseq_a > sseq_b && pseq_b < sseq_a {
            return Err(());
        }
        trim_start = if pseq_a > sseq_b && pseq_a < sseq_a {
            sseq_a - pseq_a
        } else {
            0
        };
        trim_end = if pseq_b >= sseq_b && pseq_b < sseq_a {
            pseq_b.wrapping_sub(sseq_b)
        } else {
            0
        };
    } else if pseq_a > pseq_b && sseq_a <= sseq_b {
        // packet wraps, window does not
        if pseq_a > sseq_b && pseq_b < sseq_a {
            return Err(());
        }
        trim_start = if sseq_a <= pseq_b || sseq_a > pseq_a {
            sseq_a.wrapping_sub(pseq_a)
        } else {
            0
        };
        trim_end = if pseq_b > sseq_b || sseq_a >= pseq_a {
            pseq_b.wrapping_sub(sseq_b)
        } else {
            0
        };
    } else {
        // both wrap; some overlap is guaranteed
        trim_start = if pseq_a < sseq_a {
            sseq_a.wrapping_sub(pseq_a)
        } else {
            0
        };
        trim_end = if pseq_b > sseq_b {
            pseq_b.wrapping_sub(sseq_b)
        } else {
            0
        };
    }

    if trim_start as u64 + trim_end as u64 > pkt_bytes as u64 {
        return Err(());
    }
    Ok((trim_start as u16, trim_end as u16))
}

/// Screen a received frame for fast-path eligibility and parse its TCP
/// options. `None` sends the frame to the slow path.
pub fn parse_packet(buf: &PacketBuf) -> Option<TcpOpts> {
    let frame = EthernetFrame::new_checked(buf.bytes()).ok()?;
    if frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
    if ip.version() != 4
        || ip.header_len() as usize != IPV4_HEADER_LEN
        || ip.next_header() != IpProtocol::Tcp
    {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    let opts = tcp.options().ok()?;
    // fast path relies on the timestamp option being present
    opts.ts?;
    Some(opts)
}

struct ParsedHeaders {
    seq: u32,
    ack: u32,
    tcp_flags: u16,
    wnd: u16,
    payload_off: usize,
    payload_len: u16,
    ip_ecn_ce: bool,
}

fn parse_headers(buf: &PacketBuf) -> Option<ParsedHeaders> {
    let frame = EthernetFrame::new_checked(buf.bytes()).ok()?;
    let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
    let ip_hdr = ip.header_len() as usize;
    let total = ip.total_len() as usize;
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    let tcp_hdr = tcp.header_len() as usize;
    if total < ip_hdr + tcp_hdr {
        return None;
    }
    Some(ParsedHeaders {
        seq: tcp.seq_number(),
        ack: tcp.ack_number(),
        tcp_flags: tcp.flags(),
        wnd: tcp.window_len(),
        payload_off: ETHERNET_HEADER_LEN + ip_hdr + tcp_hdr,
        payload_len: (total - ip_hdr - tcp_hdr) as u16,
        ip_ecn_ce: ip.ecn() == ecn::CE,
    })
}

/// Per-flow receive processing.
pub fn flows_packet<E: FlowsEnv>(
    env: &mut E,
    pl: &PipelineState,
    flow_id: u32,
    buf: PacketBuf,
    opts: &TcpOpts,
    ts: u32,
) -> RxVerdict {
    let Some(hdr) = parse_headers(&buf) else {
        return RxVerdict::SlowPath(buf);
    };
    let Some(ts_opt) = opts.ts else {
        return RxVerdict::SlowPath(buf);
    };

    let fst = &pl.flowst[flow_id as usize];
    let mut fs = fst.lock();

    // flow already handed to the slow path
    if fs.rx_base_sp & FLOWST_SLOWPATH != 0 {
        debug!("flows_packet: slowpath because of state");
        return RxVerdict::SlowPath(buf);
    }

    // anything beyond plain data exchange goes to the slow path; a bare
    // SYN is consulted out of band without latching the flow there
    let fast_mask = tcpflags::ACK | tcpflags::PSH | tcpflags::ECE | tcpflags::CWR | tcpflags::FIN;
    if hdr.tcp_flags & !fast_mask != 0 {
        if hdr.tcp_flags & tcpflags::SYN == 0 {
            debug!(
                "flows_packet: slowpath because of flags {:x}",
                hdr.tcp_flags
            );
            fs.rx_base_sp |= FLOWST_SLOWPATH;
        }
        return RxVerdict::SlowPath(buf);
    }

    let old_avail = tcp_txavail(&fs, None);

    let orig_payload = hdr.payload_len;
    let mut seq = hdr.seq;
    let mut payload_len = hdr.payload_len;
    let mut payload_off = hdr.payload_off;
    let rx_pos = fs.rx_next_pos;

    let mut trigger_ack = payload_len > 0;
    let mut rx_bump = 0u32;
    let mut tx_bump = 0u32;
    let mut fin_bump = false;

    if hdr.tcp_flags & tcpflags::ACK != 0 {
        fs.cnt_rx_acks = fs.cnt_rx_acks.wrapping_add(1);
    }

    'proto: {
        // valid ack: account newly acked bytes
        if hdr.tcp_flags & tcpflags::ACK != 0 {
            if let Ok(bump) = tcp_valid_rxack(&fs, hdr.ack, env.allow_future_acks()) {
                tx_bump = bump;
                fs.cnt_rx_ack_bytes = fs.cnt_rx_ack_bytes.wrapping_add(bump);
                if hdr.tcp_flags & tcpflags::ECE != 0 {
                    fs.cnt_rx_ecn_bytes = fs.cnt_rx_ecn_bytes.wrapping_add(bump);
                }

                if bump <= fs.tx_sent {
                    fs.tx_sent -= bump;
                } else if env.allow_future_acks() {
                    // ack covers bytes the app produced but we never sent;
                    // advance the send state past them
                    let extra = bump - fs.tx_sent;
                    fs.tx_next_seq = fs.tx_next_seq.wrapping_add(extra);
                    fs.tx_next_pos += extra;
                    if fs.tx_next_pos >= fs.tx_len {
                        fs.tx_next_pos -= fs.tx_len;
                    }
                    fs.tx_sent = 0;
                } else {
                    warn!("flows_packet: acked more bytes than sent");
                    break 'proto;
                }

                if bump != 0 {
                    fs.rx_dupack_cnt = 0;
                } else if orig_payload == 0 {
                    fs.rx_dupack_cnt += 1;
                    if fs.rx_dupack_cnt >= 3 {
                        // triple duplicate ack: go back N
                        flow_reset_retransmit(&mut fs);
                        break 'proto;
                    }
                }
            }
        }

        // drop if entirely outside the unused window
        let Ok((trim_start, trim_end)) = tcp_trim_rxbuf(&fs, seq, payload_len) else {
            break 'proto;
        };
        payload_len -= trim_start + trim_end;
        payload_off += trim_start as usize;
        seq = seq.wrapping_add(trim_start as u32);

        if seq != fs.rx_next_seq {
            // out of order: try to keep the bytes in the single interval
            trigger_ack = true;
            if payload_len > 0 {
                flow_rx_ooo(env, &mut fs, seq, &buf, payload_off, payload_len);
            }
            break 'proto;
        }

        // in-order payload into the receive buffer
        fs.tx_next_ts = ts_opt.ts_val;
        if hdr.tcp_flags & tcpflags::ACK != 0 && ts_opt.ts_ecr != 0 {
            let rtt = ts.wrapping_sub(ts_opt.ts_ecr);
            if rtt < TCP_MAX_RTT {
                fs.rtt_est = if fs.rtt_est != 0 {
                    (fs.rtt_est * 7 + rtt) / 8
                } else {
                    rtt
                };
            }
        }
        fs.rx_remote_avail = (hdr.wnd as u32) << fs.tx_window_scale;

        if fs.rx_base_sp & FLOWST_RXFIN != 0 && payload_len > 0 {
            warn!("flows_packet: data after FIN dropped");
            break 'proto;
        }

        if payload_len > 0 {
            let rx_base = fs.rx_base();
            env.dma().write_circ(
                rx_base,
                fs.rx_len,
                fs.rx_next_pos,
                &buf.bytes()[payload_off..payload_off + payload_len as usize],
            );

            rx_bump = payload_len as u32;
            fs.rx_avail -= payload_len as u32;
            fs.rx_next_pos += payload_len as u32;
            if fs.rx_next_pos >= fs.rx_len {
                fs.rx_next_pos -= fs.rx_len;
            }
            fs.rx_next_seq = fs.rx_next_seq.wrapping_add(payload_len as u32);
            trigger_ack = true;

            // the out-of-order interval may now be adjacent or stale
            if fs.rx_ooo_len != 0 {
                match tcp_trim_rxbuf(&fs, fs.rx_ooo_start, fs.rx_ooo_len as u16) {
                    Err(()) => fs.rx_ooo_len = 0,
                    Ok((ts_, te_)) => {
                        fs.rx_ooo_start = fs.rx_ooo_start.wrapping_add(ts_ as u32);
                        fs.rx_ooo_len -= (ts_ + te_) as u32;
                        if fs.rx_ooo_len > 0 && fs.rx_ooo_start == fs.rx_next_seq {
                            // caught up: absorb the interval
                            rx_bump += fs.rx_ooo_len;
                            fs.rx_avail -= fs.rx_ooo_len;
                            fs.rx_next_pos += fs.rx_ooo_len;
                            if fs.rx_next_pos >= fs.rx_len {
                                fs.rx_next_pos -= fs.rx_len;
                            }
                            fs.rx_next_seq = fs.rx_next_seq.wrapping_add(fs.rx_ooo_len);
                            fs.rx_ooo_len = 0;
                        }
                    }
                }
            }
        }

        if hdr.tcp_flags & tcpflags::FIN != 0 && fs.rx_base_sp & FLOWST_RXFIN == 0 {
            if fs.rx_next_seq == hdr.seq.wrapping_add(orig_payload as u32) && fs.rx_ooo_len == 0 {
                fin_bump = true;
                fs.rx_base_sp |= FLOWST_RXFIN;
                // FIN takes up sequence number space
                fs.rx_next_seq = fs.rx_next_seq.wrapping_add(1);
                trigger_ack = true;
            } else {
                debug!("flows_packet: ignored fin because out of order");
            }
        }
    }

    // notify the app context if any pointer moved
    if rx_bump != 0 || tx_bump != 0 || fin_bump {
        let flags = if fin_bump { ARX_FL_RXDONE } else { 0 };
        env.arx_add(
            fs.vm_id,
            fs.db_id,
            ArxConnUpdate {
                opaque: fs.opaque,
                rx_bump,
                rx_pos,
                tx_bump,
                flags,
            },
        );
    }

    // more room to send? re-arm the pacer
    let new_avail = tcp_txavail(&fs, None);
    if new_avail > old_avail {
        env.qman_set(
            fs.vm_id,
            flow_id,
            fs.tx_rate,
            new_avail - old_avail,
            TCP_MSS as u16,
            qman::SET_RATE | qman::SET_MAXCHUNK | qman::ADD_AVAIL,
        );
    }

    if trigger_ack {
        let ecn_echo = hdr.ip_ecn_ce;
        let (seq, ack, rxwnd, echo, my) = (
            fs.tx_next_seq,
            fs.rx_next_seq,
            fs.rx_avail,
            fs.tx_next_ts,
            ts,
        );
        drop(fs);
        let buf = flow_tx_ack(env, buf, seq, ack, rxwnd, echo, my, opts.ts_off, ecn_echo);
        env.tx_frame(buf);
        return RxVerdict::Consumed;
    }

    RxVerdict::Free(buf)
}

fn flow_rx_ooo<E: FlowsEnv>(
    env: &E,
    fs: &mut FlowState,
    seq: u32,
    buf: &PacketBuf,
    payload_off: usize,
    payload_len: u16,
) {
    let write_at_seq = |fs: &FlowState, seq: u32| {
        let diff = seq.wrapping_sub(fs.rx_next_seq);
        let mut pos = fs.rx_next_pos + diff;
        if pos >= fs.rx_len {
            pos -= fs.rx_len;
        }
        pos
    };
    let payload = &buf.bytes()[payload_off..payload_off + payload_len as usize];

    if fs.rx_ooo_len == 0 {
        fs.rx_ooo_start = seq;
        fs.rx_ooo_len = payload_len as u32;
        let pos = write_at_seq(fs, seq);
        env.dma().write_circ(fs.rx_base(), fs.rx_len, pos, payload);
    } else if seq.wrapping_add(payload_len as u32) == fs.rx_ooo_start {
        // extends the front
        fs.rx_ooo_start = seq;
        fs.rx_ooo_len += payload_len as u32;
        let pos = write_at_seq(fs, seq);
        env.dma().write_circ(fs.rx_base(), fs.rx_len, pos, payload);
    } else if fs.rx_ooo_start.wrapping_add(fs.rx_ooo_len) == seq {
        // extends the back
        fs.rx_ooo_len += payload_len as u32;
        let pos = write_at_seq(fs, seq);
        env.dma().write_circ(fs.rx_base(), fs.rx_len, pos, payload);
    } else {
        debug!(
            "flows_packet: out-of-order segment not adjacent to interval (start={} len={} seq={})",
            fs.rx_ooo_start, fs.rx_ooo_len, seq
        );
    }
}

/// Queue pointer bumps posted by the application.
///
/// Returns `true` if a window-update segment was emitted.
pub fn flows_bump<E: FlowsEnv>(
    env: &mut E,
    pl: &PipelineState,
    flow_id: u32,
    bump_seq: u16,
    rx_bump: u32,
    mut tx_bump: u32,
    txdone: bool,
    ts: u32,
) -> bool {
    let fst = &pl.flowst[flow_id as usize];
    let mut fs = fst.lock();

    // catch reordered bumps (tolerating 16-bit wrap)
    if (bump_seq >= fs.bump_seq && bump_seq - fs.bump_seq > u16::MAX / 2)
        || (bump_seq < fs.bump_seq
            && (fs.bump_seq < (u16::MAX / 4) * 3 || bump_seq > u16::MAX / 4))
    {
        return false;
    }
    fs.bump_seq = bump_seq;

    if fs.rx_base_sp & FLOWST_TXFIN != 0 && tx_bump != 0 {
        // transmit side already closed
        warn!("flows_bump: tx bump while TX is already closed");
        tx_bump = 0;
    } else if txdone && fs.rx_base_sp & FLOWST_TXFIN == 0 && tx_bump == 0 {
        // closing TX requires at least the dummy byte
        warn!("flows_bump: tx eos without dummy byte");
        return false;
    }

    let tx_avail = fs.tx_avail + tx_bump;
    let old_avail = tcp_txavail(&fs, None);
    let new_avail = tcp_txavail(&fs, Some(tx_avail));

    if txdone && fs.rx_base_sp & FLOWST_TXFIN == 0 {
        fs.rx_base_sp |= FLOWST_TXFIN;
    }

    if old_avail < new_avail {
        env.qman_set(
            fs.vm_id,
            flow_id,
            fs.tx_rate,
            new_avail - old_avail,
            TCP_MSS as u16,
            qman::SET_RATE | qman::SET_MAXCHUNK | qman::ADD_AVAIL,
        );
    }

    fs.tx_avail = tx_avail;
    let rx_avail_prev = fs.rx_avail;
    fs.rx_avail += rx_bump;

    // receive buffer freed up from empty and nothing to send anyway:
    // a window update is the only way the peer learns it can move again
    if new_avail == 0 && rx_avail_prev == 0 && fs.rx_avail != 0 {
        let frame = flow_tx_segment(
            env,
            &fs,
            fs.tx_next_seq,
            fs.rx_next_seq,
            fs.rx_avail,
            0,
            0,
            fs.tx_next_ts,
            ts,
            false,
        );
        drop(fs);
        env.tx_frame(frame);
        return true;
    }

    false
}

/// Serve one pacer grant: cut a segment from the transmit buffer.
pub fn flows_qman<E: FlowsEnv>(
    env: &mut E,
    pl: &PipelineState,
    core_id: u16,
    flow_id: u32,
    ts: u32,
) -> QmanVerdict {
    let fst = &pl.flowst[flow_id as usize];
    let mut fs = fst.lock();

    // steering changed? hand the flow to its new home core
    let new_core = pl.steering(fs.flow_group);
    if new_core != core_id {
        env.qman_set(
            fs.vm_id,
            flow_id,
            0,
            0,
            0,
            qman::SET_RATE | qman::SET_MAXCHUNK | qman::SET_AVAIL,
        );
        return QmanVerdict::Forward(new_core);
    }

    let avail = tcp_txavail(&fs, None);
    if avail == 0 {
        return QmanVerdict::Empty;
    }
    let mut len = avail.min(TCP_MSS as u32) as u16;

    // snapshot for the segment, then advance the send state
    let tx_seq = fs.tx_next_seq;
    let tx_pos = fs.tx_next_pos;
    let rx_wnd = fs.rx_avail;
    let ack = fs.rx_next_seq;

    fs.tx_next_seq = fs.tx_next_seq.wrapping_add(len as u32);
    fs.tx_next_pos += len as u32;
    if fs.tx_next_pos >= fs.tx_len {
        fs.tx_next_pos -= fs.tx_len;
    }
    fs.tx_sent += len as u32;
    fs.tx_avail -= len as u32;

    let fin = fs.rx_base_sp & FLOWST_TXFIN != 0 && fs.tx_avail == 0;
    if fin {
        // the dummy byte stands in for the FIN; don't send it
        debug_assert!(len > 0);
        len -= 1;
    }

    let frame = flow_tx_segment(
        env,
        &fs,
        tx_seq,
        ack,
        rx_wnd,
        len,
        tx_pos,
        fs.tx_next_ts,
        ts,
        fin,
    );
    drop(fs);
    env.tx_frame(frame);
    QmanVerdict::Sent
}

/// Re-arm a forwarded flow on its new core's pacer.
pub fn flows_qman_fwd<E: FlowsEnv>(env: &mut E, pl: &PipelineState, flow_id: u32) {
    let fst = &pl.flowst[flow_id as usize];
    let fs = fst.lock();
    let avail = tcp_txavail(&fs, None);
    env.qman_set(
        fs.vm_id,
        flow_id,
        fs.tx_rate,
        avail,
        TCP_MSS as u16,
        qman::SET_RATE | qman::SET_MAXCHUNK | qman::SET_AVAIL,
    );
}

/// Go-back-N retransmission entry point (from the slow path's CONNRETRAN).
pub fn flows_retransmit<E: FlowsEnv>(env: &mut E, pl: &PipelineState, flow_id: u32) {
    let fst = &pl.flowst[flow_id as usize];
    let mut fs = fst.lock();

    if fs.tx_sent == 0 {
        return;
    }

    let old_avail = tcp_txavail(&fs, None);
    flow_reset_retransmit(&mut fs);
    let new_avail = tcp_txavail(&fs, None);

    if new_avail > old_avail {
        env.qman_set(
            fs.vm_id,
            flow_id,
            fs.tx_rate,
            new_avail - old_avail,
            TCP_MSS as u16,
            qman::SET_RATE | qman::SET_MAXCHUNK | qman::ADD_AVAIL,
        );
    }
}

/// Rewind the send state as if the unacknowledged segments were never
/// transmitted.
fn flow_reset_retransmit(fs: &mut FlowState) {
    fs.rx_dupack_cnt = 0;

    fs.tx_next_seq = fs.tx_next_seq.wrapping_sub(fs.tx_sent);
    if fs.tx_next_pos >= fs.tx_sent {
        fs.tx_next_pos -= fs.tx_sent;
    } else {
        fs.tx_next_pos = fs.tx_len - (fs.tx_sent - fs.tx_next_pos);
    }
    fs.tx_avail += fs.tx_sent;
    fs.rx_remote_avail += fs.tx_sent;
    fs.tx_sent = 0;

    // halve the rate on the first drop in a control interval
    if fs.cnt_tx_drops == 0 {
        fs.tx_rate /= 2;
    }
    fs.cnt_tx_drops += 1;
}

const HDRS_LEN: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + TS_OPT_LEN_PADDED;

/// Build a data segment (PSH|ACK, optionally FIN) from the flow's transmit
/// buffer into a fresh frame.
#[allow(clippy::too_many_arguments)]
fn flow_tx_segment<E: FlowsEnv>(
    env: &E,
    fs: &FlowState,
    seq: u32,
    ack: u32,
    rxwnd: u32,
    payload: u16,
    payload_pos: u32,
    ts_echo: u32,
    ts_my: u32,
    fin: bool,
) -> PacketBuf {
    let mut buf = PacketBuf::new();
    let total = HDRS_LEN + payload as usize;
    buf.set_len(total);

    let (local_ip, remote_ip, local_port, remote_port) = (
        Ipv4Addr::from(fs.local_ip),
        Ipv4Addr::from(fs.remote_ip),
        fs.local_port,
        fs.remote_port,
    );

    let mut frame = EthernetFrame::new_unchecked(buf.bytes_mut());
    frame.set_dst_addr(fs.remote_mac);
    frame.set_src_addr(env.local_mac());
    frame.set_ethertype(EthernetProtocol::Ipv4);

    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_dscp_ecn(0);
    ip.set_total_len((IPV4_HEADER_LEN + TCP_HEADER_LEN + TS_OPT_LEN_PADDED) as u16 + payload);
    ip.set_ident(3);
    ip.set_flags_frag_offset(0);
    ip.set_hop_limit(0xff);
    ip.set_next_header(IpProtocol::Tcp);
    ip.set_src_addr(local_ip);
    ip.set_dst_addr(remote_ip);
    if fs.rx_base_sp & FLOWST_ECN != 0 {
        ip.set_ecn(ecn::ECT0);
    }

    let fin_fl = if fin { tcpflags::FIN } else { 0 };
    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp.set_src_port(local_port);
    tcp.set_dst_port(remote_port);
    tcp.set_seq_number(seq);
    tcp.set_ack_number(ack);
    tcp.set_header_len_flags(
        (TCP_HEADER_LEN + TS_OPT_LEN_PADDED) as u8,
        tcpflags::PSH | tcpflags::ACK | fin_fl,
    );
    tcp.set_window_len(rxwnd.min(0xffff) as u16);
    tcp.set_urgent_at(0);
    emit_ts_option(tcp.options_mut(), ts_my, ts_echo);

    if payload > 0 {
        env.dma().read_circ(
            fs.tx_base,
            fs.tx_len,
            payload_pos,
            &mut tcp.payload_mut()[..payload as usize],
        );
    }

    finish_checksums(env, &mut buf, local_ip, remote_ip);
    buf
}

/// Turn the received frame into an ACK in place: swap addresses and ports,
/// rewrite seq/ack/window/timestamps, clear ECN on IP and echo ECE if the
/// segment arrived congestion-marked.
#[allow(clippy::too_many_arguments)]
fn flow_tx_ack<E: FlowsEnv>(
    env: &E,
    mut buf: PacketBuf,
    seq: u32,
    ack: u32,
    rxwnd: u32,
    echo_ts: u32,
    my_ts: u32,
    ts_off: usize,
    ecn_echo: bool,
) -> PacketBuf {
    let mut frame = EthernetFrame::new_unchecked(buf.bytes_mut());
    let (src_mac, dst_mac) = (frame.src_addr(), frame.dst_addr());
    frame.set_src_addr(dst_mac);
    frame.set_dst_addr(src_mac);

    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    let (src_ip, dst_ip) = (ip.src_addr(), ip.dst_addr());
    ip.set_src_addr(dst_ip);
    ip.set_dst_addr(src_ip);
    ip.set_ecn(ecn::NONE);
    ip.set_hop_limit(0xff);

    let tcp_hdr_len;
    {
        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        let (sp, dp) = (tcp.src_port(), tcp.dst_port());
        tcp.set_src_port(dp);
        tcp.set_dst_port(sp);
        tcp.set_seq_number(seq);
        tcp.set_ack_number(ack);
        tcp_hdr_len = tcp.header_len() as usize;
        let ecn_fl = if ecn_echo { tcpflags::ECE } else { 0 };
        tcp.set_flags(tcpflags::ACK | ecn_fl);
        tcp.set_window_len(rxwnd.min(0xffff) as u16);
        tcp.set_urgent_at(0);
        tcp.patch_timestamps(ts_off, my_ts, echo_ts);
    }
    ip.set_total_len((IPV4_HEADER_LEN + tcp_hdr_len) as u16);

    let new_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_hdr_len;
    buf.set_len(new_len);
    let (lip, rip) = (dst_ip, src_ip);
    finish_checksums(env, &mut buf, lip, rip);
    buf
}

/// IP + TCP checksums: cleared for offload when the port computes them,
/// filled in software otherwise.
fn finish_checksums<E: FlowsEnv>(env: &E, buf: &mut PacketBuf, src: Ipv4Addr, dst: Ipv4Addr) {
    let mut frame = EthernetFrame::new_unchecked(buf.bytes_mut());
    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    if env.offloads_checksum() {
        ip.set_checksum(0);
        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.set_checksum(0);
    } else {
        ip.fill_checksum();
        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.fill_checksum(src, dst);
    }
}

/// Recompute checksums on a slow-path packet after timestamp injection.
pub fn kernel_checksums<E: FlowsEnv>(env: &E, buf: &mut PacketBuf) {
    let frame = EthernetFrame::new_unchecked(buf.bytes());
    let ip = Ipv4Packet::new_unchecked(frame.payload());
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    finish_checksums(env, buf, src, dst);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::ATX_FL_TXDONE;

    struct TestEnv {
        dma: DmaMem,
        qman_calls: Vec<(u16, u32, u32, u32, u16, u8)>,
        frames: Vec<PacketBuf>,
        arx: Vec<(u16, u16, ArxConnUpdate)>,
        future_acks: bool,
    }

    impl TestEnv {
        fn new() -> TestEnv {
            TestEnv {
                dma: DmaMem::alloc("flows_test", 64 * 1024, false).unwrap(),
                qman_calls: Vec::new(),
                frames: Vec::new(),
                arx: Vec::new(),
                future_acks: false,
            }
        }
    }

    impl FlowsEnv for TestEnv {
        fn dma(&self) -> &DmaMem {
            &self.dma
        }

        fn local_mac(&self) -> EthernetAddress {
            EthernetAddress([0x02, 0, 0, 0, 0, 1])
        }

        fn offloads_checksum(&self) -> bool {
            false
        }

        fn allow_future_acks(&self) -> bool {
            self.future_acks
        }

        fn qman_set(
            &mut self,
            vm_id: u16,
            flow_id: u32,
            rate: u32,
            avail: u32,
            max_chunk: u16,
            flags: u8,
        ) {
            self.qman_calls
                .push((vm_id, flow_id, rate, avail, max_chunk, flags));
        }

        fn tx_frame(&mut self, frame: PacketBuf) {
            self.frames.push(frame);
        }

        fn arx_add(&mut self, vm_id: u16, db_id: u16, update: ArxConnUpdate) {
            self.arx.push((vm_id, db_id, update));
        }
    }

    const ISN_RX: u32 = 1000;
    const ISN_TX: u32 = 1;

    /// flow 0: 1kB buffers, 10 Mbps, open window, rx seq ISN_RX, tx seq ISN_TX.
    fn flow_init(pl: &PipelineState) {
        let fst = &pl.flowst[0];
        fst.set_tuple(0x0a000001, 0x0a000002, 1234, 80);
        let mut fs = fst.lock();
        fs.opaque = 0x1234;
        fs.rx_base_sp = 0;
        fs.tx_base = 2048;
        fs.rx_len = 1024;
        fs.tx_len = 1024;
        fs.local_ip = 0x0a000001;
        fs.remote_ip = 0x0a000002;
        fs.local_port = 1234;
        fs.remote_port = 80;
        fs.remote_mac = EthernetAddress([0x02, 0, 0, 0, 0, 2]);
        fs.rx_avail = 1024;
        fs.rx_next_seq = ISN_RX;
        fs.rx_remote_avail = 1024;
        fs.tx_next_seq = ISN_TX;
        fs.tx_rate = 10_000;
        fs.rtt_est = 18;
    }

    /// Data segment from the peer (dst = local side of flow 0).
    fn peer_segment(seq: u32, ack: u32, flags: u16, wnd: u16, payload: &[u8]) -> PacketBuf {
        let tcp_hdr = TCP_HEADER_LEN + TS_OPT_LEN_PADDED;
        let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_hdr + payload.len();
        let mut buf = PacketBuf::new();
        buf.set_len(total);

        let mut frame = EthernetFrame::new_unchecked(buf.bytes_mut());
        frame.set_dst_addr(EthernetAddress([0x02, 0, 0, 0, 0, 1]));
        frame.set_src_addr(EthernetAddress([0x02, 0, 0, 0, 0, 2]));
        frame.set_ethertype(EthernetProtocol::Ipv4);

        let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
        ip.set_version(4);
        ip.set_header_len(IPV4_HEADER_LEN as u8);
        ip.set_dscp_ecn(0);
        ip.set_total_len((IPV4_HEADER_LEN + tcp_hdr + payload.len()) as u16);
        ip.set_ident(0);
        ip.set_flags_frag_offset(0);
        ip.set_hop_limit(64);
        ip.set_next_header(IpProtocol::Tcp);
        ip.set_src_addr(Ipv4Addr::from(0x0a000002u32));
        ip.set_dst_addr(Ipv4Addr::from(0x0a000001u32));

        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.set_src_port(80);
        tcp.set_dst_port(1234);
        tcp.set_seq_number(seq);
        tcp.set_ack_number(ack);
        tcp.set_header_len_flags(tcp_hdr as u8, flags);
        tcp.set_window_len(wnd);
        tcp.set_urgent_at(0);
        emit_ts_option(tcp.options_mut(), 5555, 0);
        tcp.payload_mut()[..payload.len()].copy_from_slice(payload);

        ip.fill_checksum();
        buf
    }

    fn rx(env: &mut TestEnv, pl: &PipelineState, buf: PacketBuf) -> RxVerdict {
        let opts = parse_packet(&buf).expect("parse");
        flows_packet(env, pl, 0, buf, &opts, 100)
    }

    fn emitted_tcp(frame: &PacketBuf) -> (u32, u32, u16, u16, usize) {
        let eth = EthernetFrame::new_checked(frame.bytes()).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        let payload = ip.total_len() as usize - ip.header_len() as usize - tcp.header_len() as usize;
        (
            tcp.seq_number(),
            tcp.ack_number(),
            tcp.flags(),
            tcp.window_len(),
            payload,
        )
    }

    // S1: small tx bump arms the pacer but sends nothing by itself.
    #[test]
    fn bump_small_tx() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let sent = flows_bump(&mut env, &pl, 0, 1, 0, 32, false, 100);
        assert!(!sent);
        assert!(env.frames.is_empty());
        assert_eq!(pl.flowst[0].lock().tx_avail, 32);
        assert_eq!(
            env.qman_calls,
            vec![(
                0,
                0,
                10_000,
                32,
                TCP_MSS as u16,
                qman::SET_RATE | qman::SET_MAXCHUNK | qman::ADD_AVAIL
            )]
        );
    }

    // S2: freeing receive space from zero emits one window-update ACK.
    #[test]
    fn bump_reopens_window() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        {
            let mut fs = pl.flowst[0].lock();
            fs.rx_avail = 0;
        }

        let sent = flows_bump(&mut env, &pl, 0, 1, 1024, 0, false, 100);
        assert!(sent);
        assert_eq!(env.frames.len(), 1);
        assert!(env.qman_calls.is_empty());
        assert_eq!(pl.flowst[0].lock().rx_avail, 1024);

        let (seq, ack, flags, wnd, payload) = emitted_tcp(&env.frames[0]);
        assert_eq!(seq, ISN_TX);
        assert_eq!(ack, ISN_RX);
        assert_eq!(flags & tcpflags::ACK, tcpflags::ACK);
        assert_eq!(wnd, 1024);
        assert_eq!(payload, 0);
    }

    // S3: both windows closed with tx data pending; the rx reopen must
    // still produce an ACK or the peer never learns the window opened.
    #[test]
    fn bump_reopens_window_deadlock() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        {
            let mut fs = pl.flowst[0].lock();
            fs.rx_avail = 0;
            fs.rx_remote_avail = 0;
            fs.tx_avail = 32;
        }

        let sent = flows_bump(&mut env, &pl, 0, 1, 1024, 0, false, 100);
        assert!(sent);
        assert_eq!(env.frames.len(), 1);
        assert!(env.qman_calls.is_empty());
    }

    // S4: retransmit rewinds the send state and re-arms the pacer.
    #[test]
    fn retransmit_rewinds() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        {
            let mut fs = pl.flowst[0].lock();
            fs.tx_sent = 128;
            fs.tx_next_pos = 128;
            fs.tx_next_seq = 129;
            fs.rx_remote_avail = 896;
            fs.tx_avail = 0;
        }

        flows_retransmit(&mut env, &pl, 0);

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.tx_sent, 0);
        assert_eq!(fs.tx_next_pos, 0);
        assert_eq!(fs.tx_next_seq, 1);
        assert_eq!(fs.rx_remote_avail, 1024);
        assert_eq!(fs.tx_avail, 128);
        assert_eq!(fs.tx_rate, 5_000);
        assert_eq!(fs.cnt_tx_drops, 1);
        drop(fs);
        assert_eq!(
            env.qman_calls,
            vec![(
                0,
                0,
                5_000,
                128,
                TCP_MSS as u16,
                qman::SET_RATE | qman::SET_MAXCHUNK | qman::ADD_AVAIL
            )]
        );
    }

    #[test]
    fn retransmit_without_inflight_is_noop() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        flows_retransmit(&mut env, &pl, 0);
        assert!(env.qman_calls.is_empty());
        assert_eq!(pl.flowst[0].lock().cnt_tx_drops, 0);
    }

    // Property 4: in-order delivery across a filling out-of-order interval;
    // rx_pos reports monotone, bumps sum to the payload bytes.
    #[test]
    fn out_of_order_interval_fills() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let a: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let b: Vec<u8> = (100..200).map(|i| i as u8).collect();
        let c: Vec<u8> = (200..250).map(|i| i as u8).collect();

        // in-order A, then C (leaves a hole), then B (fills it)
        assert!(matches!(
            rx(&mut env, &pl, peer_segment(ISN_RX, ISN_TX, tcpflags::ACK, 1024, &a)),
            RxVerdict::Consumed
        ));
        assert!(matches!(
            rx(
                &mut env,
                &pl,
                peer_segment(ISN_RX + 200, ISN_TX, tcpflags::ACK, 1024, &c)
            ),
            RxVerdict::Consumed
        ));
        {
            let fs = pl.flowst[0].lock();
            assert_eq!(fs.rx_ooo_start, ISN_RX + 200);
            assert_eq!(fs.rx_ooo_len, 50);
            assert_eq!(fs.rx_next_seq, ISN_RX + 100);
        }
        assert!(matches!(
            rx(
                &mut env,
                &pl,
                peer_segment(ISN_RX + 100, ISN_TX, tcpflags::ACK, 1024, &b)
            ),
            RxVerdict::Consumed
        ));

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.rx_next_seq, ISN_RX + 250);
        assert_eq!(fs.rx_ooo_len, 0);
        assert_eq!(fs.rx_avail, 1024 - 250);
        drop(fs);

        // the receive buffer holds the full contiguous byte stream
        let mut delivered = vec![0u8; 250];
        env.dma.read_circ(0, 1024, 0, &mut delivered);
        let expect: Vec<u8> = (0..250).map(|i| i as u8).collect();
        assert_eq!(delivered, expect);

        // ARX stream: monotone rx_pos, bumps sum to 250
        let total: u32 = env.arx.iter().map(|(_, _, u)| u.rx_bump).sum();
        assert_eq!(total, 250);
        let positions: Vec<u32> = env.arx.iter().map(|(_, _, u)| u.rx_pos).collect();
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    // Property 5: emitted ACKs carry rx_next_seq and the clamped window.
    #[test]
    fn ack_reflects_receive_state() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let payload = vec![7u8; 100];
        rx(
            &mut env,
            &pl,
            peer_segment(ISN_RX, ISN_TX, tcpflags::ACK | tcpflags::PSH, 1024, &payload),
        );

        assert_eq!(env.frames.len(), 1);
        let (_, ack, flags, wnd, _) = emitted_tcp(&env.frames[0]);
        assert_eq!(ack, ISN_RX + 100);
        assert_eq!(flags, tcpflags::ACK);
        assert_eq!(wnd as u32, 1024 - 100);
    }

    #[test]
    fn fin_bumps_sequence_and_notifies() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        rx(
            &mut env,
            &pl,
            peer_segment(ISN_RX, ISN_TX, tcpflags::ACK | tcpflags::FIN, 1024, &[]),
        );

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.rx_next_seq, ISN_RX + 1);
        assert!(fs.rx_base_sp & FLOWST_RXFIN != 0);
        drop(fs);

        assert_eq!(env.arx.len(), 1);
        assert_eq!(env.arx[0].2.flags & ARX_FL_RXDONE, ARX_FL_RXDONE);
        // the FIN is acked
        assert_eq!(env.frames.len(), 1);
        let (_, ack, _, _, _) = emitted_tcp(&env.frames[0]);
        assert_eq!(ack, ISN_RX + 1);
    }

    #[test]
    fn triple_dupack_triggers_retransmit() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        {
            let mut fs = pl.flowst[0].lock();
            fs.tx_sent = 256;
            fs.tx_next_pos = 256;
            fs.tx_next_seq = ISN_TX + 256;
        }

        for _ in 0..3 {
            rx(
                &mut env,
                &pl,
                peer_segment(ISN_RX, ISN_TX, tcpflags::ACK, 1024, &[]),
            );
        }

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.tx_sent, 0);
        assert_eq!(fs.tx_next_seq, ISN_TX);
        assert_eq!(fs.cnt_tx_drops, 1);
    }

    #[test]
    fn weird_flags_go_to_slow_path() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let v = rx(
            &mut env,
            &pl,
            peer_segment(ISN_RX, ISN_TX, tcpflags::RST, 1024, &[]),
        );
        assert!(matches!(v, RxVerdict::SlowPath(_)));
        // RST latches the slow-path bit
        assert!(pl.flowst[0].lock().rx_base_sp & FLOWST_SLOWPATH != 0);
    }

    #[test]
    fn bare_syn_does_not_latch_slowpath() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let v = rx(
            &mut env,
            &pl,
            peer_segment(ISN_RX, ISN_TX, tcpflags::SYN, 1024, &[]),
        );
        assert!(matches!(v, RxVerdict::SlowPath(_)));
        assert!(pl.flowst[0].lock().rx_base_sp & FLOWST_SLOWPATH == 0);
    }

    #[test]
    fn qman_grant_sends_segment() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        // app wrote 64 bytes at tx_base
        let data: Vec<u8> = (0..64u8).collect();
        env.dma.write(2048, &data);
        {
            let mut fs = pl.flowst[0].lock();
            fs.tx_avail = 64;
        }

        let v = flows_qman(&mut env, &pl, 0, 0, 100);
        assert_eq!(v, QmanVerdict::Sent);
        assert_eq!(env.frames.len(), 1);
        let (seq, ack, flags, _, payload) = emitted_tcp(&env.frames[0]);
        assert_eq!(seq, ISN_TX);
        assert_eq!(ack, ISN_RX);
        assert_eq!(flags & (tcpflags::PSH | tcpflags::ACK), tcpflags::PSH | tcpflags::ACK);
        assert_eq!(payload, 64);

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.tx_sent, 64);
        assert_eq!(fs.tx_avail, 0);
        assert_eq!(fs.tx_next_seq, ISN_TX + 64);
    }

    #[test]
    fn qman_grant_on_moved_flow_forwards() {
        let pl = PipelineState::new(2, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        {
            let mut fs = pl.flowst[0].lock();
            fs.tx_avail = 64;
            fs.flow_group = 7;
        }
        pl.flow_group_steering[7].store(1, std::sync::atomic::Ordering::Relaxed);

        let v = flows_qman(&mut env, &pl, 0, 0, 100);
        assert_eq!(v, QmanVerdict::Forward(1));
        // local pacer queue cleared
        assert_eq!(
            env.qman_calls,
            vec![(0, 0, 0, 0, 0, qman::SET_RATE | qman::SET_MAXCHUNK | qman::SET_AVAIL)]
        );
    }

    #[test]
    fn txfin_piggybacks_on_last_segment() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        // app posts 1 dummy byte with TXDONE
        flows_bump(&mut env, &pl, 0, 1, 0, 1, true, 100);
        assert!(pl.flowst[0].lock().rx_base_sp & FLOWST_TXFIN != 0);

        let v = flows_qman(&mut env, &pl, 0, 0, 100);
        assert_eq!(v, QmanVerdict::Sent);
        let (_, _, flags, _, payload) = emitted_tcp(&env.frames[0]);
        assert!(flags & tcpflags::FIN != 0);
        assert_eq!(payload, 0, "dummy byte must not go on the wire");
    }

    #[test]
    fn txdone_without_dummy_byte_rejected() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        flows_bump(&mut env, &pl, 0, 1, 0, 0, true, 100);
        assert!(pl.flowst[0].lock().rx_base_sp & FLOWST_TXFIN == 0);
    }

    #[test]
    fn stale_bump_seq_discarded() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);
        flows_bump(&mut env, &pl, 0, 10, 0, 32, false, 100);
        assert_eq!(pl.flowst[0].lock().tx_avail, 32);
        // an older bump arriving late must not apply
        flows_bump(&mut env, &pl, 0, 9, 0, 32, false, 100);
        assert_eq!(pl.flowst[0].lock().tx_avail, 32);
        let _ = ATX_FL_TXDONE;
    }

    #[test]
    fn trim_drops_stale_segment() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        // entirely before the window
        let v = rx(
            &mut env,
            &pl,
            peer_segment(ISN_RX - 200, ISN_TX, tcpflags::ACK, 1024, &[1; 100]),
        );
        // still acked (payload present), but nothing delivered
        assert!(matches!(v, RxVerdict::Consumed));
        assert_eq!(pl.flowst[0].lock().rx_next_seq, ISN_RX);
        assert!(env.arx.is_empty());
    }

    #[test]
    fn overlap_is_trimmed() {
        let pl = PipelineState::new(1, 4);
        let mut env = TestEnv::new();
        flow_init(&pl);

        let a: Vec<u8> = (0..100).map(|i| i as u8).collect();
        rx(&mut env, &pl, peer_segment(ISN_RX, ISN_TX, tcpflags::ACK, 1024, &a));
        // retransmission covering [ISN_RX-0, +150): first 100 already seen
        let b: Vec<u8> = (0..150).map(|i| i as u8).collect();
        rx(&mut env, &pl, peer_segment(ISN_RX, ISN_TX, tcpflags::ACK, 1024, &b));

        let fs = pl.flowst[0].lock();
        assert_eq!(fs.rx_next_seq, ISN_RX + 150);
        assert_eq!(fs.rx_avail, 1024 - 150);
    }

    #[test]
    fn txavail_respects_flow_control() {
        let mut fs = FlowState {
            tx_avail: 500,
            rx_remote_avail: 300,
            tx_sent: 100,
            ..Default::default()
        };
        assert_eq!(tcp_txavail(&fs, None), 200);
        fs.rx_remote_avail = 1000;
        assert_eq!(tcp_txavail(&fs, None), 500);
        assert_eq!(tcp_txavail(&fs, Some(50)), 50);
    }

    #[test]
    fn valid_rxack_range() {
        let fs = FlowState {
            tx_next_seq: 1000,
            tx_sent: 200,
            tx_avail: 50,
            ..Default::default()
        };
        // in (800, 1000]
        assert_eq!(tcp_valid_rxack(&fs, 800, false), Ok(0));
        assert_eq!(tcp_valid_rxack(&fs, 900, false), Ok(100));
        assert_eq!(tcp_valid_rxack(&fs, 1000, false), Ok(200));
        assert!(tcp_valid_rxack(&fs, 1001, false).is_err());
        assert!(tcp_valid_rxack(&fs, 799, false).is_err());
        // future acks allowed: up to tx_next_seq + tx_avail
        assert_eq!(tcp_valid_rxack(&fs, 1050, true), Ok(250));
        assert!(tcp_valid_rxack(&fs, 1051, true).is_err());
    }

    #[test]
    fn trim_rxbuf_wrapping_window() {
        // window wraps the sequence space
        let fs = FlowState {
            rx_next_seq: u32::MAX - 10,
            rx_avail: 100,
            ..Default::default()
        };
        // segment right at the window start
        let (s, e) = tcp_trim_rxbuf(&fs, u32::MAX - 10, 50).unwrap();
        assert_eq!((s, e), (0, 0));
        // segment crossing the wrap
        let (s, e) = tcp_trim_rxbuf(&fs, u32::MAX - 5, 50).unwrap();
        assert_eq!((s, e), (0, 0));
        // stale segment entirely before the window
        assert!(tcp_trim_rxbuf(&fs, u32::MAX - 200, 50).is_err());
    }
}
