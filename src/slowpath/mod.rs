/*! The slow path.

A single-threaded controller owning everything the fast path offloads:
TCP handshakes and connection lifecycle, ARP resolution with retry, the
route table, congestion control loops, timeouts, and the application
control channel. It talks to the fast-path cores through the per-core
admin queues and eventfds only.
*/

pub mod appif;
pub mod arp;
pub mod cc;
pub mod nicif;
pub mod routing;
pub mod tcp;
pub mod timeouts;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use lazy_static::lazy_static;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::fastpath::state::PipelineState;
use crate::shm::{DmaMem, PacketMem, PktMemHandle};
use crate::time::{now_us, now_us64};
use crate::wire::EthernetAddress;

use self::cc::CcConn;
use self::routing::RoutingTable;
use self::timeouts::{TimeoutKey, TimeoutManager, TimeoutType};

/// Process-wide slow-path statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelStats {
    /// Drops detected by the fast path.
    pub drops: u64,
    /// Slow-path initiated retransmits.
    pub kernel_rexmit: u64,
    /// ECN marked ack bytes.
    pub ecn_marked: u64,
    /// Total acked bytes.
    pub acks: u64,
}

lazy_static! {
    pub static ref KSTATS: Mutex<KernelStats> = Mutex::new(KernelStats::default());
}

/// TCP connection state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Accepted: waiting for a SYN from the backlog.
    SynWait,
    /// Opening: waiting for ARP resolution.
    ArpPending,
    /// Opening: SYN sent.
    SynSent,
    /// SYN received on a listener, flow registration pending.
    RegSynack,
    Open,
    Closed,
    Failed,
}

/// Slow-path connection state, mirroring a flow during setup and teardown.
pub struct Connection {
    pub opaque: u64,
    pub app_id: u16,
    pub ctx_id: usize,
    pub db_id: u16,

    pub rx_handle: Option<PktMemHandle>,
    pub tx_handle: Option<PktMemHandle>,
    pub rx_off: u64,
    pub tx_off: u64,
    pub rx_len: u32,
    pub tx_len: u32,

    pub remote_mac: EthernetAddress,
    pub remote_ip: u32,
    pub local_ip: u32,
    pub remote_port: u16,
    pub local_port: u16,

    pub status: ConnStatus,
    pub remote_seq: u32,
    pub local_seq: u32,
    pub syn_ts: u32,
    pub tx_window_scale: u8,
    pub rx_window_scale: u8,

    pub timeout_us: u32,
    pub to_key: Option<TimeoutKey>,
    pub to_attempts: u32,

    pub cc: CcConn,
    /// ECN negotiated.
    pub ecn: bool,

    pub flow_id: u32,
    pub fn_core: u16,
    pub flow_group: u16,
    pub comp_status: i32,
}

/// One SYN parked in a listener's backlog, with its arrival placement.
pub struct BacklogSlot {
    pub buf: Vec<u8>,
    pub core: u16,
    pub flow_group: u16,
}

pub struct Listener {
    pub opaque: u64,
    pub app_id: u16,
    pub ctx_id: usize,
    pub port: u16,
    pub backlog: Vec<Option<BacklogSlot>>,
    pub backlog_pos: usize,
    pub backlog_used: usize,
    /// Connections from accept calls waiting to be paired with SYNs.
    pub wait_conns: VecDeque<usize>,
    pub ecn: bool,
}

/// Per-port ownership.
#[derive(Default)]
pub enum PortState {
    #[default]
    Unused,
    Listen(usize),
    /// Reuseport group, selected per SYN by remote-tuple hash.
    ListenMulti(Vec<usize>),
    Conn(usize),
}

/// Pending asynchronous completion, processed by `tcp_poll`.
pub(crate) struct AsyncCompletion {
    pub conn: usize,
    pub status: i32,
}

pub use self::appif::{Application, AppContext, UxConn};

const ARP_CACHE_SIZE: usize = 128;

pub(crate) struct ArpEntry {
    pub mac: EthernetAddress,
    pub resolved: bool,
    /// Connection ids waiting for this resolution.
    pub waiters: Vec<usize>,
    pub timeout_us: u32,
    pub to_key: Option<TimeoutKey>,
}

/// Per-core admin queue state on the slow-path side.
pub(crate) struct NicQueues {
    /// KRX ring base per core (fast path -> slow path).
    pub rxq_base: Vec<u64>,
    pub rxq_tail: Vec<u32>,
    /// Per-slot packet buffer offsets.
    pub rxq_bufs: Vec<Vec<u64>>,
    /// Round-robin over cores for rx polling.
    pub rxq_next: usize,
    /// KTX ring base per core (slow path -> fast path).
    pub txq_base: Vec<u64>,
    pub txq_tail: Vec<u32>,
    pub txq_bufs: Vec<Vec<u64>>,
    /// Ring length in entries.
    pub rxq_len: u32,
    pub txq_len: u32,
}

pub struct SlowPath {
    pub cfg: Config,
    pub pl: Arc<PipelineState>,
    pub dma: Arc<DmaMem>,
    pub(crate) pktmem: PacketMem,
    pub timeouts: TimeoutManager,
    pub routing: RoutingTable,
    pub eth_addr: EthernetAddress,
    /// Microsecond timestamp of the current loop iteration.
    pub cur_ts: u32,
    /// Eventfd the fast path and the control-socket thread kick.
    pub notifyfd: i32,
    epfd: i32,

    // TCP
    pub(crate) conns: Vec<Option<Connection>>,
    conn_free: Vec<usize>,
    pub(crate) conn_ht: HashMap<(u32, u16, u16), usize>,
    pub(crate) ports: Vec<PortState>,
    pub(crate) port_eph_hint: u16,
    pub(crate) listeners: Vec<Option<Listener>>,
    pub(crate) async_q: VecDeque<AsyncCompletion>,

    // ARP
    pub(crate) arp: heapless::LinearMap<u32, ArpEntry, ARP_CACHE_SIZE>,

    // CC
    pub(crate) cc_conns: Vec<usize>,
    cc_next: usize,
    cc_last_ts: u32,

    // NIC interface
    pub(crate) nic: NicQueues,
    pub(crate) flow_id_free: Vec<u32>,

    // Application interface
    pub(crate) apps: Vec<Option<Application>>,
    pub(crate) ux_rx: Receiver<UxConn>,
    pub(crate) free_doorbells: Vec<u16>,

    pub(crate) rng: StdRng,
}

impl SlowPath {
    pub fn new(
        cfg: Config,
        pl: Arc<PipelineState>,
        dma: Arc<DmaMem>,
        eth_addr: EthernetAddress,
        cores: usize,
    ) -> Result<SlowPath> {
        Self::new_with_socket(
            cfg,
            pl,
            dma,
            eth_addr,
            cores,
            crate::shm::layout::CONTROL_SOCKET_PATH,
        )
    }

    pub fn new_with_socket(
        cfg: Config,
        pl: Arc<PipelineState>,
        dma: Arc<DmaMem>,
        eth_addr: EthernetAddress,
        cores: usize,
        sock_path: &[u8],
    ) -> Result<SlowPath> {
        let notifyfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        anyhow::ensure!(notifyfd >= 0, "eventfd failed");
        let epfd = unsafe { libc::epoll_create1(0) };
        anyhow::ensure!(epfd >= 0, "epoll_create1 failed");
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: notifyfd as u64,
        };
        let r = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, notifyfd, &mut ev) };
        anyhow::ensure!(r == 0, "epoll_ctl failed");

        let routing = RoutingTable::new(&cfg).context("routing table")?;
        let pktmem = PacketMem::new(dma.len());

        let num_flows = pl.flowst.len();
        let mut flow_id_free: Vec<u32> = (0..num_flows as u32).collect();
        flow_id_free.reverse();

        // doorbell 0 belongs to the slow path itself
        let free_doorbells = (1..crate::shm::layout::APPCTX_NUM as u16).rev().collect();

        appif::publish_notify_fd(notifyfd);
        let (ux_tx, ux_rx) = std::sync::mpsc::channel();
        appif::uxsocket_start_path(ux_tx, notifyfd, &pl, cores, sock_path)?;

        let mut ports = Vec::with_capacity(1 << 16);
        ports.resize_with(1 << 16, PortState::default);

        let mut sp = SlowPath {
            cfg,
            pl,
            dma,
            pktmem,
            timeouts: TimeoutManager::new(),
            routing,
            eth_addr,
            cur_ts: now_us(),
            notifyfd,
            epfd,
            conns: Vec::new(),
            conn_free: Vec::new(),
            conn_ht: HashMap::new(),
            ports,
            port_eph_hint: 0,
            listeners: Vec::new(),
            async_q: VecDeque::new(),
            arp: heapless::LinearMap::new(),
            cc_conns: Vec::new(),
            cc_next: 0,
            cc_last_ts: 0,
            nic: NicQueues {
                rxq_base: Vec::new(),
                rxq_tail: Vec::new(),
                rxq_bufs: Vec::new(),
                rxq_next: 0,
                txq_base: Vec::new(),
                txq_tail: Vec::new(),
                txq_bufs: Vec::new(),
                rxq_len: 0,
                txq_len: 0,
            },
            flow_id_free,
            apps: Vec::new(),
            ux_rx,
            free_doorbells,
            rng: StdRng::from_entropy(),
        };

        sp.port_eph_hint = tcp::PORT_FIRST_EPH
            + (rand::Rng::gen_range(&mut sp.rng, 0..(u16::MAX - tcp::PORT_FIRST_EPH)) as u16);
        sp.nicif_init(cores).context("nicif init")?;
        sp.arp_init();

        Ok(sp)
    }

    /// Main event loop.
    pub fn run(&mut self, running: &AtomicBool, blocking: bool) {
        info!("slow path entering event loop");
        let mut last_print = 0u32;
        let mut idle_rounds = 0u32;

        while running.load(Ordering::Relaxed) {
            self.cur_ts = now_us();
            let mut n = 0;

            n += self.nicif_poll();
            n += self.cc_poll();
            n += self.appif_poll();
            self.tcp_poll();
            self.timeout_poll();

            if n == 0 {
                idle_rounds += 1;
                if blocking && idle_rounds > 1000 {
                    self.block();
                    idle_rounds = 0;
                }
            } else {
                idle_rounds = 0;
            }

            if !self.cfg.quiet && self.cur_ts.wrapping_sub(last_print) >= 1_000_000 {
                let ks = *KSTATS.lock().unwrap();
                info!(
                    "stats: drops={} k_rexmit={} ecn={} acks={}",
                    ks.drops, ks.kernel_rexmit, ks.ecn_marked, ks.acks
                );
                last_print = self.cur_ts;
            }
        }
        info!("slow path exiting");
    }

    fn block(&mut self) {
        let now = now_us64();
        let to_timeout = self.timeouts.next_timeout(now);
        let cc_timeout = self.cc_next_ts();
        let timeout_us = match (to_timeout, cc_timeout) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b as u64),
            (Some(a), Some(b)) => Some(a.min(b as u64)),
        };
        let timeout_ms = match timeout_us {
            None => -1,
            Some(0) => return,
            Some(us) => ((us / 1000).max(1)).min(i32::MAX as u64) as i32,
        };

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 1];
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), 1, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("slowpath block: epoll_wait failed: {err}");
            }
            return;
        }
        if n > 0 {
            let mut val = 0u64;
            unsafe {
                libc::read(
                    self.notifyfd,
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                );
            }
        }
    }

    fn timeout_poll(&mut self) {
        let now = now_us64();
        let mut fired = Vec::new();
        self.timeouts.poll(now, |tt, opaque| fired.push((tt, opaque)));
        for (tt, opaque) in fired {
            match tt {
                TimeoutType::ArpReq => self.arp_timeout(opaque as u32),
                TimeoutType::TcpHandshake | TimeoutType::TcpClosed | TimeoutType::TcpRetransmit => {
                    self.tcp_timeout(tt, opaque as usize)
                }
            }
        }
    }

    /*************************************************************************/
    /* Connection arena */

    pub(crate) fn conn_alloc_slot(&mut self, conn: Connection) -> usize {
        match self.conn_free.pop() {
            Some(id) => {
                self.conns[id] = Some(conn);
                id
            }
            None => {
                self.conns.push(Some(conn));
                self.conns.len() - 1
            }
        }
    }

    pub(crate) fn conn_free_slot(&mut self, id: usize) {
        self.conns[id] = None;
        self.conn_free.push(id);
    }

    pub(crate) fn conn(&self, id: usize) -> &Connection {
        self.conns[id].as_ref().expect("stale connection id")
    }

    pub(crate) fn conn_mut(&mut self, id: usize) -> &mut Connection {
        self.conns[id].as_mut().expect("stale connection id")
    }

    /*************************************************************************/
    /* Congestion control loop */

    /// Microseconds until the next control interval is due.
    pub fn cc_next_ts(&self) -> Option<u32> {
        let mut ts: Option<u32> = None;
        for &id in &self.cc_conns {
            let Some(c) = self.conns[id].as_ref() else {
                continue;
            };
            if c.status != ConnStatus::Open {
                continue;
            }
            let interval = c.cc.rtt.saturating_mul(self.cfg.cc_control_interval);
            let elapsed = self.cur_ts.wrapping_sub(c.cc.last_ts);
            let next = interval.saturating_sub(elapsed);
            ts = Some(ts.map_or(next, |t| t.min(next)));
        }
        ts.map(|t| {
            t.max(
                self.cfg
                    .cc_control_granularity
                    .saturating_sub(self.cur_ts.wrapping_sub(self.cc_last_ts)),
            )
        })
    }

    /// Run the congestion control interval over (up to 128) open flows.
    pub fn cc_poll(&mut self) -> usize {
        let cur_ts = self.cur_ts;
        if self.cc_conns.is_empty() {
            self.cc_last_ts = cur_ts;
            return 0;
        }

        let mut n = 0;
        let total = self.cc_conns.len();
        let start = self.cc_next % total;
        let mut processed = 0;

        for i in 0..total {
            if processed >= 128 {
                break;
            }
            let idx = (start + i) % total;
            let id = self.cc_conns[idx];
            processed += 1;
            self.cc_next = (idx + 1) % total;

            let Some(c) = self.conns[id].as_ref() else {
                continue;
            };
            if c.status != ConnStatus::Open {
                continue;
            }
            if cur_ts.wrapping_sub(c.cc.last_ts)
                < c.cc.rtt.saturating_mul(self.cfg.cc_control_interval)
            {
                continue;
            }

            let flow_id = c.flow_id;
            let raw = self.nicif_connection_stats(flow_id);

            let c = self.conns[id].as_mut().unwrap();
            let stats = cc::CcStats {
                drops: raw.drops.wrapping_sub(c.cc.last_drops),
                acks: raw.acks.wrapping_sub(c.cc.last_acks),
                ackb: raw.ackb.wrapping_sub(c.cc.last_ackb),
                ecnb: raw.ecnb.wrapping_sub(c.cc.last_ecnb),
                txp: raw.txp,
                rtt: raw.rtt,
            };
            c.cc.last_drops = raw.drops;
            c.cc.last_acks = raw.acks;
            c.cc.last_ackb = raw.ackb;
            c.cc.last_ecnb = raw.ecnb;

            {
                let mut ks = KSTATS.lock().unwrap();
                ks.drops += stats.drops as u64;
                ks.ecn_marked += stats.ecnb as u64;
                ks.acks += stats.ackb as u64;
            }

            let tx_len = c.tx_len;
            let cfg = self.cfg.clone();
            c.cc.tick(&stats, cur_ts, &cfg, tx_len);
            let rate = c.cc.rate;
            c.cc.last_ts = cur_ts;

            self.cc_issue_retransmits(id, &stats, cur_ts);
            self.nicif_connection_setrate(flow_id, rate);
            n += 1;
        }

        self.cc_last_ts = cur_ts;
        n
    }

    /// Trigger a retransmission once a flow sat on in-flight data for
    /// `cc_rexmit_ints` control intervals and two RTTs without any ack.
    fn cc_issue_retransmits(&mut self, id: usize, stats: &cc::CcStats, cur_ts: u32) {
        let cfg_ints = self.cfg.cc_rexmit_ints;
        let rtt_init = self.cfg.tcp_rtt_init;
        let c = self.conns[id].as_mut().unwrap();
        let rtt = if stats.rtt != 0 { stats.rtt } else { rtt_init };

        if stats.txp && stats.ackb == 0 {
            c.cc.cnt_tx_pending += 1;
            if c.cc.cnt_tx_pending == 1 {
                c.cc.ts_tx_pending = cur_ts;
            } else if c.cc.cnt_tx_pending >= cfg_ints
                && cur_ts.wrapping_sub(c.cc.ts_tx_pending) >= 2 * rtt
            {
                let flow_id = c.flow_id;
                let flow_group = c.flow_group;
                if self.nicif_connection_retransmit(flow_id, flow_group).is_ok() {
                    let c = self.conns[id].as_mut().unwrap();
                    c.cc.cnt_tx_pending = 0;
                    c.cc.rexmits += 1;
                    KSTATS.lock().unwrap().kernel_rexmit += 1;
                }
            }
        } else {
            c.cc.cnt_tx_pending = 0;
        }
    }

    pub(crate) fn cc_conn_register(&mut self, id: usize) {
        self.cc_conns.push(id);
    }

    pub(crate) fn cc_conn_remove(&mut self, id: usize) {
        if let Some(pos) = self.cc_conns.iter().position(|&c| c == id) {
            self.cc_conns.remove(pos);
            if self.cc_next > pos {
                self.cc_next -= 1;
            }
        } else {
            warn!("cc_conn_remove: connection {id} not registered");
        }
    }
}

impl Drop for SlowPath {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.notifyfd);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_common {
    use super::*;
    use crate::shm::layout::{KtxMsg, KTX_SIZE};
    use std::sync::atomic::AtomicU64;

    static SOCK_SEQ: AtomicU64 = AtomicU64::new(0);

    /// A slow path over a small private DMA region and a test-unique
    /// control socket address.
    pub fn test_slowpath(cores: usize) -> SlowPath {
        let cfg = Config {
            ip: 0x0a000001,
            ip_prefix: 24,
            nic_rx_len: 32,
            nic_tx_len: 32,
            tcp_rxbuf_len: 4096,
            tcp_txbuf_len: 4096,
            app_kin_len: 1024,
            app_kout_len: 1024,
            quiet: true,
            ..Default::default()
        };
        let pl = Arc::new(PipelineState::new(cores, 64));
        let dma = Arc::new(DmaMem::alloc("sp_test", 16 * 1024 * 1024, false).unwrap());
        let seq = SOCK_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = format!("\0warptcp_test_{}_{seq}", std::process::id());
        SlowPath::new_with_socket(
            cfg,
            pl,
            dma,
            EthernetAddress([0x02, 0, 0, 0, 0, 1]),
            cores,
            path.as_bytes(),
        )
        .unwrap()
    }

    impl SlowPath {
        /// A blank registered connection for tests.
        pub(crate) fn tcp_test_conn(&mut self) -> usize {
            let cc = CcConn::new(&self.cfg, self.cur_ts);
            self.conn_alloc_slot(Connection {
                opaque: 0,
                app_id: 0,
                ctx_id: 0,
                db_id: 1,
                rx_handle: None,
                tx_handle: None,
                rx_off: 0,
                tx_off: 0,
                rx_len: self.cfg.tcp_rxbuf_len,
                tx_len: self.cfg.tcp_txbuf_len,
                remote_mac: EthernetAddress::default(),
                remote_ip: 0x0a000002,
                local_ip: self.cfg.ip,
                remote_port: 80,
                local_port: 9000,
                status: ConnStatus::ArpPending,
                remote_seq: 0,
                local_seq: 0,
                syn_ts: 0,
                tx_window_scale: 0,
                rx_window_scale: 0,
                timeout_us: 0,
                to_key: None,
                to_attempts: 0,
                cc,
                ecn: false,
                flow_id: 0,
                fn_core: 0,
                flow_group: 0,
                comp_status: 0,
            })
        }

        /// Frames currently staged in core 0's admin tx ring, in slot
        /// order, consuming them.
        pub(crate) fn nic_tx_frames(&mut self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            if self.nic.txq_base.is_empty() {
                return out;
            }
            let base = self.nic.txq_base[0];
            for i in 0..self.nic.txq_len {
                let slot = base + i as u64 * KTX_SIZE as u64;
                let t = self.dma.slot_type(slot, KTX_SIZE);
                if t == 0 {
                    continue;
                }
                let mut payload = [0u8; KTX_SIZE - 1];
                self.dma.read(slot, &mut payload);
                if let Some(KtxMsg::Packet { addr, len } | KtxMsg::PacketNoTs { addr, len }) =
                    KtxMsg::parse(t, &payload)
                {
                    let mut pkt = vec![0u8; len as usize];
                    self.dma.read(addr, &mut pkt);
                    out.push(pkt);
                }
                self.dma.clear_slot(slot, KTX_SIZE);
            }
            out
        }
    }
}
