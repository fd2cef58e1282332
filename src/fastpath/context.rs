use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

use log::{error, info, warn};

use super::appctx::{self, ActiveRings};
use super::flows::{self, FlowsEnv, QmanVerdict, RxVerdict};
use super::kernel;
use super::qman::{Grant, QueueManager};
use super::state::PipelineState;
use super::{BATCH_SIZE, MAX_POLL_ROUNDS, RX_BATCH, TXBUF_SIZE};
use crate::config::Config;
use crate::phy::{LinkQueue, PacketBuf};
use crate::shm::layout::{ArxConnUpdate, APPCTX_NUM, ATX_FL_TXDONE, VMST_NUM};
use crate::shm::DmaMem;
use crate::time::now_us;
use crate::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Packet, TcpPacket};

/// Sending half of a core's flow-forwarding channel (steering changes).
pub type ForwardTx = Sender<u32>;
/// Receiving half, owned by the core itself.
pub type ForwardRx = Receiver<u32>;

/// Notifications not yet written to an ARX ring, with a retry budget.
struct ArxPending {
    vm_id: u16,
    db_id: u16,
    update: ArxConnUpdate,
    attempts: u32,
}

/// Retry budget for a blocked ARX notification before it is dropped.
const ARX_RETRY_MAX: u32 = 8;

/// One fast-path core: pinned, busy-polling, exclusively owning its link
/// queue pair, queue manager, and admin queues.
pub struct DataplaneContext {
    core_id: u16,
    pl: Arc<PipelineState>,
    dma: Arc<DmaMem>,
    link: Box<dyn LinkQueue>,
    local_mac: EthernetAddress,
    offload_checksum: bool,
    future_acks: bool,

    pub qman: QueueManager,
    tx_pending: Vec<PacketBuf>,
    arx_cache: Vec<ArxPending>,
    arx_retry: Vec<ArxPending>,

    fwd_rx: ForwardRx,
    fwd_peers: Vec<ForwardTx>,

    /// Own wakeup eventfd (registered with the pipeline as kctx evfd).
    evfd: i32,
    /// Eventfd the slow path sleeps on.
    slowpath_fd: i32,
    epfd: i32,

    rings: ActiveRings,
    poll_rounds: u32,

    /// Slow-path queue overflow drops.
    pub kernel_drop: u64,
}

impl DataplaneContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core_id: u16,
        cfg: &Config,
        pl: Arc<PipelineState>,
        dma: Arc<DmaMem>,
        link: Box<dyn LinkQueue>,
        local_mac: EthernetAddress,
        offload_checksum: bool,
        fwd_rx: ForwardRx,
        fwd_peers: Vec<ForwardTx>,
        slowpath_fd: i32,
    ) -> anyhow::Result<DataplaneContext> {
        let num_flows = pl.flowst.len();

        let evfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        anyhow::ensure!(evfd >= 0, "eventfd failed: {}", crate::shm::dma::errno_str());
        let epfd = unsafe { libc::epoll_create1(0) };
        anyhow::ensure!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            crate::shm::dma::errno_str()
        );

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: evfd as u64,
        };
        let r = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, evfd, &mut ev) };
        anyhow::ensure!(r == 0, "epoll_ctl evfd failed");
        if let Some(irq) = link.irq_fd() {
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: irq as u64,
            };
            let r = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, irq, &mut ev) };
            anyhow::ensure!(r == 0, "epoll_ctl irq fd failed");
        }

        pl.kctx[core_id as usize].evfd.store(evfd, Ordering::Release);

        Ok(DataplaneContext {
            core_id,
            qman: QueueManager::new(core_id as u32, VMST_NUM, num_flows),
            pl,
            dma,
            link,
            local_mac,
            offload_checksum,
            future_acks: cfg.tcp_future_acks,
            tx_pending: Vec::with_capacity(TXBUF_SIZE),
            arx_cache: Vec::with_capacity(BATCH_SIZE),
            arx_retry: Vec::new(),
            fwd_rx,
            fwd_peers,
            evfd,
            slowpath_fd,
            epfd,
            rings: ActiveRings::new(),
            poll_rounds: 0,
            kernel_drop: 0,
        })
    }

    pub fn core_id(&self) -> u16 {
        self.core_id
    }

    pub fn evfd(&self) -> i32 {
        self.evfd
    }

    /// One steady-state iteration. The step order is contractual; measured
    /// throughput depends on it.
    pub fn poll_iteration(&mut self) -> usize {
        let ts = now_us();
        let mut n = 0;

        n += self.poll_rx(ts);
        self.flush_tx();
        n += self.poll_qman_fwd();
        n += self.poll_qman(ts);
        n += self.poll_queues(ts);
        n += self.poll_kernel(ts);
        self.arx_cache_flush();
        self.flush_tx();

        n
    }

    /// Poll until `running` clears; optionally block when idle.
    pub fn run(&mut self, running: &AtomicBool, blocking: bool) {
        info!("dataplane core {} entering poll loop", self.core_id);
        let mut idle_rounds = 0u32;
        while running.load(Ordering::Relaxed) {
            let n = self.poll_iteration();
            if n == 0 {
                idle_rounds += 1;
                if blocking && idle_rounds > 10_000 {
                    self.block();
                    idle_rounds = 0;
                }
            } else {
                idle_rounds = 0;
            }
        }
        info!("dataplane core {} exiting", self.core_id);
    }

    fn block(&mut self) {
        self.link.irq_ctl(true);

        let timeout_ms = match self.qman.next_ts(now_us()) {
            None => -1,
            Some(0) => 0,
            Some(us) => (us / 1000).max(1) as i32,
        };

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), 2, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("dataplane block: epoll_wait failed: {err}");
            }
        }
        for ev in events.iter().take(n.max(0) as usize) {
            if ev.u64 == self.evfd as u64 {
                let mut val = 0u64;
                unsafe {
                    libc::read(
                        self.evfd,
                        &mut val as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    );
                }
            }
        }

        self.link.irq_ctl(false);
    }

    /// Pull a burst of frames, look up flows, and run per-flow processing;
    /// everything else goes up to the slow path.
    fn poll_rx(&mut self, ts: u32) -> usize {
        let pl = self.pl.clone();
        let max = RX_BATCH.min(TXBUF_SIZE.saturating_sub(self.tx_pending.len()));
        if max == 0 {
            return 0;
        }

        let mut bufs = Vec::with_capacity(max);
        let n = self.link.poll_rx(&mut bufs, max);
        if n == 0 {
            return 0;
        }

        for buf in bufs {
            match lookup_flow(&pl, &buf) {
                Some(flow_id) => match flows::parse_packet(&buf) {
                    Some(opts) => {
                        match flows::flows_packet(self, &pl, flow_id, buf, &opts, ts) {
                            RxVerdict::Consumed | RxVerdict::Free(_) => (),
                            RxVerdict::SlowPath(buf) => self.to_kernel(&pl, &buf),
                        }
                    }
                    None => self.to_kernel(&pl, &buf),
                },
                None => self.to_kernel(&pl, &buf),
            }
        }

        n
    }

    fn to_kernel(&mut self, pl: &PipelineState, buf: &PacketBuf) {
        if kernel::kernel_packet(pl, &self.dma, self.core_id, buf, &mut self.kernel_drop) {
            notify_fd(self.slowpath_fd);
        }
    }

    /// Drain the in-context transmit array to the link port; the unsent
    /// suffix stays at the front for the next attempt.
    fn flush_tx(&mut self) {
        if self.tx_pending.is_empty() {
            return;
        }
        self.link.tx_burst(&mut self.tx_pending);
    }

    /// Re-arm flows other cores forwarded here after a steering change.
    fn poll_qman_fwd(&mut self) -> usize {
        let pl = self.pl.clone();
        let mut n = 0;
        loop {
            match self.fwd_rx.try_recv() {
                Ok(flow_id) => {
                    flows::flows_qman_fwd(self, &pl, flow_id);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        n
    }

    /// Obtain grants from the queue manager and emit one segment each.
    fn poll_qman(&mut self, ts: u32) -> usize {
        let pl = self.pl.clone();
        let max = BATCH_SIZE.min(TXBUF_SIZE.saturating_sub(self.tx_pending.len()));
        if max == 0 {
            return 0;
        }

        let mut grants = [Grant::default(); BATCH_SIZE];
        let n = self.qman.poll(&mut grants[..max]);

        for g in &grants[..n] {
            match flows::flows_qman(self, &pl, self.core_id, g.flow_id, ts) {
                QmanVerdict::Sent | QmanVerdict::Empty => (),
                QmanVerdict::Forward(new_core) => {
                    let dst = new_core as usize;
                    if dst < self.fwd_peers.len() && self.fwd_peers[dst].send(g.flow_id).is_ok() {
                        // wake the new owner
                        let fd = self.pl.kctx[dst].evfd.load(Ordering::Acquire);
                        notify_fd(fd);
                    } else {
                        warn!("poll_qman: forwarding flow {} to core {new_core} failed", g.flow_id);
                    }
                }
            }
        }

        n
    }

    /// Fetch connupdates from application contexts, amortizing cache misses
    /// by touching only recently active contexts most rounds.
    fn poll_queues(&mut self, ts: u32) -> usize {
        let total = if self.poll_rounds % MAX_POLL_ROUNDS == 0 {
            self.poll_all_queues(ts)
        } else {
            self.poll_active_queues(ts)
        };
        self.poll_rounds = self.poll_rounds.wrapping_add(1);
        total
    }

    fn bump_entry(&mut self, pl: &PipelineState, vm: u32, cid: u32, ts: u32) -> bool {
        let regs = &pl.appctx[self.core_id as usize][vm as usize][cid as usize];
        match appctx::atx_fetch(regs, &self.dma) {
            Some(e) => {
                self.rings.mark_busy(vm, cid);
                if (e.flow_id as usize) < pl.flowst.len() {
                    flows::flows_bump(
                        self,
                        pl,
                        e.flow_id,
                        e.bump_seq,
                        e.rx_bump,
                        e.tx_bump,
                        e.flags & ATX_FL_TXDONE != 0,
                        ts,
                    );
                } else {
                    warn!("poll_queues: invalid flow id {}", e.flow_id);
                }
                true
            }
            None => {
                self.rings.mark_idle(vm, cid);
                false
            }
        }
    }

    fn poll_all_queues(&mut self, ts: u32) -> usize {
        let pl = self.pl.clone();
        let max = BATCH_SIZE;
        let mut total = 0;

        'outer: for _ in 0..VMST_NUM {
            let vm = self.rings.poll_next_vm;
            self.rings.poll_next_vm = (vm + 1) % VMST_NUM as u32;

            for _ in 0..APPCTX_NUM {
                let cid = self.rings.next_ctx_rotor(vm);
                for _ in 0..BATCH_SIZE {
                    if !self.bump_entry(&pl, vm, cid, ts) {
                        break;
                    }
                    total += 1;
                    if total >= max {
                        break 'outer;
                    }
                }
            }
        }

        for vm in 0..VMST_NUM {
            for cid in 0..APPCTX_NUM {
                appctx::arx_rxq_probe(&pl.appctx[self.core_id as usize][vm][cid], &self.dma);
            }
        }

        total
    }

    fn poll_active_queues(&mut self, ts: u32) -> usize {
        let pl = self.pl.clone();
        let max = BATCH_SIZE;
        let mut total = 0;

        let pairs = self.rings.active_pairs();
        'outer: for (vm, cid) in pairs {
            for _ in 0..BATCH_SIZE {
                if !self.bump_entry(&pl, vm, cid, ts) {
                    break;
                }
                total += 1;
                if total >= max {
                    break 'outer;
                }
            }
        }

        for (vm, cid) in self.rings.active_pairs() {
            appctx::arx_rxq_probe(
                &pl.appctx[self.core_id as usize][vm as usize][cid as usize],
                &self.dma,
            );
        }

        total
    }

    /// Admin commands from the slow path.
    fn poll_kernel(&mut self, ts: u32) -> usize {
        let pl = self.pl.clone();
        let max = 8.min(TXBUF_SIZE.saturating_sub(self.tx_pending.len()));
        let mut total = 0;
        for _ in 0..max {
            if !kernel::kernel_poll(self, &pl, self.core_id, ts) {
                break;
            }
            total += 1;
        }
        total
    }

    /// Write out the batched ARX notifications and ring one doorbell per
    /// destination context.
    fn arx_cache_flush(&mut self) {
        if self.arx_cache.is_empty() && self.arx_retry.is_empty() {
            return;
        }
        let pl = self.pl.clone();
        let core = self.core_id as usize;

        let mut kicked: Vec<(u16, u16)> = Vec::new();
        let mut blocked: Vec<ArxPending> = Vec::new();

        let pending: Vec<ArxPending> = std::mem::take(&mut self.arx_retry)
            .into_iter()
            .chain(std::mem::take(&mut self.arx_cache))
            .collect();
        for mut p in pending {
            let regs = &pl.appctx[core][p.vm_id as usize][p.db_id as usize];
            match appctx::arx_write(regs, &self.dma, &p.update) {
                Ok(()) => {
                    if !kicked.contains(&(p.vm_id, p.db_id)) {
                        kicked.push((p.vm_id, p.db_id));
                    }
                }
                Err(()) => {
                    p.attempts += 1;
                    if p.attempts >= ARX_RETRY_MAX {
                        warn!("arx_cache_flush: dropping notification after retries");
                        self.kernel_drop += 1;
                    } else {
                        blocked.push(p);
                    }
                }
            }
        }
        self.arx_retry = blocked;

        for (vm, db) in kicked {
            appctx::kick(&pl.appctx[core][vm as usize][db as usize]);
        }
    }
}

impl FlowsEnv for DataplaneContext {
    fn dma(&self) -> &DmaMem {
        &self.dma
    }

    fn local_mac(&self) -> EthernetAddress {
        self.local_mac
    }

    fn offloads_checksum(&self) -> bool {
        self.offload_checksum
    }

    fn allow_future_acks(&self) -> bool {
        self.future_acks
    }

    fn qman_set(&mut self, vm_id: u16, flow_id: u32, rate: u32, avail: u32, max_chunk: u16, flags: u8) {
        self.qman.set(vm_id, flow_id, rate, avail, max_chunk, flags);
    }

    fn tx_frame(&mut self, frame: PacketBuf) {
        self.tx_pending.push(frame);
    }

    fn arx_add(&mut self, vm_id: u16, db_id: u16, update: ArxConnUpdate) {
        self.arx_cache.push(ArxPending {
            vm_id,
            db_id,
            update,
            attempts: 0,
        });
    }
}

impl Drop for DataplaneContext {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.evfd);
        }
    }
}

/// Extract the 4-tuple of a TCP frame and look it up in the flow table.
fn lookup_flow(pl: &PipelineState, buf: &PacketBuf) -> Option<u32> {
    let frame = EthernetFrame::new_checked(buf.bytes()).ok()?;
    if frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
    if ip.next_header() != crate::wire::IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;

    super::flowht::lookup(
        &pl.flowht,
        &pl.flowst,
        u32::from(ip.dst_addr()),
        tcp.dst_port(),
        u32::from(ip.src_addr()),
        tcp.src_port(),
    )
}

/// Signal an eventfd, ignoring unset descriptors.
pub(crate) fn notify_fd(fd: i32) {
    if fd <= 0 {
        return;
    }
    let val = 1u64;
    let ret = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        warn!("notify_fd: write failed");
    }
}
