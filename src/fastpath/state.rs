use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::shm::layout::{APPCTX_NUM, MAX_FLOWGROUPS, VMST_NUM};
use crate::wire::EthernetAddress;

/// Flow is handed to the slow path; fast path must not touch it.
pub const FLOWST_SLOWPATH: u64 = 1;
/// Flow negotiated ECN.
pub const FLOWST_ECN: u64 = 8;
/// App closed its transmit direction.
pub const FLOWST_TXFIN: u64 = 16;
/// FIN received from the peer.
pub const FLOWST_RXFIN: u64 = 32;
/// The receive buffer DMA offset occupies the bits above the flags.
pub const FLOWST_RX_MASK: u64 = !63u64;

/// Mutable per-flow state, guarded by the owning [`FlowSt`] lock.
///
/// Field layout mirrors what the fast path touches per packet: identity and
/// buffer geometry up front, receive stream, then transmit stream.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    /// Opaque flow identifier the application picked.
    pub opaque: u64,
    /// Receive buffer DMA offset (64-aligned) combined with FLOWST_* flags.
    pub rx_base_sp: u64,
    /// Transmit buffer DMA offset.
    pub tx_base: u64,
    pub rx_len: u32,
    pub tx_len: u32,
    /// Connection 4-tuple (also published through the slot atomics for
    /// lock-free lookup).
    pub local_ip: u32,
    pub remote_ip: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_mac: EthernetAddress,
    /// App context (doorbell) receiving notifications for this flow.
    pub db_id: u16,
    /// Tenant the flow is accounted to.
    pub vm_id: u16,
    /// RSS bucket steering this flow to a core.
    pub flow_group: u16,
    /// Sequence number of queue pointer bumps.
    pub bump_seq: u16,
    pub tx_window_scale: u8,
    pub rx_window_scale: u8,

    /// Duplicate ACK count.
    pub rx_dupack_cnt: u16,
    /// Bytes unused in the receive buffer.
    pub rx_avail: u32,
    /// Offset in the receive buffer for the next in-order byte.
    pub rx_next_pos: u32,
    /// Next sequence number expected.
    pub rx_next_seq: u32,
    /// Receive window the peer advertised, scaled.
    pub rx_remote_avail: u32,
    /// Start of the out-of-order received interval.
    pub rx_ooo_start: u32,
    /// Length of the out-of-order received interval (0 = none).
    pub rx_ooo_len: u32,

    /// Bytes in the transmit buffer not yet handed to the pacer.
    pub tx_avail: u32,
    /// Bytes sent but not yet acknowledged.
    pub tx_sent: u32,
    /// Offset in the transmit buffer for the next segment.
    pub tx_next_pos: u32,
    /// Sequence number of the next segment.
    pub tx_next_seq: u32,
    /// Timestamp to echo in the next packet.
    pub tx_next_ts: u32,
    /// Congestion control rate [kbps].
    pub tx_rate: u32,
    pub cnt_tx_drops: u16,
    pub cnt_rx_acks: u16,
    pub cnt_rx_ack_bytes: u32,
    pub cnt_rx_ecn_bytes: u32,
    /// Smoothed RTT estimate [us].
    pub rtt_est: u32,
}

impl FlowState {
    #[inline]
    pub fn rx_base(&self) -> u64 {
        self.rx_base_sp & FLOWST_RX_MASK
    }
}

/// One slot in the flow state arena.
///
/// The identity tuple is kept in atomics so the hash table lookup can
/// compare it without taking the lock; everything else sits behind a
/// test-and-set spinlock. One cache-line-aligned record per flow.
#[repr(align(128))]
pub struct FlowSt {
    local_ip: AtomicU32,
    remote_ip: AtomicU32,
    /// local port in the low half, remote port in the high half.
    ports: AtomicU32,
    lock: AtomicU32,
    data: UnsafeCell<FlowState>,
}

unsafe impl Sync for FlowSt {}
unsafe impl Send for FlowSt {}

impl Default for FlowSt {
    fn default() -> Self {
        FlowSt {
            local_ip: AtomicU32::new(0),
            remote_ip: AtomicU32::new(0),
            ports: AtomicU32::new(0),
            lock: AtomicU32::new(0),
            data: UnsafeCell::new(FlowState::default()),
        }
    }
}

impl FlowSt {
    /// Spin until the flow lock is held.
    ///
    /// Never suspends while held; every path through the fast path releases
    /// before returning to the poll loop.
    pub fn lock(&self) -> FlowGuard<'_> {
        while self
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
        FlowGuard { fs: self }
    }

    /// Publish the identity tuple; ordered before the hash table insert.
    pub fn set_tuple(&self, local_ip: u32, remote_ip: u32, local_port: u16, remote_port: u16) {
        self.local_ip.store(local_ip, Ordering::Relaxed);
        self.remote_ip.store(remote_ip, Ordering::Relaxed);
        self.ports.store(
            local_port as u32 | ((remote_port as u32) << 16),
            Ordering::Release,
        );
    }

    /// Compare the identity tuple without taking the lock.
    #[inline]
    pub fn tuple_matches(
        &self,
        local_ip: u32,
        remote_ip: u32,
        local_port: u16,
        remote_port: u16,
    ) -> bool {
        let ports = local_port as u32 | ((remote_port as u32) << 16);
        self.ports.load(Ordering::Acquire) == ports
            && self.local_ip.load(Ordering::Relaxed) == local_ip
            && self.remote_ip.load(Ordering::Relaxed) == remote_ip
    }

    pub fn tuple(&self) -> (u32, u32, u16, u16) {
        let ports = self.ports.load(Ordering::Acquire);
        (
            self.local_ip.load(Ordering::Relaxed),
            self.remote_ip.load(Ordering::Relaxed),
            ports as u16,
            (ports >> 16) as u16,
        )
    }
}

/// Holds the flow spinlock; dereferences to the protected state.
pub struct FlowGuard<'a> {
    fs: &'a FlowSt,
}

impl Deref for FlowGuard<'_> {
    type Target = FlowState;

    fn deref(&self) -> &FlowState {
        unsafe { &*self.fs.data.get() }
    }
}

impl DerefMut for FlowGuard<'_> {
    fn deref_mut(&mut self) -> &mut FlowState {
        unsafe { &mut *self.fs.data.get() }
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.fs.lock.store(0, Ordering::Release);
    }
}

/// Entry is in use.
pub const FLOWHTE_VALID: u32 = 1 << 31;
/// Displacement from the home slot sits above the flow id.
pub const FLOWHTE_POSSHIFT: u32 = 29;
pub const FLOWHTE_ID_MASK: u32 = (1 << FLOWHTE_POSSHIFT) - 1;

/// Flow lookup table entry.
///
/// `flow_id` carries the valid bit and displacement in its top bits; on
/// insert the hash is stored before the id so a concurrent lookup never
/// sees a valid id with a stale hash.
#[derive(Default)]
pub struct FlowHtEntry {
    pub flow_id: AtomicU32,
    pub flow_hash: AtomicU32,
}

/// Ring registers for one application context queue pair on one core, and
/// for the per-core slow-path admin queues (same shape).
///
/// The slow path configures `*_base` and publishes by storing `*_len` last;
/// a zero `tx_len` means "not in use". Heads and `rx_avail` are only
/// touched by the owning fast-path core.
#[derive(Default)]
pub struct AppCtxRegs {
    pub rx_base: AtomicU64,
    pub tx_base: AtomicU64,
    pub rx_len: AtomicU32,
    pub tx_len: AtomicU32,
    pub evfd: AtomicI32,

    pub rx_head: AtomicU32,
    pub tx_head: AtomicU32,
    pub rx_avail: AtomicU32,
}

/// Per-application registry visible to the fast path.
pub struct AppSt {
    pub ctx_num: AtomicU16,
    pub ctx_ids: [AtomicU16; crate::shm::layout::APPST_CTX_NUM],
}

impl Default for AppSt {
    fn default() -> Self {
        AppSt {
            ctx_num: AtomicU16::new(0),
            ctx_ids: std::array::from_fn(|_| AtomicU16::new(0)),
        }
    }
}

/// Process-wide pipeline state shared between all fast-path cores and the
/// slow path.
pub struct PipelineState {
    /// App context registers, indexed `[core][vm][ctx]`.
    pub appctx: Vec<Vec<Vec<AppCtxRegs>>>,
    /// Flow state arena, indexed by flow id.
    pub flowst: Box<[FlowSt]>,
    /// Flow lookup table.
    pub flowht: Box<[FlowHtEntry]>,
    /// Admin queue registers per core.
    pub kctx: Vec<AppCtxRegs>,
    /// Application registry.
    pub appst: Vec<AppSt>,
    /// RSS bucket -> core steering.
    pub flow_group_steering: Box<[AtomicU8]>,
}

impl PipelineState {
    pub fn new(cores: usize, num_flows: usize) -> PipelineState {
        let appctx = (0..cores)
            .map(|_| {
                (0..VMST_NUM)
                    .map(|_| (0..APPCTX_NUM).map(|_| AppCtxRegs::default()).collect())
                    .collect()
            })
            .collect();
        let mut flowst = Vec::with_capacity(num_flows);
        flowst.resize_with(num_flows, FlowSt::default);
        let ht_entries = num_flows * 2;
        let mut flowht = Vec::with_capacity(ht_entries);
        flowht.resize_with(ht_entries, FlowHtEntry::default);
        let mut steering = Vec::with_capacity(MAX_FLOWGROUPS);
        steering.resize_with(MAX_FLOWGROUPS, || AtomicU8::new(0));

        PipelineState {
            appctx,
            flowst: flowst.into_boxed_slice(),
            flowht: flowht.into_boxed_slice(),
            kctx: (0..cores).map(|_| AppCtxRegs::default()).collect(),
            appst: (0..crate::shm::layout::APPST_NUM).map(|_| AppSt::default()).collect(),
            flow_group_steering: steering.into_boxed_slice(),
        }
    }

    /// Core currently steering the given flow group.
    #[inline]
    pub fn steering(&self, flow_group: u16) -> u16 {
        self.flow_group_steering[flow_group as usize].load(Ordering::Relaxed) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_lock_guards_data() {
        let fs = FlowSt::default();
        {
            let mut g = fs.lock();
            g.tx_avail = 99;
        }
        let g = fs.lock();
        assert_eq!(g.tx_avail, 99);
    }

    #[test]
    fn tuple_publication() {
        let fs = FlowSt::default();
        fs.set_tuple(0x0a000001, 0x0a000002, 1234, 80);
        assert!(fs.tuple_matches(0x0a000001, 0x0a000002, 1234, 80));
        assert!(!fs.tuple_matches(0x0a000001, 0x0a000002, 1234, 81));
        assert_eq!(fs.tuple(), (0x0a000001, 0x0a000002, 1234, 80));
    }

    #[test]
    fn flowst_alignment() {
        assert_eq!(std::mem::align_of::<FlowSt>(), 128);
        assert!(std::mem::size_of::<FlowSt>() % 128 == 0);
    }
}
