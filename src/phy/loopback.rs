use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{LinkPort, LinkQueue, PacketBuf};
use crate::wire::EthernetAddress;

/// A loopback link port.
///
/// Frames transmitted on any queue land in a shared receive queue, steered
/// by the flow group a test assigns (or group 0). Useful to exercise the
/// dataplane without a device; tests can also inject frames directly and
/// inspect what the dataplane emitted.
pub struct Loopback {
    inner: Arc<Mutex<Inner>>,
    mac: EthernetAddress,
}

struct Inner {
    /// Frames waiting for rx, per core.
    rx: Vec<VecDeque<PacketBuf>>,
    /// Everything transmitted, in order.
    tx_log: VecDeque<PacketBuf>,
    rss: Vec<u16>,
}

impl Loopback {
    pub fn new(cores: usize, mac: EthernetAddress) -> Loopback {
        Loopback {
            inner: Arc::new(Mutex::new(Inner {
                rx: (0..cores).map(|_| VecDeque::new()).collect(),
                tx_log: VecDeque::new(),
                rss: vec![0; crate::shm::layout::MAX_FLOWGROUPS],
            })),
            mac,
        }
    }

    /// Inject a frame as if it arrived from the wire; it is steered to the
    /// core the RSS table maps its flow group to.
    pub fn inject(&self, frame: &[u8], flow_group: u16) {
        let mut inner = self.inner.lock().unwrap();
        let core = inner.rss[flow_group as usize % inner.rss.len()] as usize;
        let core = core.min(inner.rx.len() - 1);
        inner
            .rx
            .get_mut(core)
            .unwrap()
            .push_back(PacketBuf::from_frame(frame, flow_group));
    }

    /// Take the next transmitted frame, if any.
    pub fn pop_tx(&self) -> Option<PacketBuf> {
        self.inner.lock().unwrap().tx_log.pop_front()
    }

    /// Number of transmitted frames not yet popped.
    pub fn tx_pending(&self) -> usize {
        self.inner.lock().unwrap().tx_log.len()
    }
}

impl LinkPort for Loopback {
    fn mac_addr(&self) -> EthernetAddress {
        self.mac
    }

    fn mtu(&self) -> usize {
        1518
    }

    fn offloads_checksum(&self) -> bool {
        false
    }

    fn write_rss_table(&self, table: &[u16]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rss[..table.len()].copy_from_slice(table);
    }

    fn open_queue(&self, core: u16) -> Box<dyn LinkQueue> {
        Box::new(LoopbackQueue {
            inner: self.inner.clone(),
            core: core as usize,
        })
    }
}

struct LoopbackQueue {
    inner: Arc<Mutex<Inner>>,
    core: usize,
}

impl LinkQueue for LoopbackQueue {
    fn poll_rx(&mut self, bufs: &mut Vec<PacketBuf>, max: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let q = &mut inner.rx[self.core];
        let n = max.min(q.len());
        for _ in 0..n {
            bufs.push(q.pop_front().unwrap());
        }
        n
    }

    fn tx_burst(&mut self, frames: &mut Vec<PacketBuf>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = frames.len();
        for f in frames.drain(..) {
            inner.tx_log.push_back(f);
        }
        n
    }

    fn irq_ctl(&mut self, _enable: bool) {}

    fn irq_fd(&self) -> Option<i32> {
        None
    }
}
