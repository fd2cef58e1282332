use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// What a timeout is armed for; the opaque value is interpreted per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutType {
    /// ARP request retry (opaque = IP address).
    ArpReq,
    /// TCP handshake retry (opaque = connection id).
    TcpHandshake,
    /// TCP retransmission (opaque = connection id).
    TcpRetransmit,
    /// Closed connection ready to be freed (opaque = connection id).
    TcpClosed,
}

/// Handle to an armed timeout; disarming is O(1) amortized because it only
/// invalidates the slot generation, leaving the heap entry to be skipped
/// lazily when it surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutKey {
    slot: usize,
    gen: u64,
}

#[derive(PartialEq, Eq)]
struct HeapEnt {
    deadline: u64,
    slot: usize,
    gen: u64,
}

impl Ord for HeapEnt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.gen.cmp(&other.gen))
    }
}

impl PartialOrd for HeapEnt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Slot {
    gen: u64,
    armed: bool,
    tt: TimeoutType,
    opaque: u64,
}

/// Deadline-ordered timeout manager for the slow path.
///
/// Deadlines are absolute 64-bit microseconds, so ordering never wraps.
pub struct TimeoutManager {
    heap: BinaryHeap<Reverse<HeapEnt>>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    armed: usize,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutManager {
    pub fn new() -> TimeoutManager {
        TimeoutManager {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            armed: 0,
        }
    }

    /// Arm a timeout `delay_us` from `now`.
    pub fn arm(&mut self, now: u64, delay_us: u32, tt: TimeoutType, opaque: u64) -> TimeoutKey {
        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.slots.push(Slot {
                    gen: 0,
                    armed: false,
                    tt,
                    opaque,
                });
                self.slots.len() - 1
            }
        };
        let s = &mut self.slots[slot];
        s.gen += 1;
        s.armed = true;
        s.tt = tt;
        s.opaque = opaque;
        let gen = s.gen;
        self.armed += 1;

        self.heap.push(Reverse(HeapEnt {
            deadline: now + delay_us as u64,
            slot,
            gen,
        }));
        TimeoutKey { slot, gen }
    }

    /// Cancel an armed timeout. Frequently called on the ACK path, so this
    /// only flips the slot state; the stale heap entry is dropped when it
    /// reaches the top.
    pub fn disarm(&mut self, key: TimeoutKey) {
        if let Some(s) = self.slots.get_mut(key.slot) {
            if s.gen == key.gen && s.armed {
                s.armed = false;
                self.armed -= 1;
                self.free.push(key.slot);
            }
        }
    }

    /// Microseconds until the next armed deadline; `None` when idle.
    pub fn next_timeout(&mut self, now: u64) -> Option<u64> {
        loop {
            let Reverse(top) = self.heap.peek()?;
            let s = &self.slots[top.slot];
            if !s.armed || s.gen != top.gen {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline.saturating_sub(now));
        }
    }

    /// Fire everything due at `now`.
    pub fn poll<F: FnMut(TimeoutType, u64)>(&mut self, now: u64, mut fire: F) {
        loop {
            match self.heap.peek() {
                Some(Reverse(top)) if top.deadline <= now => (),
                _ => break,
            }
            let Reverse(top) = self.heap.pop().unwrap();
            let s = &mut self.slots[top.slot];
            if !s.armed || s.gen != top.gen {
                continue;
            }
            s.armed = false;
            self.armed -= 1;
            self.free.push(top.slot);
            fire(s.tt, s.opaque);
        }
    }

    pub fn armed_count(&self) -> usize {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut tm = TimeoutManager::new();
        tm.arm(0, 300, TimeoutType::ArpReq, 3);
        tm.arm(0, 100, TimeoutType::TcpHandshake, 1);
        tm.arm(0, 200, TimeoutType::TcpClosed, 2);

        let mut fired = Vec::new();
        tm.poll(250, |_, op| fired.push(op));
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(tm.next_timeout(250), Some(50));

        tm.poll(300, |_, op| fired.push(op));
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(tm.next_timeout(300), None);
    }

    #[test]
    fn disarm_prevents_firing() {
        let mut tm = TimeoutManager::new();
        let k = tm.arm(0, 100, TimeoutType::TcpHandshake, 1);
        tm.arm(0, 200, TimeoutType::TcpHandshake, 2);
        tm.disarm(k);

        let mut fired = Vec::new();
        tm.poll(1000, |_, op| fired.push(op));
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn slot_reuse_does_not_resurrect() {
        let mut tm = TimeoutManager::new();
        let k1 = tm.arm(0, 100, TimeoutType::ArpReq, 1);
        tm.disarm(k1);
        // new arm reuses the slot with a fresh generation
        tm.arm(0, 500, TimeoutType::ArpReq, 2);

        let mut fired = Vec::new();
        tm.poll(200, |_, op| fired.push(op));
        assert!(fired.is_empty());
        tm.poll(500, |_, op| fired.push(op));
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn stale_disarm_key_ignored() {
        let mut tm = TimeoutManager::new();
        let k1 = tm.arm(0, 100, TimeoutType::ArpReq, 1);
        tm.disarm(k1);
        let _k2 = tm.arm(0, 100, TimeoutType::ArpReq, 2);
        // double-disarm with the old key must not kill the new timeout
        tm.disarm(k1);
        let mut fired = Vec::new();
        tm.poll(100, |_, op| fired.push(op));
        assert_eq!(fired, vec![2]);
    }
}
