use std::sync::atomic::Ordering;

use log::warn;

use super::state::AppCtxRegs;
use super::{BATCH_SIZE, MAX_NULL_ROUNDS};
use crate::shm::layout::{
    ArxConnUpdate, AtxConnUpdate, APPCTX_NUM, ARX_CONNUPDATE, ARX_SIZE, ATX_CONNUPDATE, ATX_SIZE,
    VMST_NUM,
};
use crate::shm::DmaMem;

/// Fetch the next pending connupdate from a context's ATX queue.
///
/// Returns `None` when the context is unused or its queue is empty. The
/// slot is released back to the application once the entry is copied out.
pub fn atx_fetch(regs: &AppCtxRegs, dma: &DmaMem) -> Option<AtxConnUpdate> {
    let tx_len = regs.tx_len.load(Ordering::Acquire);
    if tx_len == 0 {
        return None;
    }
    let tx_base = regs.tx_base.load(Ordering::Relaxed);
    let head = regs.tx_head.load(Ordering::Relaxed);

    let off = tx_base + head as u64;
    let t = dma.slot_type(off, ATX_SIZE);
    if t == 0 {
        return None;
    }
    if t != ATX_CONNUPDATE {
        warn!("atx_fetch: unknown type {t}");
        dma.clear_slot(off, ATX_SIZE);
        return None;
    }

    let mut payload = [0u8; ATX_SIZE - 1];
    dma.read(off, &mut payload);
    let entry = AtxConnUpdate::parse(&payload);
    dma.clear_slot(off, ATX_SIZE);

    let mut nhead = head + ATX_SIZE as u32;
    if nhead >= tx_len {
        nhead -= tx_len;
    }
    regs.tx_head.store(nhead, Ordering::Relaxed);

    Some(entry)
}

/// Reserve the next ARX slot of a context and write `update` into it.
///
/// Fails when the ring has no reclaimed space left; the caller retries the
/// notification on the next iteration or drops it.
pub fn arx_write(regs: &AppCtxRegs, dma: &DmaMem, update: &ArxConnUpdate) -> Result<(), ()> {
    let rx_len = regs.rx_len.load(Ordering::Acquire);
    if rx_len == 0 {
        return Err(());
    }
    if regs.rx_avail.load(Ordering::Relaxed) == 0 {
        return Err(());
    }
    let rx_base = regs.rx_base.load(Ordering::Relaxed);
    let head = regs.rx_head.load(Ordering::Relaxed);

    let off = rx_base + head as u64;
    let mut payload = [0u8; ARX_SIZE - 1];
    update.emit(&mut payload);
    dma.publish_slot(off, ARX_SIZE, &payload, ARX_CONNUPDATE);

    let mut nhead = head + ARX_SIZE as u32;
    if nhead >= rx_len {
        nhead -= rx_len;
    }
    regs.rx_head.store(nhead, Ordering::Relaxed);
    regs.rx_avail.fetch_sub(ARX_SIZE as u32, Ordering::Relaxed);
    Ok(())
}

/// Reclaim ARX slots the application has consumed (cleared the type byte
/// of). Only bothers once half the ring is outstanding.
pub fn arx_rxq_probe(regs: &AppCtxRegs, dma: &DmaMem) {
    let rx_len = regs.rx_len.load(Ordering::Acquire);
    if rx_len == 0 {
        return;
    }
    let mut avail = regs.rx_avail.load(Ordering::Relaxed);
    if avail > rx_len / 2 {
        return;
    }
    let rx_base = regs.rx_base.load(Ordering::Relaxed);
    let head = regs.rx_head.load(Ordering::Relaxed);

    let mut pos = head + avail;
    if pos >= rx_len {
        pos -= rx_len;
    }

    let mut i = 0;
    while avail < rx_len && i < 2 * BATCH_SIZE as u32 {
        if dma.slot_type(rx_base + pos as u64, ARX_SIZE) != 0 {
            break;
        }
        avail += ARX_SIZE as u32;
        pos += ARX_SIZE as u32;
        if pos >= rx_len {
            pos -= rx_len;
        }
        i += 1;
    }
    regs.rx_avail.store(avail, Ordering::Relaxed);
}

/// Ring the context's doorbell.
pub fn kick(regs: &AppCtxRegs) {
    let fd = regs.evfd.load(Ordering::Relaxed);
    if fd <= 0 {
        return;
    }
    let val: u64 = 1;
    let ret = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        warn!("appctx: doorbell write failed");
    }
}

const IDX_INVAL: u32 = u32::MAX;
const FLAG_ACTIVE: u16 = 1;

struct PolledCtx {
    next: u32,
    prev: u32,
    flags: u16,
    null_rounds: u32,
}

struct PolledVm {
    next: u32,
    prev: u32,
    flags: u16,
    poll_next_ctx: u32,
    act_ctx_head: u32,
    act_ctx_tail: u32,
    ctxs: Vec<PolledCtx>,
}

/// Bookkeeping of which VMs and contexts recently produced work, so steady
/// state polls only touch those. Contexts idle for [`MAX_NULL_ROUNDS`]
/// consecutive polls fall off; the periodic all-contexts sweep puts newly
/// busy ones back on.
///
/// Both levels are circular doubly-linked rings over fixed index arrays.
pub struct ActiveRings {
    vms: Vec<PolledVm>,
    act_head: u32,
    act_tail: u32,
    pub poll_next_vm: u32,
}

impl Default for ActiveRings {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveRings {
    pub fn new() -> ActiveRings {
        ActiveRings {
            vms: (0..VMST_NUM)
                .map(|_| PolledVm {
                    next: IDX_INVAL,
                    prev: IDX_INVAL,
                    flags: 0,
                    poll_next_ctx: 0,
                    act_ctx_head: IDX_INVAL,
                    act_ctx_tail: IDX_INVAL,
                    ctxs: (0..APPCTX_NUM)
                        .map(|_| PolledCtx {
                            next: IDX_INVAL,
                            prev: IDX_INVAL,
                            flags: 0,
                            null_rounds: 0,
                        })
                        .collect(),
                })
                .collect(),
            act_head: IDX_INVAL,
            act_tail: IDX_INVAL,
            poll_next_vm: 0,
        }
    }

    pub fn vm_active(&self, vm: u32) -> bool {
        self.vms[vm as usize].flags & FLAG_ACTIVE != 0
    }

    pub fn ctx_active(&self, vm: u32, cid: u32) -> bool {
        self.vms[vm as usize].ctxs[cid as usize].flags & FLAG_ACTIVE != 0
    }

    pub fn head_vm(&self) -> Option<u32> {
        (self.act_head != IDX_INVAL).then_some(self.act_head)
    }

    /// Advance a VM's context rotation pointer (all-contexts sweep).
    pub fn next_ctx_rotor(&mut self, vm: u32) -> u32 {
        let v = &mut self.vms[vm as usize];
        let c = v.poll_next_ctx;
        v.poll_next_ctx = (c + 1) % APPCTX_NUM as u32;
        c
    }

    pub fn mark_busy(&mut self, vm: u32, cid: u32) {
        self.vms[vm as usize].ctxs[cid as usize].null_rounds = 0;
        if !self.vm_active(vm) {
            self.enqueue_vm(vm);
        }
        if !self.ctx_active(vm, cid) {
            self.enqueue_ctx(vm, cid);
        }
    }

    /// Count an empty poll; returns `true` if the context just went idle
    /// and was dropped from the active ring.
    pub fn mark_idle(&mut self, vm: u32, cid: u32) -> bool {
        let c = &mut self.vms[vm as usize].ctxs[cid as usize];
        c.null_rounds = (c.null_rounds + 1).min(MAX_NULL_ROUNDS);
        if c.null_rounds >= MAX_NULL_ROUNDS && c.flags & FLAG_ACTIVE != 0 {
            self.remove_ctx(vm, cid);
            if self.vms[vm as usize].act_ctx_head == IDX_INVAL {
                self.remove_vm(vm);
            }
            return true;
        }
        false
    }

    /// Snapshot of the active (vm, ctx) pairs in ring order, bounded to one
    /// full cycle.
    pub fn active_pairs(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let Some(vstart) = self.head_vm() else {
            return out;
        };
        let mut vm = vstart;
        loop {
            let v = &self.vms[vm as usize];
            if v.act_ctx_head != IDX_INVAL {
                let cstart = v.act_ctx_head;
                let mut cid = cstart;
                loop {
                    out.push((vm, cid));
                    cid = v.ctxs[cid as usize].next;
                    if cid == cstart {
                        break;
                    }
                }
            }
            vm = v.next;
            if vm == vstart {
                break;
            }
        }
        out
    }

    fn enqueue_ctx(&mut self, vmid: u32, cid: u32) {
        let vm = &mut self.vms[vmid as usize];
        if vm.act_ctx_tail == IDX_INVAL {
            vm.act_ctx_head = cid;
            vm.act_ctx_tail = cid;
            let c = &mut vm.ctxs[cid as usize];
            c.prev = cid;
            c.next = cid;
            c.flags |= FLAG_ACTIVE;
            return;
        }
        let tail = vm.act_ctx_tail;
        let head = vm.act_ctx_head;
        vm.ctxs[tail as usize].next = cid;
        vm.ctxs[head as usize].prev = cid;
        let c = &mut vm.ctxs[cid as usize];
        c.prev = tail;
        c.next = head;
        c.flags |= FLAG_ACTIVE;
        vm.act_ctx_tail = cid;
    }

    fn remove_ctx(&mut self, vmid: u32, cid: u32) {
        let vm = &mut self.vms[vmid as usize];
        if vm.act_ctx_tail == vm.act_ctx_head {
            vm.act_ctx_head = IDX_INVAL;
            vm.act_ctx_tail = IDX_INVAL;
        } else {
            let (prev, next) = {
                let c = &vm.ctxs[cid as usize];
                (c.prev, c.next)
            };
            if cid == vm.act_ctx_tail {
                vm.act_ctx_tail = prev;
            }
            if cid == vm.act_ctx_head {
                vm.act_ctx_head = next;
            }
            vm.ctxs[prev as usize].next = next;
            vm.ctxs[next as usize].prev = prev;
        }
        let c = &mut vm.ctxs[cid as usize];
        c.next = IDX_INVAL;
        c.prev = IDX_INVAL;
        c.flags &= !FLAG_ACTIVE;
        c.null_rounds = 0;
    }

    fn enqueue_vm(&mut self, vmid: u32) {
        if self.act_tail == IDX_INVAL {
            self.act_head = vmid;
            self.act_tail = vmid;
            let v = &mut self.vms[vmid as usize];
            v.prev = vmid;
            v.next = vmid;
            v.flags |= FLAG_ACTIVE;
            return;
        }
        let tail = self.act_tail;
        let head = self.act_head;
        self.vms[tail as usize].next = vmid;
        self.vms[head as usize].prev = vmid;
        let v = &mut self.vms[vmid as usize];
        v.prev = tail;
        v.next = head;
        v.flags |= FLAG_ACTIVE;
        self.act_tail = vmid;
    }

    fn remove_vm(&mut self, vmid: u32) {
        if self.act_tail == self.act_head {
            self.act_head = IDX_INVAL;
            self.act_tail = IDX_INVAL;
        } else {
            let (prev, next) = {
                let v = &self.vms[vmid as usize];
                (v.prev, v.next)
            };
            if vmid == self.act_tail {
                self.act_tail = prev;
            }
            if vmid == self.act_head {
                self.act_head = next;
            }
            self.vms[prev as usize].next = next;
            self.vms[next as usize].prev = prev;
        }
        let v = &mut self.vms[vmid as usize];
        v.next = IDX_INVAL;
        v.prev = IDX_INVAL;
        v.flags &= !FLAG_ACTIVE;
        v.act_ctx_head = IDX_INVAL;
        v.act_ctx_tail = IDX_INVAL;
    }
}
