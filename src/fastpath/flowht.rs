use std::sync::atomic::Ordering;

use log::warn;

use super::state::{
    FlowHtEntry, FlowSt, FLOWHTE_ID_MASK, FLOWHTE_POSSHIFT, FLOWHTE_VALID,
};
use crate::shm::layout::FLOWHT_NBSZ;

/// CRC32C (Castagnoli), bit-reflected, as NICs compute for RSS-style
/// hashing. Table-driven; the table is built at compile time.
const CRC32C_POLY: u32 = 0x82F63B78;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

pub fn crc32c(data: &[u8], seed: u32) -> u32 {
    let mut crc = !seed;
    for &b in data {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ b as u32) & 0xff) as usize];
    }
    !crc
}

/// Hash of a connection 4-tuple, shared by insert, lookup, and remove.
///
/// The tuple is hashed as `(local_port | remote_port<<16,
/// local_ip | remote_ip<<32)`, little-endian.
pub fn flow_hash(local_ip: u32, local_port: u16, remote_ip: u32, remote_port: u16) -> u32 {
    let mut key = [0u8; 12];
    key[0..4].copy_from_slice(&local_ip.to_le_bytes());
    key[4..8].copy_from_slice(&remote_ip.to_le_bytes());
    key[8..10].copy_from_slice(&local_port.to_le_bytes());
    key[10..12].copy_from_slice(&remote_port.to_le_bytes());
    crc32c(&key, 0)
}

/// Insertion failed: neighborhood full and nothing could be relocated.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FlowTableFull;

impl std::fmt::Display for FlowTableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow hash table full")
    }
}

impl std::error::Error for FlowTableFull {}

/// Find an empty slot for `hash`, relocating entries hopscotch-style when
/// the home neighborhood is full. Returns `(slot, displacement)`.
///
/// Writers are serialized (only the slow path inserts); lookups may run
/// concurrently, so relocation publishes the destination before clearing
/// the source.
fn slot_alloc(ht: &[FlowHtEntry], hash: u32) -> Result<(usize, u32), FlowTableFull> {
    let entries = ht.len();
    let home = hash as usize % entries;
    let nb_end = (home + FLOWHT_NBSZ) % entries;

    // empty slot within the home neighborhood?
    let mut d = 0u32;
    let mut i = home;
    while i != nb_end {
        if ht[i].flow_id.load(Ordering::Acquire) & FLOWHTE_VALID == 0 {
            return Ok((i, d));
        }
        d += 1;
        i = (i + 1) % entries;
    }

    // extend the window and look for any empty slot
    let window_end = (nb_end + 4 * FLOWHT_NBSZ) % entries;
    while i != window_end {
        if ht[i].flow_id.load(Ordering::Acquire) & FLOWHTE_VALID == 0 {
            break;
        }
        i = (i + 1) % entries;
    }
    if i == window_end {
        warn!("flowht: no empty slot in extended window");
        return Err(FlowTableFull);
    }

    // walk the empty slot backward until it lands in the home neighborhood
    let in_neighborhood = |i: usize| {
        if home > nb_end {
            i < nb_end || i >= home
        } else {
            i >= home && i < nb_end
        }
    };
    while !in_neighborhood(i) {
        let k = i;

        // look within the preceding neighborhood for an entry allowed to
        // move forward into the hole
        i = (k + entries - FLOWHT_NBSZ) % entries;
        while i != k {
            let id = ht[i].flow_id.load(Ordering::Acquire);
            debug_assert!(id & FLOWHTE_VALID != 0);

            let disp = (id >> FLOWHTE_POSSHIFT) & (FLOWHT_NBSZ as u32 - 1);
            let headroom = FLOWHT_NBSZ as u32 - 1 - disp;
            if ((k + entries - i) % entries) as u32 <= headroom {
                break;
            }
            i = (i + 1) % entries;
        }
        if i == k {
            warn!("flowht: no relocatable entry");
            return Err(FlowTableFull);
        }

        // move the entry into the hole: publish destination, then clear
        let id = ht[i].flow_id.load(Ordering::Acquire);
        let disp = (id >> FLOWHTE_POSSHIFT) & (FLOWHT_NBSZ as u32 - 1);
        let moved = ((k + entries - i) % entries) as u32;
        ht[k].flow_hash
            .store(ht[i].flow_hash.load(Ordering::Acquire), Ordering::Release);
        ht[k].flow_id.store(
            FLOWHTE_VALID | ((disp + moved) << FLOWHTE_POSSHIFT) | (id & FLOWHTE_ID_MASK),
            Ordering::Release,
        );
        ht[i].flow_id.store(0, Ordering::Release);
    }

    let d = ((i + entries - home) % entries) as u32;
    Ok((i, d))
}

/// Publish `flow_id` under the 4-tuple already stored in its flow state.
pub fn insert(ht: &[FlowHtEntry], hash: u32, flow_id: u32) -> Result<(), FlowTableFull> {
    let (slot, d) = slot_alloc(ht, hash)?;
    debug_assert!(d < FLOWHT_NBSZ as u32);

    // hash first, then the valid id
    ht[slot].flow_hash.store(hash, Ordering::Release);
    ht[slot].flow_id.store(
        FLOWHTE_VALID | (d << FLOWHTE_POSSHIFT) | flow_id,
        Ordering::Release,
    );
    Ok(())
}

/// Look up the flow id for a 4-tuple, without locks.
///
/// Scans the neighborhood, filtering on the valid bit and stored hash, and
/// confirms the full tuple against the flow state. At most one entry can
/// match; insertion guarantees tuple uniqueness.
pub fn lookup(
    ht: &[FlowHtEntry],
    flowst: &[FlowSt],
    local_ip: u32,
    local_port: u16,
    remote_ip: u32,
    remote_port: u16,
) -> Option<u32> {
    let hash = flow_hash(local_ip, local_port, remote_ip, remote_port);
    lookup_hash(ht, flowst, hash, local_ip, local_port, remote_ip, remote_port)
}

pub fn lookup_hash(
    ht: &[FlowHtEntry],
    flowst: &[FlowSt],
    hash: u32,
    local_ip: u32,
    local_port: u16,
    remote_ip: u32,
    remote_port: u16,
) -> Option<u32> {
    let entries = ht.len();
    for j in 0..FLOWHT_NBSZ {
        let k = (hash as usize + j) % entries;
        let e = &ht[k];

        let id = e.flow_id.load(Ordering::Acquire);
        let eh = e.flow_hash.load(Ordering::Acquire);
        if id & FLOWHTE_VALID == 0 || eh != hash {
            continue;
        }

        let fid = id & FLOWHTE_ID_MASK;
        if flowst[fid as usize].tuple_matches(local_ip, remote_ip, local_port, remote_port) {
            return Some(fid);
        }
    }
    None
}

/// Remove the entry for `flow_id`. Clearing the valid bit is enough; stale
/// displacement is harmless because lookups always hash-check.
pub fn remove(
    ht: &[FlowHtEntry],
    hash: u32,
    flow_id: u32,
) -> Result<(), ()> {
    let entries = ht.len();
    for j in 0..FLOWHT_NBSZ {
        let k = (hash as usize + j) % entries;
        let e = &ht[k];

        let id = e.flow_id.load(Ordering::Acquire);
        let eh = e.flow_hash.load(Ordering::Acquire);
        if id & FLOWHTE_VALID == 0 || eh != hash {
            continue;
        }
        if id & FLOWHTE_ID_MASK == flow_id {
            e.flow_id.store(id & !FLOWHTE_VALID, Ordering::Release);
            return Ok(());
        }
    }
    warn!("flowht: remove: entry not found for flow {flow_id}");
    Err(())
}
