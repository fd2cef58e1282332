use std::ptr;
use std::sync::atomic::{fence, AtomicU8, Ordering};

use anyhow::{anyhow, Context, Result};
use log::warn;

/// The DMA-visible shared memory region.
///
/// All addresses handed to applications, queue entries, and per-flow buffer
/// bases are byte offsets into this region. The region is backed by a memfd
/// so it can be handed to applications over the control socket, optionally
/// on huge pages.
///
/// Interior mutability is deliberate: distinct offsets are owned by distinct
/// parties (per-flow buffers by the flow lock holder, queue slots by their
/// SPSC producer/consumer), so plain loads and stores at disjoint offsets do
/// not race. Cross-party publication goes through the type-byte protocol
/// (see [`DmaMem::publish_slot`]).
pub struct DmaMem {
    base: *mut u8,
    len: u64,
    fd: i32,
}

unsafe impl Send for DmaMem {}
unsafe impl Sync for DmaMem {}

impl DmaMem {
    /// Map a fresh zeroed region of `len` bytes.
    pub fn alloc(name: &str, len: u64, hugepages: bool) -> Result<DmaMem> {
        let cname = std::ffi::CString::new(name).context("region name")?;

        unsafe {
            let mut flags = 0;
            if hugepages {
                flags |= libc::MFD_HUGETLB;
            }
            let mut fd = libc::memfd_create(cname.as_ptr(), flags as libc::c_uint);
            if fd < 0 && hugepages {
                warn!("dma: huge page allocation failed, falling back to normal pages");
                fd = libc::memfd_create(cname.as_ptr(), 0);
            }
            if fd < 0 {
                return Err(anyhow!("memfd_create failed: {}", errno_str()));
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                libc::close(fd);
                return Err(anyhow!("ftruncate({len}) failed: {}", errno_str()));
            }
            let base = libc::mmap(
                ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if base == libc::MAP_FAILED {
                libc::close(fd);
                return Err(anyhow!("mmap({len}) failed: {}", errno_str()));
            }
            Ok(DmaMem {
                base: base as *mut u8,
                len,
                fd,
            })
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// File descriptor backing the region, for passing to applications.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    fn check(&self, off: u64, len: usize) {
        assert!(
            off.checked_add(len as u64).map_or(false, |e| e <= self.len),
            "dma access out of bounds: off={off} len={len} region={}",
            self.len
        );
    }

    /// Copy `dst.len()` bytes out of the region at `off`.
    #[inline]
    pub fn read(&self, off: u64, dst: &mut [u8]) {
        self.check(off, dst.len());
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(off as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src` into the region at `off`.
    #[inline]
    pub fn write(&self, off: u64, src: &[u8]) {
        self.check(off, src.len());
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off as usize), src.len());
        }
    }

    /// Zero `len` bytes at `off`.
    pub fn zero(&self, off: u64, len: usize) {
        self.check(off, len);
        unsafe {
            ptr::write_bytes(self.base.add(off as usize), 0, len);
        }
    }

    /// Read from a circular buffer `[buf_base, buf_base+buf_len)` starting at
    /// position `pos`, splitting into two copies on wrap-around.
    pub fn read_circ(&self, buf_base: u64, buf_len: u32, pos: u32, dst: &mut [u8]) {
        let n = dst.len();
        if pos as usize + n <= buf_len as usize {
            self.read(buf_base + pos as u64, dst);
        } else {
            let part = (buf_len - pos) as usize;
            self.read(buf_base + pos as u64, &mut dst[..part]);
            self.read(buf_base, &mut dst[part..]);
        }
    }

    /// Write into a circular buffer, splitting into two copies on wrap-around.
    pub fn write_circ(&self, buf_base: u64, buf_len: u32, pos: u32, src: &[u8]) {
        let n = src.len();
        if pos as usize + n <= buf_len as usize {
            self.write(buf_base + pos as u64, src);
        } else {
            let part = (buf_len - pos) as usize;
            self.write(buf_base + pos as u64, &src[..part]);
            self.write(buf_base, &src[part..]);
        }
    }

    /// Load the publication byte of the queue slot at `off` with size
    /// `slot_size`; a non-zero value means the slot holds a valid entry and
    /// its payload may be read afterwards.
    #[inline]
    pub fn slot_type(&self, off: u64, slot_size: usize) -> u8 {
        self.check(off, slot_size);
        let t = unsafe {
            let p = self.base.add(off as usize + slot_size - 1);
            AtomicU8::from_ptr(p).load(Ordering::Acquire)
        };
        t
    }

    /// Publish a queue slot: store the payload, then the type byte. The type
    /// store is the last store, ordered after the payload.
    #[inline]
    pub fn publish_slot(&self, off: u64, slot_size: usize, payload: &[u8], type_byte: u8) {
        debug_assert!(payload.len() < slot_size);
        self.write(off, payload);
        fence(Ordering::Release);
        unsafe {
            let p = self.base.add(off as usize + slot_size - 1);
            AtomicU8::from_ptr(p).store(type_byte, Ordering::Release);
        }
    }

    /// Release a consumed queue slot back to the producer by clearing its
    /// type byte, ordered after all payload reads.
    #[inline]
    pub fn clear_slot(&self, off: u64, slot_size: usize) {
        self.check(off, slot_size);
        unsafe {
            let p = self.base.add(off as usize + slot_size - 1);
            AtomicU8::from_ptr(p).store(0, Ordering::Release);
        }
    }

    /// Raw mutable view of `[off, off+len)`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of the range for the
    /// lifetime of the slice (flow lock, queue slot ownership).
    #[inline]
    pub unsafe fn slice_mut(&self, off: u64, len: usize) -> &mut [u8] {
        self.check(off, len);
        std::slice::from_raw_parts_mut(self.base.add(off as usize), len)
    }

    /// Raw shared view of `[off, off+len)`.
    ///
    /// # Safety
    /// The caller must ensure no concurrent writer to the range.
    #[inline]
    pub unsafe fn slice(&self, off: u64, len: usize) -> &[u8] {
        self.check(off, len);
        std::slice::from_raw_parts(self.base.add(off as usize), len)
    }
}

impl Drop for DmaMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len as usize);
            libc::close(self.fd);
        }
    }
}

pub(crate) fn errno_str() -> String {
    std::io::Error::last_os_error().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_wraparound() {
        let mem = DmaMem::alloc("test_dma", 4096, false).unwrap();
        let data: Vec<u8> = (0u8..100).collect();
        // buffer of 64 bytes at offset 128, write at pos 40 wraps
        mem.write_circ(128, 64, 40, &data[..48]);
        let mut out = vec![0u8; 48];
        mem.read_circ(128, 64, 40, &mut out);
        assert_eq!(out, &data[..48]);
    }

    #[test]
    fn slot_publication() {
        let mem = DmaMem::alloc("test_slots", 4096, false).unwrap();
        assert_eq!(mem.slot_type(0, 64), 0);
        mem.publish_slot(0, 64, &[1, 2, 3], 7);
        assert_eq!(mem.slot_type(0, 64), 7);
        let mut payload = [0u8; 3];
        mem.read(0, &mut payload);
        assert_eq!(payload, [1, 2, 3]);
        mem.clear_slot(0, 64);
        assert_eq!(mem.slot_type(0, 64), 0);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_panics() {
        let mem = DmaMem::alloc("test_oob", 4096, false).unwrap();
        let mut buf = [0u8; 8];
        mem.read(4090, &mut buf);
    }
}
