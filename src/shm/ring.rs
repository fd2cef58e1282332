use core::fmt;
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Errors returned by [`ShmRing`] operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RingError {
    /// A push would exceed the free space in the ring.
    InsufficientSpace,
    /// A pop or read would consume more bytes than the ring holds.
    InsufficientData,
}

impl std::error::Error for RingError {}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::InsufficientSpace => write!(f, "not enough space in ring"),
            RingError::InsufficientData => write!(f, "not enough data in ring"),
        }
    }
}

mod hdr {
    pub const WRITE_POS: usize = 0;
    pub const READ_POS: usize = 4;
    pub const FULL: usize = 8;
    pub const RING_SIZE: usize = 12;
    pub const LEN: usize = 16;
}

/// Byte-granular SPSC ring in memory visible to two processes.
///
/// The header (`write_pos`, `read_pos`, `full`, `ring_size`) lives at the
/// start of the region; the data area is everything after it. One side only
/// pushes, the other only pops. The writer publishes payload bytes before
/// advancing `write_pos`; the reader observes `write_pos` (and `full`)
/// before touching payload.
pub struct ShmRing {
    base: *mut u8,
    region_size: usize,
}

unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Attach to an existing initialized ring at `base`.
    ///
    /// # Safety
    /// `base` must point to a region of `region_size` bytes that stays valid
    /// and mapped for the lifetime of the ring.
    pub unsafe fn attach(base: *mut u8, region_size: usize) -> ShmRing {
        assert!(region_size > hdr::LEN);
        ShmRing { base, region_size }
    }

    /// Zero the region and initialize the header.
    ///
    /// # Safety
    /// Same contract as [`attach`], and no concurrent user of the region.
    ///
    /// [`attach`]: #method.attach
    pub unsafe fn init(base: *mut u8, region_size: usize) -> ShmRing {
        std::ptr::write_bytes(base, 0, region_size);
        let ring = Self::attach(base, region_size);
        ring.field(hdr::RING_SIZE)
            .store((region_size - hdr::LEN) as u32, Ordering::Release);
        ring
    }

    #[inline]
    fn field(&self, off: usize) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.base.add(off) as *mut u32) }
    }

    #[inline]
    fn data_ptr(&self, pos: u32) -> *mut u8 {
        debug_assert!((pos as usize) < self.region_size - hdr::LEN);
        unsafe { self.base.add(hdr::LEN + pos as usize) }
    }

    /// Ring capacity in bytes.
    pub fn size(&self) -> u32 {
        self.field(hdr::RING_SIZE).load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        let full = self.field(hdr::FULL).load(Ordering::Acquire) != 0;
        let wp = self.field(hdr::WRITE_POS).load(Ordering::Acquire);
        let rp = self.field(hdr::READ_POS).load(Ordering::Acquire);
        !full && wp == rp
    }

    /// Unused bytes in the ring.
    pub fn free_bytes(&self) -> u32 {
        let size = self.size();
        let full = self.field(hdr::FULL).load(Ordering::Acquire) != 0;
        let wp = self.field(hdr::WRITE_POS).load(Ordering::Acquire);
        let rp = self.field(hdr::READ_POS).load(Ordering::Acquire);

        if !full && wp == rp {
            size
        } else if wp > rp {
            (size - wp) + rp
        } else {
            rp - wp
        }
    }

    /// Append `src` to the ring.
    pub fn push(&self, src: &[u8]) -> Result<(), RingError> {
        let n = src.len() as u32;
        if self.free_bytes() < n {
            return Err(RingError::InsufficientSpace);
        }
        let size = self.size();
        let wp = self.field(hdr::WRITE_POS).load(Ordering::Relaxed);

        unsafe {
            if size - wp < n {
                // wraps: two copies
                let part = (size - wp) as usize;
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(wp), part);
                std::ptr::copy_nonoverlapping(
                    src[part..].as_ptr(),
                    self.data_ptr(0),
                    src.len() - part,
                );
            } else {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(wp), src.len());
            }
        }

        // payload must be visible before the new write_pos
        fence(Ordering::Release);
        let new_wp = (wp + n) % size;
        self.field(hdr::WRITE_POS).store(new_wp, Ordering::Release);
        if new_wp == self.field(hdr::READ_POS).load(Ordering::Acquire) {
            self.field(hdr::FULL).store(1, Ordering::Release);
        }
        Ok(())
    }

    fn copy_out(&self, dst: &mut [u8], rp: u32) {
        let size = self.size();
        let n = dst.len();
        unsafe {
            if ((size - rp) as usize) < n {
                let part = (size - rp) as usize;
                std::ptr::copy_nonoverlapping(self.data_ptr(rp), dst.as_mut_ptr(), part);
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(0),
                    dst[part..].as_mut_ptr(),
                    n - part,
                );
            } else {
                std::ptr::copy_nonoverlapping(self.data_ptr(rp), dst.as_mut_ptr(), n);
            }
        }
    }

    /// Remove `dst.len()` bytes from the ring.
    pub fn pop(&self, dst: &mut [u8]) -> Result<(), RingError> {
        let n = dst.len() as u32;
        let size = self.size();
        if size - self.free_bytes() < n {
            return Err(RingError::InsufficientData);
        }
        let rp = self.field(hdr::READ_POS).load(Ordering::Relaxed);
        self.copy_out(dst, rp);

        fence(Ordering::Release);
        self.field(hdr::READ_POS)
            .store((rp + n) % size, Ordering::Release);
        self.field(hdr::FULL).store(0, Ordering::Release);
        Ok(())
    }

    /// Peek at `dst.len()` bytes without consuming them.
    pub fn read(&self, dst: &mut [u8]) -> Result<(), RingError> {
        let n = dst.len() as u32;
        if self.size() - self.free_bytes() < n {
            return Err(RingError::InsufficientData);
        }
        let rp = self.field(hdr::READ_POS).load(Ordering::Relaxed);
        self.copy_out(dst, rp);
        Ok(())
    }
}
