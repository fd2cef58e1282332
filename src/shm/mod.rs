/*! Shared-memory primitives.

Everything applications and the service exchange travels through a single
DMA-visible memory region: per-flow circular payload buffers, the per-core
admin queues, and the per-context application queues. [`DmaMem`] owns that
region and hands out offset-addressed access; [`packetmem`] carves it into
extents; [`ring`] is the byte-granular SPSC ring used by the guest/host
proxy control channel; [`layout`] pins down the on-memory queue entry
formats shared with applications.
*/

pub mod dma;
pub mod layout;
pub mod packetmem;
pub mod ring;

pub use self::dma::DmaMem;
pub use self::packetmem::{PacketMem, PktMemHandle};
pub use self::ring::ShmRing;
