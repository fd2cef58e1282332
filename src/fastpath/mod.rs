/*! The dataplane.

One pinned, polling [`DataplaneContext`] per core owns a link-port queue
pair, a [`qman::QueueManager`], the per-core slow-path admin queues, and the
application context queues steered to it. Per-packet work happens in
[`flows`]; the flow lookup table is in [`flowht`].
*/

pub mod appctx;
pub(crate) mod context;
pub mod flowht;
pub mod flows;
pub mod kernel;
pub mod qman;
pub mod state;

pub use self::context::{DataplaneContext, ForwardRx, ForwardTx};

/// Batch size for queue-manager grants, app queue polls, and tx bursts.
pub const BATCH_SIZE: usize = 16;
/// Batch size for link-port receive bursts.
pub const RX_BATCH: usize = 64;
/// In-context transmit array capacity.
pub const TXBUF_SIZE: usize = 64;
/// Consecutive empty polls before a context drops off the active ring.
pub const MAX_NULL_ROUNDS: u32 = 64;
/// Every this many `poll_queues` rounds, all contexts are scanned instead
/// of only the active ring.
pub const MAX_POLL_ROUNDS: u32 = 32;

/// Segment payload limit: 1460 minus 12 bytes of timestamp option.
pub const TCP_MSS: usize = 1448;
/// RTT samples above this are discarded [us].
pub const TCP_MAX_RTT: u32 = 100_000;
