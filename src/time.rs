use std::time::Instant;

use lazy_static::lazy_static;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Microseconds since process start, truncated to 32 bits.
///
/// All protocol timestamps (TCP timestamp option values, pacer virtual time,
/// timeout deadlines) are 32-bit microsecond counters that wrap; comparisons
/// must go through [`rel_time`].
pub fn now_us() -> u32 {
    EPOCH.elapsed().as_micros() as u32
}

/// Microseconds since process start, full width, for accounting counters.
pub fn now_us64() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

const TIMESTAMP_BITS: u32 = 32;
const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF;

/// Signed distance from `cur_ts` to `ts`, treating the 32-bit timestamp space
/// as a circle: timestamps up to half the space ahead of `cur_ts` are
/// positive, the rest negative.
pub fn rel_time(cur_ts: u32, ts: u32) -> i64 {
    let ts = ts as u64;
    let cur = cur_ts as u64;
    let middle = 1u64 << (TIMESTAMP_BITS - 1);

    if cur < middle {
        // negative interval wraps around the top of the space
        let start = cur.wrapping_sub(middle) & TIMESTAMP_MASK;
        if ts >= start {
            // in first half of negative interval, smallest timestamps
            ts as i64 - start as i64 - middle as i64
        } else {
            ts as i64 - cur as i64
        }
    } else if cur == middle {
        ts as i64 - cur as i64
    } else {
        // positive interval wraps around the top of the space
        let end = ((cur + middle) & TIMESTAMP_MASK) + 1;
        if ts < end {
            // in second half of positive interval, largest timestamps
            ts as i64 + ((1i64 << TIMESTAMP_BITS) - cur as i64)
        } else {
            ts as i64 - cur as i64
        }
    }
}

/// `a <= b` on the timestamp circle anchored at `cur_ts`.
pub fn ts_leq(cur_ts: u32, a: u32, b: u32) -> bool {
    rel_time(cur_ts, a) <= rel_time(cur_ts, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_time_no_wrap() {
        assert_eq!(rel_time(1000, 1500), 500);
        assert_eq!(rel_time(1500, 1000), -500);
        assert_eq!(rel_time(1000, 1000), 0);
    }

    #[test]
    fn rel_time_wrap() {
        // 100 is just past a wrapped 0xFFFF_FF00: 0x100 to the wrap plus 100
        assert_eq!(rel_time(0xFFFF_FF00, 100), 0x100 + 100);
        assert!(rel_time(0xFFFF_FF00, 100) > 0);
        assert!(rel_time(100, 0xFFFF_FF00) < 0);
    }

    #[test]
    fn ts_leq_across_wrap() {
        assert!(ts_leq(0xFFFF_FFF0, 0xFFFF_FFF8, 8));
        assert!(!ts_leq(0xFFFF_FFF0, 8, 0xFFFF_FFF8));
    }
}
