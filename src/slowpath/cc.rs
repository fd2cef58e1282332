use crate::config::{CcAlgorithm, Config};

/// MSS the control loops reason in (conservative, below the wire MSS).
pub const CONF_MSS: u32 = 1400;

/// Per-interval deltas read from the flow state counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcStats {
    pub drops: u32,
    pub acks: u32,
    pub ackb: u32,
    pub ecnb: u32,
    /// Flow has unacknowledged data in flight.
    pub txp: bool,
    /// Current RTT estimate [us] (0 = none yet).
    pub rtt: u32,
}

/// Window-based DCTCP state.
#[derive(Debug, Clone, Copy)]
pub struct DctcpWin {
    ecn_rate: u32,
    window: u32,
    slowstart: bool,
}

/// Rate-based DCTCP state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DctcpRate {
    unproc_acks: u32,
    unproc_ackb: u32,
    unproc_ecnb: u32,
    unproc_drops: u32,
    ecn_rate: u32,
    act_rate: u32,
    slowstart: bool,
}

/// TIMELY state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timely {
    rtt_prev: u32,
    rtt_diff: i32,
    hai_cnt: u32,
    act_rate: u32,
    last_ts: u32,
    slowstart: bool,
}

/// Congestion control algorithm state, one variant per connection.
#[derive(Debug, Clone, Copy)]
pub enum CcAlg {
    DctcpWin(DctcpWin),
    DctcpRate(DctcpRate),
    Timely(Timely),
    ConstRate,
}

/// Congestion control bookkeeping embedded in each connection.
#[derive(Debug, Clone, Copy)]
pub struct CcConn {
    /// Current rate [kbps].
    pub rate: u32,
    /// Last RTT used by the control loop [us].
    pub rtt: u32,
    /// Retransmits since the last tick.
    pub rexmits: u32,
    /// Timestamp of the last control run.
    pub last_ts: u32,
    /// Cumulative counter snapshots for delta computation.
    pub last_drops: u32,
    pub last_acks: u32,
    pub last_ackb: u32,
    pub last_ecnb: u32,
    /// Control intervals with data pending but no ACKs.
    pub cnt_tx_pending: u32,
    /// When the flow first stopped moving.
    pub ts_tx_pending: u32,
    pub alg: CcAlg,
}

/// Convert a window in bytes to a rate in kbps, assuming one window per
/// RTT but never beyond the link.
fn window_to_rate(window: u32, rtt: u32, link_bw_gbps: u32) -> u32 {
    // time [ns] to push a window onto the link
    let mut time = (window as u64 * 8 * 1000 / link_bw_gbps as u64) / 1000;
    if time < rtt as u64 * 1000 {
        time = rtt as u64 * 1000;
    }
    let rate = window as u64 * 8 * 1_000_000 / time;
    rate.min(u32::MAX as u64) as u32
}

impl CcConn {
    pub fn new(cfg: &Config, cur_ts: u32) -> CcConn {
        let (alg, rate) = match cfg.cc_algorithm {
            CcAlgorithm::DctcpWin => {
                let window = 2 * CONF_MSS;
                (
                    CcAlg::DctcpWin(DctcpWin {
                        ecn_rate: 0,
                        window,
                        slowstart: true,
                    }),
                    window_to_rate(window, cfg.tcp_rtt_init, cfg.tcp_link_bw),
                )
            }
            CcAlgorithm::DctcpRate => (
                CcAlg::DctcpRate(DctcpRate {
                    slowstart: true,
                    ..Default::default()
                }),
                cfg.cc_dctcp_init,
            ),
            CcAlgorithm::Timely => (
                CcAlg::Timely(Timely {
                    slowstart: true,
                    ..Default::default()
                }),
                cfg.cc_timely_init,
            ),
            CcAlgorithm::ConstRate => (CcAlg::ConstRate, cfg.cc_const_rate),
        };

        CcConn {
            rate,
            rtt: cfg.tcp_rtt_init,
            rexmits: 0,
            last_ts: cur_ts,
            last_drops: 0,
            last_acks: 0,
            last_ackb: 0,
            last_ecnb: 0,
            cnt_tx_pending: 0,
            ts_tx_pending: 0,
            alg: CcAlg::ConstRate,
        }
        .with_alg(alg)
    }

    fn with_alg(mut self, alg: CcAlg) -> CcConn {
        self.alg = alg;
        self
    }

    /// One control interval: update the rate from the interval's deltas.
    pub fn tick(&mut self, stats: &CcStats, cur_ts: u32, cfg: &Config, tx_buf_len: u32) {
        match self.alg {
            CcAlg::DctcpWin(mut s) => {
                self.dctcp_win_update(&mut s, stats, cfg, tx_buf_len);
                self.alg = CcAlg::DctcpWin(s);
            }
            CcAlg::DctcpRate(mut s) => {
                self.dctcp_rate_update(&mut s, stats, cur_ts, cfg);
                self.alg = CcAlg::DctcpRate(s);
            }
            CcAlg::Timely(mut s) => {
                self.timely_update(&mut s, stats, cur_ts, cfg);
                self.alg = CcAlg::Timely(s);
            }
            CcAlg::ConstRate => {
                self.rtt = if stats.rtt != 0 {
                    stats.rtt
                } else {
                    cfg.tcp_rtt_init
                };
                self.rexmits = 0;
            }
        }
    }

    fn dctcp_win_update(
        &mut self,
        cc: &mut DctcpWin,
        stats: &CcStats,
        cfg: &Config,
        tx_buf_len: u32,
    ) {
        let rtt = if stats.rtt != 0 {
            stats.rtt
        } else {
            cfg.tcp_rtt_init
        };
        let mut win = cc.window;
        let mut ecnb = stats.ecnb;

        if cc.slowstart {
            if stats.drops == 0 && stats.ecnb == 0 && self.rexmits == 0 {
                // double per window of acks, guarding overflow
                win = win.saturating_add(stats.ackb);
            } else {
                cc.slowstart = false;
            }
        }

        if !cc.slowstart {
            if stats.drops > 0 || self.rexmits > 0 {
                win /= 2;
            } else {
                if stats.ackb > 0 {
                    ecnb = ecnb.min(stats.ackb);
                    let mut ecn_rate = ecnb as u64 * u32::MAX as u64 / stats.ackb as u64;

                    // EWMA with the configured weight
                    ecn_rate = (ecn_rate * cfg.cc_dctcp_weight as u64
                        + cc.ecn_rate as u64 * (u32::MAX - cfg.cc_dctcp_weight) as u64)
                        / u32::MAX as u64;
                    cc.ecn_rate = ecn_rate as u32;
                }

                if ecnb > 0 {
                    win = (win as u64 * (u32::MAX - cc.ecn_rate / 2) as u64 / u32::MAX as u64)
                        as u32;
                } else {
                    // additive increase
                    let incr = stats.ackb as u64 * CONF_MSS as u64 / win as u64;
                    win = win.saturating_add(incr.min(u32::MAX as u64) as u32);
                }
            }
        }

        win = win.clamp(CONF_MSS, tx_buf_len.max(CONF_MSS));

        self.rtt = rtt;
        self.rate = window_to_rate(win, rtt, cfg.tcp_link_bw);
        cc.window = win;
        self.rexmits = 0;
    }

    fn dctcp_rate_update(&mut self, cc: &mut DctcpRate, stats: &CcStats, cur_ts: u32, cfg: &Config) {
        let rtt = if stats.rtt != 0 {
            stats.rtt
        } else {
            cfg.tcp_rtt_init
        };
        self.rtt = rtt;

        let mut ecnb = cc.unproc_ecnb + stats.ecnb;
        let acks = cc.unproc_acks + stats.acks;
        let ackb = cc.unproc_ackb + stats.ackb;
        let drops = cc.unproc_drops + stats.drops;

        // buffer up samples until enough acks arrived for a robust update
        if acks < cfg.cc_dctcp_minpkts {
            cc.unproc_ecnb = ecnb;
            cc.unproc_acks = acks;
            cc.unproc_ackb = ackb;
            cc.unproc_drops = drops;
            return;
        }
        cc.unproc_ecnb = 0;
        cc.unproc_acks = 0;
        cc.unproc_ackb = 0;
        cc.unproc_drops = 0;

        let mut rate = self.rate;

        // measured rate over the interval, smoothed
        let act_rate = if self.last_ts != 0 && cur_ts != self.last_ts {
            (ackb as u64 * 8 * 1000 / (cur_ts.wrapping_sub(self.last_ts)) as u64) as u32
        } else {
            0
        };
        cc.act_rate = (7 * cc.act_rate + act_rate) / 8;
        let act_rate = act_rate.max(cc.act_rate);

        // never run far ahead of what the flow actually achieves
        if rate as u64 > act_rate as u64 * 12 / 10 {
            rate = (act_rate as u64 * 12 / 10) as u32;
        }

        if cc.slowstart {
            if drops == 0 && ecnb == 0 && self.rexmits == 0 {
                rate = rate.saturating_mul(2);
            } else {
                cc.slowstart = false;
            }
        }

        if !cc.slowstart {
            if drops > 0 || self.rexmits > 0 {
                rate /= 2;
            } else {
                if ackb > 0 {
                    ecnb = ecnb.min(ackb);
                    let mut ecn_rate = ecnb as u64 * u32::MAX as u64 / ackb as u64;
                    ecn_rate = (ecn_rate * cfg.cc_dctcp_weight as u64
                        + cc.ecn_rate as u64 * (u32::MAX - cfg.cc_dctcp_weight) as u64)
                        / u32::MAX as u64;
                    cc.ecn_rate = ecn_rate as u32;
                }

                if ecnb > 0 {
                    rate = (rate as u64 * (u32::MAX - cc.ecn_rate / 2) as u64 / u32::MAX as u64)
                        as u32;
                } else if cfg.cc_dctcp_mimd == 0 {
                    rate = rate.saturating_add(cfg.cc_dctcp_step);
                } else {
                    let incr = rate as u64 * cfg.cc_dctcp_mimd as u64 / u32::MAX as u64;
                    rate = rate.saturating_add(incr as u32);
                }
            }
        }

        self.rate = rate.max(cfg.cc_dctcp_min);
        self.rexmits = 0;
    }

    fn timely_update(&mut self, cc: &mut Timely, stats: &CcStats, cur_ts: u32, cfg: &Config) {
        let new_rtt = stats.rtt;

        let act_rate = if cc.last_ts != 0 && cur_ts != cc.last_ts {
            (stats.ackb as u64 * 8 * 1000 / (cur_ts.wrapping_sub(cc.last_ts)) as u64) as u32
        } else {
            0
        };
        cc.act_rate = (7 * cc.act_rate + act_rate) / 8;
        let act_rate = act_rate.max(cc.act_rate);

        // nothing to steer by yet
        if new_rtt == 0 {
            return;
        }

        if cc.slowstart && new_rtt > (cfg.cc_timely_tlow + cfg.cc_timely_thigh) / 2 {
            cc.slowstart = false;
        }

        if !cc.slowstart && self.rate as u64 > act_rate as u64 * 12 / 10 {
            self.rate = (act_rate as u64 * 12 / 10) as u32;
        }

        let mut normalized_gradient: i64 = 0;
        if cc.rtt_prev != 0 {
            let new_rtt_diff = new_rtt as i64 - cc.rtt_prev as i64;

            let factor = (cfg.cc_timely_alpha / 2) as i64;
            let x = (i32::MAX as i64 - factor) * cc.rtt_diff as i64 + factor * new_rtt_diff;
            cc.rtt_diff = (x / i32::MAX as i64) as i32;

            normalized_gradient = cc.rtt_diff as i64 * i16::MAX as i64 / cfg.cc_timely_min_rtt as i64;
        }
        cc.rtt_prev = new_rtt;

        let orig_rate = self.rate;
        if cc.slowstart {
            self.rate = self.rate.saturating_mul(2);
            cc.hai_cnt = 0;
        } else if new_rtt < cfg.cc_timely_tlow {
            // additive increase below the low threshold
            self.rate = self.rate.saturating_add(cfg.cc_timely_step);
            cc.hai_cnt = 0;
        } else if new_rtt > cfg.cc_timely_thigh {
            // rate *= 1 - beta * (1 - Thigh/rtt)
            let d = (u32::MAX as u64 * cfg.cc_timely_thigh as u64 / new_rtt as u64) as u32;
            let b = u32::MAX - d;
            let a = (cfg.cc_timely_beta as u64 * b as u64 / u32::MAX as u64) as u32;
            self.rate = (self.rate as u64 * (u32::MAX - a) as u64 / u32::MAX as u64) as u32;
            cc.hai_cnt = 0;
        } else if normalized_gradient <= 0 {
            // hyperactive increase after five flat gradients
            cc.hai_cnt += 1;
            if cc.hai_cnt >= 5 {
                self.rate = self.rate.saturating_add(cfg.cc_timely_step * 5);
                cc.hai_cnt -= 1;
            } else {
                self.rate = self.rate.saturating_add(cfg.cc_timely_step);
            }
        } else {
            // rate *= 1 - beta * normalized_gradient
            let a = (cfg.cc_timely_beta / 2) as i64 * normalized_gradient;
            let b = a / i16::MAX as i64;
            let d = if b <= i32::MAX as i64 {
                i32::MAX as i64 - b
            } else {
                0
            };
            let e = self.rate as i64 * d;
            self.rate = (e / i32::MAX as i64).clamp(0, u32::MAX as i64) as u32;
            cc.hai_cnt = 0;
        }

        // never fall by more than half in one step
        if self.rate < orig_rate / 2 {
            self.rate = orig_rate / 2;
        }
        if self.rate < cfg.cc_timely_min_rate {
            self.rate = cfg.cc_timely_min_rate;
        }

        self.rtt = stats.rtt;
        cc.last_ts = cur_ts;
        self.rexmits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(alg: CcAlgorithm) -> Config {
        Config {
            cc_algorithm: alg,
            ..Default::default()
        }
    }

    #[test]
    fn dctcp_win_slow_start_doubles() {
        let cfg = cfg(CcAlgorithm::DctcpWin);
        let mut cc = CcConn::new(&cfg, 0);
        let w0 = match cc.alg {
            CcAlg::DctcpWin(s) => s.window,
            _ => unreachable!(),
        };
        assert_eq!(w0, 2 * CONF_MSS);

        cc.tick(
            &CcStats {
                ackb: w0,
                rtt: 100,
                ..Default::default()
            },
            1000,
            &cfg,
            1 << 20,
        );
        match cc.alg {
            CcAlg::DctcpWin(s) => assert_eq!(s.window, 2 * w0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn dctcp_win_halves_on_drop() {
        let cfg = cfg(CcAlgorithm::DctcpWin);
        let mut cc = CcConn::new(&cfg, 0);
        // grow a bit first
        for i in 0..4 {
            cc.tick(
                &CcStats {
                    ackb: 4 * CONF_MSS,
                    rtt: 100,
                    ..Default::default()
                },
                1000 * (i + 1),
                &cfg,
                1 << 20,
            );
        }
        let before = match cc.alg {
            CcAlg::DctcpWin(s) => s.window,
            _ => unreachable!(),
        };
        cc.tick(
            &CcStats {
                drops: 1,
                rtt: 100,
                ..Default::default()
            },
            10_000,
            &cfg,
            1 << 20,
        );
        let after = match cc.alg {
            CcAlg::DctcpWin(s) => s.window,
            _ => unreachable!(),
        };
        assert_eq!(after, (before / 2).max(CONF_MSS));
    }

    #[test]
    fn dctcp_win_never_below_mss() {
        let cfg = cfg(CcAlgorithm::DctcpWin);
        let mut cc = CcConn::new(&cfg, 0);
        for i in 0..20 {
            cc.tick(
                &CcStats {
                    drops: 1,
                    rtt: 100,
                    ..Default::default()
                },
                1000 * (i + 1),
                &cfg,
                1 << 20,
            );
        }
        match cc.alg {
            CcAlg::DctcpWin(s) => assert_eq!(s.window, CONF_MSS),
            _ => unreachable!(),
        }
    }

    #[test]
    fn dctcp_rate_buffers_until_minpkts() {
        let cfg = cfg(CcAlgorithm::DctcpRate);
        let mut cc = CcConn::new(&cfg, 500);
        let r0 = cc.rate;

        // below the ack threshold nothing changes
        cc.tick(
            &CcStats {
                acks: cfg.cc_dctcp_minpkts - 1,
                ackb: 10_000,
                rtt: 100,
                ..Default::default()
            },
            1000,
            &cfg,
            1 << 20,
        );
        assert_eq!(cc.rate, r0);

        // crossing it processes the buffered sample too; clean slow start
        // doubles the rate
        cc.tick(
            &CcStats {
                acks: 1,
                ackb: 1_000_000,
                rtt: 100,
                ..Default::default()
            },
            2000,
            &cfg,
            1 << 20,
        );
        assert_eq!(cc.rate, 2 * r0);
    }

    #[test]
    fn timely_decreases_on_high_rtt() {
        let cfg = cfg(CcAlgorithm::Timely);
        let mut cc = CcConn::new(&cfg, 0);
        // exit slow start and seed rtt_prev
        cc.tick(
            &CcStats {
                rtt: 200,
                ackb: 1_000_000,
                ..Default::default()
            },
            1000,
            &cfg,
            1 << 20,
        );
        let before = cc.rate;
        cc.tick(
            &CcStats {
                rtt: 400,
                ackb: 1_000_000,
                ..Default::default()
            },
            2000,
            &cfg,
            1 << 20,
        );
        assert!(cc.rate <= before);
        assert!(cc.rate >= before / 2, "never below half in one step");
        assert!(cc.rate >= cfg.cc_timely_min_rate);
    }

    #[test]
    fn timely_additive_increase_below_tlow() {
        let cfg = cfg(CcAlgorithm::Timely);
        let mut cc = CcConn::new(&cfg, 0);
        // rtt below tlow while in slow start: doubles
        let r0 = cc.rate;
        cc.tick(
            &CcStats {
                rtt: cfg.cc_timely_tlow / 2,
                ackb: 100_000,
                ..Default::default()
            },
            1000,
            &cfg,
            1 << 20,
        );
        assert_eq!(cc.rate, r0 * 2);
    }

    #[test]
    fn const_rate_only_tracks_rtt() {
        let mut cfg = cfg(CcAlgorithm::ConstRate);
        cfg.cc_const_rate = 12345;
        let mut cc = CcConn::new(&cfg, 0);
        assert_eq!(cc.rate, 12345);
        cc.tick(
            &CcStats {
                rtt: 77,
                drops: 5,
                ..Default::default()
            },
            1000,
            &cfg,
            1 << 20,
        );
        assert_eq!(cc.rate, 12345);
        assert_eq!(cc.rtt, 77);
    }
}
