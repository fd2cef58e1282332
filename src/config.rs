use std::fmt;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};
use getopts::Options;

/// Congestion control algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcAlgorithm {
    DctcpWin,
    DctcpRate,
    ConstRate,
    Timely,
}

impl fmt::Display for CcAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CcAlgorithm::DctcpWin => "dctcp-win",
            CcAlgorithm::DctcpRate => "dctcp-rate",
            CcAlgorithm::ConstRate => "const-rate",
            CcAlgorithm::Timely => "timely",
        };
        write!(f, "{s}")
    }
}

/// A static route: destination network and next hop.
#[derive(Debug, Clone, Copy)]
pub struct ConfigRoute {
    pub ip: u32,
    pub prefix: u8,
    pub next_hop: u32,
}

/// Service configuration, populated from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local IP address.
    pub ip: u32,
    /// Local IP prefix length.
    pub ip_prefix: u8,
    /// Additional routes.
    pub routes: Vec<ConfigRoute>,

    /// Size of the DMA shared memory region in bytes.
    pub shm_len: u64,
    /// Slow-path admin rx queue length (entries).
    pub nic_rx_len: u32,
    /// Slow-path admin tx queue length (entries).
    pub nic_tx_len: u32,
    /// App->service admin queue length (bytes).
    pub app_kin_len: u32,
    /// Service->app admin queue length (bytes).
    pub app_kout_len: u32,

    /// Per-flow receive buffer length.
    pub tcp_rxbuf_len: u32,
    /// Per-flow transmit buffer length.
    pub tcp_txbuf_len: u32,
    /// Initial RTT estimate for CC [us].
    pub tcp_rtt_init: u32,
    /// Link bandwidth [gbps].
    pub tcp_link_bw: u32,
    /// Handshake timeout [us].
    pub tcp_handshake_to: u32,
    /// Handshake retries before giving up.
    pub tcp_handshake_retries: u32,
    /// Receive window scale advertised to peers (0 disables the option).
    pub tcp_window_scale: u8,
    /// Accept ACKs beyond the sent range, advancing the send state.
    pub tcp_future_acks: bool,

    /// ARP request timeout [us], doubled on every retry.
    pub arp_to: u32,
    /// ARP timeout ceiling [us]; waiters fail once the doubled timeout passes it.
    pub arp_to_max: u32,

    pub cc_algorithm: CcAlgorithm,
    /// Lower bound on control loop granularity [us].
    pub cc_control_granularity: u32,
    /// Control interval in units of flow RTT.
    pub cc_control_interval: u32,
    /// Control intervals without ACKs before triggering retransmission.
    pub cc_rexmit_ints: u32,
    /// DCTCP EWMA weight (fixed point over u32::MAX).
    pub cc_dctcp_weight: u32,
    /// DCTCP rate: initial rate [kbps].
    pub cc_dctcp_init: u32,
    /// DCTCP rate: additive increase step [kbps].
    pub cc_dctcp_step: u32,
    /// DCTCP rate: multiplicative increase factor (0 = additive).
    pub cc_dctcp_mimd: u32,
    /// DCTCP rate: minimal rate [kbps].
    pub cc_dctcp_min: u32,
    /// DCTCP rate: minimal ACKs before running an update.
    pub cc_dctcp_minpkts: u32,
    /// Constant rate [kbps] for const-rate CC.
    pub cc_const_rate: u32,
    /// TIMELY low threshold [us].
    pub cc_timely_tlow: u32,
    /// TIMELY high threshold [us].
    pub cc_timely_thigh: u32,
    /// TIMELY additive step [kbps].
    pub cc_timely_step: u32,
    /// TIMELY initial rate [kbps].
    pub cc_timely_init: u32,
    /// TIMELY EWMA weight (fixed point over u32::MAX).
    pub cc_timely_alpha: u32,
    /// TIMELY multiplicative decrease factor (fixed point over u32::MAX).
    pub cc_timely_beta: u32,
    /// TIMELY minimal RTT [us].
    pub cc_timely_min_rtt: u32,
    /// TIMELY minimal rate [kbps].
    pub cc_timely_min_rate: u32,

    /// Maximum number of fast-path cores.
    pub fp_cores_max: u32,
    /// Disable fast-path blocking on interrupts.
    pub fp_no_ints: bool,
    /// Do not use huge pages for shared memory.
    pub fp_no_hugepages: bool,
    /// Name for the kernel tap interface handling non-TCP traffic.
    pub kni_name: Option<String>,
    /// File descriptor to signal on readiness.
    pub ready_fd: Option<i32>,
    /// Suppress periodic statistics output.
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ip: 0,
            ip_prefix: 24,
            routes: Vec::new(),
            shm_len: 1024 * 1024 * 1024,
            nic_rx_len: 16 * 1024,
            nic_tx_len: 16 * 1024,
            app_kin_len: 1024 * 64,
            app_kout_len: 1024 * 64,
            tcp_rxbuf_len: 8192,
            tcp_txbuf_len: 8192,
            tcp_rtt_init: 50,
            tcp_link_bw: 10,
            tcp_handshake_to: 10_000,
            tcp_handshake_retries: 10,
            tcp_window_scale: 0,
            tcp_future_acks: false,
            arp_to: 500,
            arp_to_max: 10_000_000,
            cc_algorithm: CcAlgorithm::DctcpRate,
            cc_control_granularity: 50,
            cc_control_interval: 2,
            cc_rexmit_ints: 4,
            cc_dctcp_weight: u32::MAX / 16,
            cc_dctcp_init: 10_000,
            cc_dctcp_step: 10_000,
            cc_dctcp_mimd: 0,
            cc_dctcp_min: 0,
            cc_dctcp_minpkts: 50,
            cc_const_rate: 0,
            cc_timely_tlow: 30,
            cc_timely_thigh: 150,
            cc_timely_step: 10_000,
            cc_timely_init: 10_000,
            cc_timely_alpha: (0.02 * u32::MAX as f64) as u32,
            cc_timely_beta: (0.8 * u32::MAX as f64) as u32,
            cc_timely_min_rtt: 11,
            cc_timely_min_rate: 10_000,
            fp_cores_max: 1,
            fp_no_ints: false,
            fp_no_hugepages: false,
            kni_name: None,
            ready_fd: None,
            quiet: false,
        }
    }
}

fn options() -> Options {
    let mut opts = Options::new();
    opts.reqopt("", "ip-addr", "local IP address", "A.B.C.D[/PREFIX]");
    opts.optmulti("", "ip-route", "add route", "DEST/PREFIX,NEXTHOP");
    opts.optopt("", "shm-len", "shared memory length", "LEN");
    opts.optopt("", "nic-rx-len", "admin rx queue length", "LEN");
    opts.optopt("", "nic-tx-len", "admin tx queue length", "LEN");
    opts.optopt("", "app-kin-len", "app->service queue length", "LEN");
    opts.optopt("", "app-kout-len", "service->app queue length", "LEN");
    opts.optopt("", "tcp-rxbuf-len", "flow rx buffer length", "LEN");
    opts.optopt("", "tcp-txbuf-len", "flow tx buffer length", "LEN");
    opts.optopt("", "tcp-rtt-init", "initial rtt for CC (us)", "RTT");
    opts.optopt("", "tcp-link-bw", "link bandwidth (gbps)", "BW");
    opts.optopt("", "tcp-handshake-timeout", "handshake timeout (us)", "TO");
    opts.optopt("", "tcp-handshake-retries", "handshake retries", "N");
    opts.optopt("", "tcp-window-scale", "advertised window scale", "WS");
    opts.optflag("", "tcp-future-acks", "accept acks ahead of sent data");
    opts.optopt("", "arp-timeout", "ARP request timeout (us)", "TO");
    opts.optopt("", "arp-timeout-max", "ARP request timeout ceiling (us)", "TO");
    opts.optopt(
        "",
        "cc",
        "congestion control algorithm",
        "dctcp-win|dctcp-rate|const-rate|timely",
    );
    opts.optopt("", "cc-control-granularity", "min control iter (us)", "N");
    opts.optopt("", "cc-control-interval", "control interval (rtts)", "N");
    opts.optopt("", "cc-rexmit-ints", "intervals before rexmit", "N");
    opts.optopt("", "cc-dctcp-weight", "DCTCP ewma weight", "W");
    opts.optopt("", "cc-dctcp-init", "DCTCP initial rate (kbps)", "R");
    opts.optopt("", "cc-dctcp-step", "DCTCP increase step (kbps)", "R");
    opts.optopt("", "cc-dctcp-mimd", "DCTCP multiplicative increase", "F");
    opts.optopt("", "cc-dctcp-min", "DCTCP minimum rate (kbps)", "R");
    opts.optopt("", "cc-dctcp-minpkts", "DCTCP min acks per update", "N");
    opts.optopt("", "cc-const-rate", "constant rate (kbps)", "R");
    opts.optopt("", "cc-timely-tlow", "TIMELY low threshold (us)", "T");
    opts.optopt("", "cc-timely-thigh", "TIMELY high threshold (us)", "T");
    opts.optopt("", "cc-timely-step", "TIMELY step (kbps)", "R");
    opts.optopt("", "cc-timely-init", "TIMELY initial rate (kbps)", "R");
    opts.optopt("", "cc-timely-alpha", "TIMELY ewma weight", "A");
    opts.optopt("", "cc-timely-beta", "TIMELY decrease factor", "B");
    opts.optopt("", "cc-timely-minrtt", "TIMELY minimal rtt (us)", "T");
    opts.optopt("", "cc-timely-minrate", "TIMELY minimal rate (kbps)", "R");
    opts.optopt("", "fp-cores-max", "max fast path cores", "N");
    opts.optflag("", "fp-no-ints", "disable fast path interrupts");
    opts.optflag("", "fp-no-hugepages", "do not use huge pages");
    opts.optopt("", "kni-name", "kernel tap interface name", "NAME");
    opts.optopt("", "ready-fd", "fd to signal on readiness", "FD");
    opts.optflag("", "quiet", "suppress statistics output");
    opts.optflag("h", "help", "print this help");
    opts
}

pub fn usage(progname: &str) -> String {
    options().usage(&format!(
        "Usage: {progname} [OPTION]... --ip-addr=IP[/PREFIXLEN]"
    ))
}

fn parse_ip_prefix(s: &str) -> Result<(u32, u8)> {
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => (a, p.parse::<u8>().context("bad prefix length")?),
        None => (s, 24),
    };
    if prefix > 32 {
        return Err(anyhow!("prefix length {prefix} out of range"));
    }
    let ip: Ipv4Addr = addr.parse().context("bad IP address")?;
    Ok((u32::from(ip), prefix))
}

fn parse_route(s: &str) -> Result<ConfigRoute> {
    let (dest, hop) = s
        .split_once(',')
        .ok_or_else(|| anyhow!("route must be DEST/PREFIX,NEXTHOP"))?;
    let (ip, prefix) = parse_ip_prefix(dest)?;
    let next: Ipv4Addr = hop.parse().context("bad next hop address")?;
    Ok(ConfigRoute {
        ip,
        prefix,
        next_hop: u32::from(next),
    })
}

macro_rules! opt_parse {
    ($matches:expr, $name:expr, $field:expr) => {
        if let Some(v) = $matches.opt_str($name) {
            $field = v
                .parse()
                .with_context(|| format!("invalid value for --{}", $name))?;
        }
    };
}

/// Parse the command line into a [`Config`].
///
/// Returns `Ok(None)` if `--help` was requested.
pub fn parse_args(args: &[String]) -> Result<Option<Config>> {
    // --help works even without the required --ip-addr
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Ok(None);
    }
    let opts = options();
    let matches = opts.parse(args).map_err(|e| anyhow!("{e}"))?;

    let mut c = Config::default();

    let ip_spec = matches.opt_str("ip-addr").unwrap_or_default();
    let (ip, prefix) = parse_ip_prefix(&ip_spec)?;
    c.ip = ip;
    c.ip_prefix = prefix;

    for r in matches.opt_strs("ip-route") {
        c.routes.push(parse_route(&r)?);
    }

    opt_parse!(matches, "shm-len", c.shm_len);
    opt_parse!(matches, "nic-rx-len", c.nic_rx_len);
    opt_parse!(matches, "nic-tx-len", c.nic_tx_len);
    opt_parse!(matches, "app-kin-len", c.app_kin_len);
    opt_parse!(matches, "app-kout-len", c.app_kout_len);
    opt_parse!(matches, "tcp-rxbuf-len", c.tcp_rxbuf_len);
    opt_parse!(matches, "tcp-txbuf-len", c.tcp_txbuf_len);
    opt_parse!(matches, "tcp-rtt-init", c.tcp_rtt_init);
    opt_parse!(matches, "tcp-link-bw", c.tcp_link_bw);
    opt_parse!(matches, "tcp-handshake-timeout", c.tcp_handshake_to);
    opt_parse!(matches, "tcp-handshake-retries", c.tcp_handshake_retries);
    opt_parse!(matches, "tcp-window-scale", c.tcp_window_scale);
    c.tcp_future_acks = matches.opt_present("tcp-future-acks");
    opt_parse!(matches, "arp-timeout", c.arp_to);
    opt_parse!(matches, "arp-timeout-max", c.arp_to_max);

    if let Some(alg) = matches.opt_str("cc") {
        c.cc_algorithm = match alg.as_str() {
            "dctcp-win" => CcAlgorithm::DctcpWin,
            "dctcp-rate" => CcAlgorithm::DctcpRate,
            "const-rate" => CcAlgorithm::ConstRate,
            "timely" => CcAlgorithm::Timely,
            other => return Err(anyhow!("unknown CC algorithm: {other}")),
        };
    }
    opt_parse!(matches, "cc-control-granularity", c.cc_control_granularity);
    opt_parse!(matches, "cc-control-interval", c.cc_control_interval);
    opt_parse!(matches, "cc-rexmit-ints", c.cc_rexmit_ints);
    if let Some(v) = matches.opt_str("cc-dctcp-weight") {
        let w: f64 = v.parse().context("invalid value for --cc-dctcp-weight")?;
        c.cc_dctcp_weight = (w * u32::MAX as f64) as u32;
    }
    opt_parse!(matches, "cc-dctcp-init", c.cc_dctcp_init);
    opt_parse!(matches, "cc-dctcp-step", c.cc_dctcp_step);
    if let Some(v) = matches.opt_str("cc-dctcp-mimd") {
        let f: f64 = v.parse().context("invalid value for --cc-dctcp-mimd")?;
        if f < 1.0 {
            return Err(anyhow!("--cc-dctcp-mimd must be >= 1"));
        }
        c.cc_dctcp_mimd = ((f - 1.0) * u32::MAX as f64) as u32;
    }
    opt_parse!(matches, "cc-dctcp-min", c.cc_dctcp_min);
    opt_parse!(matches, "cc-dctcp-minpkts", c.cc_dctcp_minpkts);
    opt_parse!(matches, "cc-const-rate", c.cc_const_rate);
    opt_parse!(matches, "cc-timely-tlow", c.cc_timely_tlow);
    opt_parse!(matches, "cc-timely-thigh", c.cc_timely_thigh);
    opt_parse!(matches, "cc-timely-step", c.cc_timely_step);
    opt_parse!(matches, "cc-timely-init", c.cc_timely_init);
    if let Some(v) = matches.opt_str("cc-timely-alpha") {
        let a: f64 = v.parse().context("invalid value for --cc-timely-alpha")?;
        c.cc_timely_alpha = (a * u32::MAX as f64) as u32;
    }
    if let Some(v) = matches.opt_str("cc-timely-beta") {
        let b: f64 = v.parse().context("invalid value for --cc-timely-beta")?;
        c.cc_timely_beta = (b * u32::MAX as f64) as u32;
    }
    opt_parse!(matches, "cc-timely-minrtt", c.cc_timely_min_rtt);
    opt_parse!(matches, "cc-timely-minrate", c.cc_timely_min_rate);

    opt_parse!(matches, "fp-cores-max", c.fp_cores_max);
    c.fp_no_ints = matches.opt_present("fp-no-ints");
    c.fp_no_hugepages = matches.opt_present("fp-no-hugepages");
    c.kni_name = matches.opt_str("kni-name");
    if let Some(v) = matches.opt_str("ready-fd") {
        c.ready_fd = Some(v.parse().context("invalid value for --ready-fd")?);
    }
    c.quiet = matches.opt_present("quiet");

    if c.fp_cores_max == 0 {
        return Err(anyhow!("--fp-cores-max must be at least 1"));
    }
    if c.tcp_rxbuf_len == 0 || c.tcp_txbuf_len == 0 {
        return Err(anyhow!("flow buffer lengths must be non-zero"));
    }

    Ok(Some(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn minimal_config() {
        let c = parse_args(&args(&["--ip-addr=10.0.0.1/24"]))
            .unwrap()
            .unwrap();
        assert_eq!(c.ip, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(c.ip_prefix, 24);
        assert_eq!(c.cc_algorithm, CcAlgorithm::DctcpRate);
    }

    #[test]
    fn cc_selection() {
        let c = parse_args(&args(&["--ip-addr=10.0.0.1", "--cc=timely"]))
            .unwrap()
            .unwrap();
        assert_eq!(c.cc_algorithm, CcAlgorithm::Timely);
    }

    #[test]
    fn missing_ip_is_error() {
        assert!(parse_args(&args(&["--quiet"])).is_err());
    }

    #[test]
    fn route_parsing() {
        let c = parse_args(&args(&[
            "--ip-addr=10.0.0.1/24",
            "--ip-route=192.168.0.0/16,10.0.0.254",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(c.routes.len(), 1);
        assert_eq!(c.routes[0].prefix, 16);
    }
}
