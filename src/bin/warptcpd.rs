use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{Context, Result};
use log::{error, info, warn};

use warptcp::config::{self, Config};
use warptcp::fastpath::state::PipelineState;
use warptcp::fastpath::DataplaneContext;
use warptcp::phy::{LinkPort, Loopback};
use warptcp::shm::layout::{self, ServiceInfo, FLAG_HUGEPAGES, FLAG_READY};
use warptcp::shm::DmaMem;
use warptcp::slowpath::SlowPath;
use warptcp::wire::EthernetAddress;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match config::parse_args(&args) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => {
            print!("{}", config::usage("warptcpd"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("warptcpd: {e:#}");
            eprint!("{}", config::usage("warptcpd"));
            return ExitCode::FAILURE;
        }
    };

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: Config) -> Result<()> {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    let cores = cfg.fp_cores_max as usize;
    let hugepages = !cfg.fp_no_hugepages;

    let dma = Arc::new(
        DmaMem::alloc("warptcp_memory", cfg.shm_len, hugepages).context("DMA memory")?,
    );
    let pl = Arc::new(PipelineState::new(cores, layout::FLOWST_NUM));

    // stable locally-administered MAC
    let mac = EthernetAddress([0x02, 0x57, 0x54, 0x43, 0x50, 0x01]);

    // the in-tree link port; a deployment provides a driver-backed one
    let link: Arc<dyn LinkPort> = Arc::new(Loopback::new(cores, mac));
    if cfg.kni_name.is_some() {
        warn!("--kni-name set, but the host tap lives outside this binary");
    }

    // initial RSS steering: flow groups striped over the cores
    let mut rss = vec![0u16; layout::MAX_FLOWGROUPS];
    for (fg, slot) in rss.iter_mut().enumerate() {
        *slot = (fg % cores) as u16;
    }
    link.write_rss_table(&rss);
    for (fg, slot) in pl.flow_group_steering.iter().enumerate() {
        slot.store((fg % cores) as u8, Ordering::Relaxed);
    }

    let mut slowpath = SlowPath::new(cfg.clone(), pl.clone(), dma.clone(), mac, cores)
        .context("slow path init")?;

    // per-core forwarding channels for RSS reshuffles
    let mut fwd_txs = Vec::with_capacity(cores);
    let mut fwd_rxs = Vec::with_capacity(cores);
    for _ in 0..cores {
        let (tx, rx) = mpsc::channel();
        fwd_txs.push(tx);
        fwd_rxs.push(rx);
    }

    let mut contexts = Vec::with_capacity(cores);
    for (core, fwd_rx) in fwd_rxs.into_iter().enumerate() {
        let ctx = DataplaneContext::new(
            core as u16,
            &cfg,
            pl.clone(),
            dma.clone(),
            link.open_queue(core as u16),
            mac,
            link.offloads_checksum(),
            fwd_rx,
            fwd_txs.clone(),
            slowpath.notifyfd,
        )
        .with_context(|| format!("dataplane context {core}"))?;
        contexts.push(ctx);
    }

    publish_info(&cfg, cores, mac, &dma, hugepages).context("info page")?;
    signal_ready(&cfg);

    let blocking = !cfg.fp_no_ints;
    let mut handles = Vec::with_capacity(cores);
    for mut ctx in contexts {
        let core = ctx.core_id();
        let h = thread::Builder::new()
            .name(format!("warptcp-fp{core}"))
            .spawn(move || {
                pin_to_core(core as usize);
                ctx.run(&RUNNING, blocking);
            })
            .context("spawning fast path thread")?;
        handles.push(h);
    }

    slowpath.run(&RUNNING, true);

    for h in handles {
        if h.join().is_err() {
            error!("fast path thread panicked");
        }
    }
    info!("shutdown complete");
    Ok(())
}

/// Publish the service info page for applications (and the guest proxy).
fn publish_info(
    cfg: &Config,
    cores: usize,
    mac: EthernetAddress,
    dma: &DmaMem,
    hugepages: bool,
) -> Result<()> {
    let info_mem = DmaMem::alloc("warptcp_info", layout::INFO_BYTES as u64, false)?;

    let mut mac_u64 = 0u64;
    for (i, b) in mac.as_bytes().iter().enumerate() {
        mac_u64 |= (*b as u64) << (8 * i);
    }

    let info = ServiceInfo {
        flags: FLAG_READY | if hugepages { FLAG_HUGEPAGES } else { 0 },
        dma_mem_size: dma.len(),
        internal_mem_size: (std::mem::size_of::<PipelineState>()) as u64,
        mac_address: mac_u64,
        poll_cycle_app: 10_000,
        poll_cycle_tas: 10_000,
        qmq_num: layout::FLOWST_NUM as u32,
        cores_num: cores as u32,
    };
    let mut page = [0u8; ServiceInfo::ENCODED_LEN];
    info.emit(&mut page);
    info_mem.write(0, &page);

    // keep the page mapped for the process lifetime
    std::mem::forget(info_mem);
    info!("service ready: {cores} cores, {} bytes DMA memory", cfg.shm_len);
    Ok(())
}

fn signal_ready(cfg: &Config) {
    if let Some(fd) = cfg.ready_fd {
        let val = 1u64;
        let r = unsafe {
            libc::write(
                fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if r < 0 {
            warn!("writing to --ready-fd failed");
        }
    }
}

fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        let r = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if r != 0 {
            warn!("pinning to core {core} failed");
        }
    }
}
