use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use log::{debug, error, info, warn};

use super::{PortState, SlowPath};
use crate::fastpath::context::notify_fd;
use crate::fastpath::state::PipelineState;
use crate::shm::layout::{
    AppIn, AppInConnInfo, AppOut, UxsockQueue, UxsockRequest, UxsockResponse, APPIN_SIZE,
    APPIN_STATUS_CONN_CLOSE, APPIN_STATUS_CONN_MOVE, APPIN_STATUS_LISTEN_CLOSE,
    APPIN_STATUS_LISTEN_OPEN, APPIN_STATUS_REQ_SCALE, APPOUT_LISTEN_REUSEPORT, APPOUT_SIZE,
    CONTROL_SOCKET_BACKLOG,
};
use crate::shm::PktMemHandle;

/// A context handshake received on the control socket, handed from the
/// socket thread to the poll loop.
pub struct UxConn {
    pub fd: i32,
    pub req: UxsockRequest,
    /// Application-side doorbell eventfd passed along the request.
    pub evfd: i32,
}

/// One application context: its admin queue pair plus per-core data rings.
pub struct AppContext {
    pub db_id: u16,
    pub evfd: i32,
    pub ready: bool,

    /// App -> service admin queue (appout entries).
    pub kin_base: u64,
    pub kin_len: u32,
    pub kin_pos: u32,
    /// Service -> app admin queue (appin entries).
    pub kout_base: u64,
    pub kout_len: u32,
    pub kout_pos: u32,

    /// Extent handles for the context's queues, held until teardown.
    #[allow(dead_code)]
    handles: Vec<PktMemHandle>,
}

/// An application attached over the control socket.
pub struct Application {
    pub id: u16,
    pub fd: i32,
    pub closed: bool,
    pub contexts: Vec<AppContext>,
    /// Open connection ids, for close-by-opaque lookups.
    pub conns: Vec<usize>,
    /// Listener ids.
    pub listeners: Vec<usize>,
}

/// Start the control socket thread.
///
/// The thread only moves bytes and file descriptors; all resource
/// allocation happens on the poll loop, which also writes the response
/// directly to the (blocking) socket.
pub(crate) fn uxsocket_start_path(
    tx: Sender<UxConn>,
    notifyfd: i32,
    pl: &Arc<PipelineState>,
    cores: usize,
    path: &[u8],
) -> Result<()> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    anyhow::ensure!(fd >= 0, "control socket: socket failed");

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    anyhow::ensure!(path.len() <= addr.sun_path.len(), "socket path too long");
    for (i, &b) in path.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let addr_len = std::mem::size_of::<libc::sa_family_t>() + path.len();

    let r = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len as libc::socklen_t,
        )
    };
    if r != 0 {
        unsafe { libc::close(fd) };
        return Err(anyhow!(
            "control socket: bind failed: {}",
            crate::shm::dma::errno_str()
        ));
    }
    let r = unsafe { libc::listen(fd, CONTROL_SOCKET_BACKLOG) };
    anyhow::ensure!(r == 0, "control socket: listen failed");

    let pl = pl.clone();
    thread::Builder::new()
        .name("warptcp-uxsock".into())
        .spawn(move || uxsocket_thread(fd, tx, notifyfd, pl, cores))
        .context("spawning control socket thread")?;
    Ok(())
}

fn uxsocket_thread(
    listen_fd: i32,
    tx: Sender<UxConn>,
    notifyfd: i32,
    pl: Arc<PipelineState>,
    cores: usize,
) {
    info!("control socket listening");
    loop {
        let cfd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if cfd < 0 {
            error!("control socket: accept failed");
            continue;
        }

        // one thread per application socket; requests on it are sequential
        let tx = tx.clone();
        let pl = pl.clone();
        let r = thread::Builder::new()
            .name("warptcp-uxconn".into())
            .spawn(move || uxsocket_conn(cfd, tx, notifyfd, pl, cores));
        if r.is_err() {
            error!("control socket: spawning connection thread failed");
            unsafe { libc::close(cfd) };
        }
    }
}

fn uxsocket_conn(cfd: i32, tx: Sender<UxConn>, notifyfd: i32, pl: Arc<PipelineState>, cores: usize) {
    if uxsocket_send_fds(cfd, &pl, cores).is_err() {
        error!("control socket: sending fds failed");
        unsafe { libc::close(cfd) };
        return;
    }

    // each request on the socket asks for one more context
    loop {
        match uxsocket_read_request(cfd) {
            Ok(Some((req, evfd))) => {
                if tx.send(UxConn { fd: cfd, req, evfd }).is_err() {
                    return;
                }
                notify_fd(notifyfd);
            }
            Ok(None) => {
                // peer closed
                unsafe { libc::close(cfd) };
                return;
            }
            Err(e) => {
                warn!("control socket: receive failed: {e}");
                unsafe { libc::close(cfd) };
                return;
            }
        }
    }
}

/// Pass the slow-path notify fd (with the core count as payload), then the
/// fast-path eventfds in groups of four.
fn uxsocket_send_fds(cfd: i32, pl: &PipelineState, cores: usize) -> Result<()> {
    send_with_fds(cfd, &(cores as u32).to_le_bytes(), &[pl_notify_placeholder()])?;

    let evfds: Vec<i32> = (0..cores)
        .map(|i| pl.kctx[i].evfd.load(Ordering::Acquire))
        .collect();
    for chunk in evfds.chunks(4) {
        send_with_fds(cfd, &[0u8], chunk)?;
    }
    Ok(())
}

// The notify fd travels via a process-global because the socket thread is
// spawned before the slow path publishes it; resolved at send time.
static NOTIFY_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

pub(crate) fn publish_notify_fd(fd: i32) {
    NOTIFY_FD.store(fd, Ordering::Release);
}

fn pl_notify_placeholder() -> i32 {
    NOTIFY_FD.load(Ordering::Acquire)
}

fn send_with_fds(fd: i32, payload: &[u8], fds: &[i32]) -> Result<()> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let space = libc::CMSG_SPACE((std::mem::size_of::<i32>() * fds.len()) as u32) as usize;
        let mut cbuf = vec![0u8; space];

        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((std::mem::size_of::<i32>() * fds.len()) as u32) as usize;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr(),
            libc::CMSG_DATA(cmsg) as *mut i32,
            fds.len(),
        );

        let n = libc::sendmsg(fd, &msg, 0);
        anyhow::ensure!(
            n == payload.len() as isize,
            "sendmsg: {}",
            crate::shm::dma::errno_str()
        );
    }
    Ok(())
}

/// Read one handshake request plus the app's doorbell eventfd.
fn uxsocket_read_request(fd: i32) -> Result<Option<(UxsockRequest, i32)>> {
    let mut buf = [0u8; UxsockRequest::ENCODED_LEN];
    let mut received = 0usize;
    let mut evfd = -1;

    while received < buf.len() {
        unsafe {
            let mut iov = libc::iovec {
                iov_base: buf[received..].as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len() - received,
            };
            let space = libc::CMSG_SPACE(std::mem::size_of::<i32>() as u32) as usize;
            let mut cbuf = vec![0u8; space];

            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = space;

            let n = libc::recvmsg(fd, &mut msg, 0);
            if n == 0 {
                return Ok(None);
            }
            anyhow::ensure!(n > 0, "recvmsg: {}", crate::shm::dma::errno_str());
            received += n as usize;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if !cmsg.is_null()
                && (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                evfd = *(libc::CMSG_DATA(cmsg) as *const i32);
            }
        }
    }
    Ok(Some((UxsockRequest::parse(&buf), evfd)))
}

impl SlowPath {
    /// Register new contexts announced by the socket thread and poll every
    /// ready context's admin queue.
    pub(crate) fn appif_poll(&mut self) -> usize {
        while let Ok(u) = self.ux_rx.try_recv() {
            if let Err(e) = self.appif_register_ctx(u) {
                warn!("appif: context registration failed: {e}");
            }
        }

        let mut n = 0;
        for app_id in 0..self.apps.len() {
            let Some(app) = &self.apps[app_id] else {
                continue;
            };
            if app.closed {
                continue;
            }
            for ctx_id in 0..app.contexts.len() {
                if !self.apps[app_id].as_ref().unwrap().contexts[ctx_id].ready {
                    continue;
                }
                n += self.appif_ctx_poll(app_id as u16, ctx_id);
            }
        }
        n
    }

    fn appif_register_ctx(&mut self, u: UxConn) -> Result<()> {
        let cores = self.nic.rxq_base.len();

        // find or create the application for this socket
        let app_id = match self
            .apps
            .iter()
            .position(|a| a.as_ref().map_or(false, |a| a.fd == u.fd && !a.closed))
        {
            Some(i) => i,
            None => {
                anyhow::ensure!(
                    self.apps.iter().filter(|a| a.is_some()).count()
                        < crate::shm::layout::APPST_NUM,
                    "too many applications"
                );
                let id = match self.apps.iter().position(|a| a.is_none()) {
                    Some(i) => i,
                    None => {
                        self.apps.push(None);
                        self.apps.len() - 1
                    }
                };
                self.apps[id] = Some(Application {
                    id: id as u16,
                    fd: u.fd,
                    closed: false,
                    contexts: Vec::new(),
                    conns: Vec::new(),
                    listeners: Vec::new(),
                });
                id
            }
        };

        let db_id = self
            .free_doorbells
            .pop()
            .ok_or_else(|| anyhow!("no free doorbells"))?;

        // admin queues
        let kin_len = self.cfg.app_kin_len / APPOUT_SIZE as u32 * APPOUT_SIZE as u32;
        let kout_len = self.cfg.app_kout_len / APPIN_SIZE as u32 * APPIN_SIZE as u32;
        let kin = self
            .pktmem
            .alloc(kin_len as u64)
            .map_err(|e| anyhow!(e))
            .with_context(|| context!())?;
        let kout = self
            .pktmem
            .alloc(kout_len as u64)
            .map_err(|e| anyhow!(e))
            .with_context(|| context!())?;
        self.dma.zero(kin.base(), kin_len as usize);
        self.dma.zero(kout.base(), kout_len as usize);

        // per-core data ring pairs
        let mut handles = vec![];
        let mut qs = Vec::with_capacity(cores);
        for core in 0..cores {
            let rxq = self
                .pktmem
                .alloc(u.req.rxq_len as u64)
                .map_err(|_| anyhow!("appif: rxq alloc"))?;
            let txq = self
                .pktmem
                .alloc(u.req.txq_len as u64)
                .map_err(|_| anyhow!("appif: txq alloc"))?;
            self.dma.zero(rxq.base(), u.req.rxq_len as usize);
            self.dma.zero(txq.base(), u.req.txq_len as usize);

            // publish to the fast path: bases first, lengths last
            let regs = &self.pl.appctx[core][0][db_id as usize];
            regs.rx_base.store(rxq.base(), Ordering::Relaxed);
            regs.tx_base.store(txq.base(), Ordering::Relaxed);
            regs.rx_head.store(0, Ordering::Relaxed);
            regs.tx_head.store(0, Ordering::Relaxed);
            regs.rx_avail.store(u.req.rxq_len, Ordering::Relaxed);
            regs.evfd.store(u.evfd, Ordering::Relaxed);
            regs.tx_len.store(u.req.txq_len, Ordering::Release);
            regs.rx_len.store(u.req.rxq_len, Ordering::Release);

            qs.push(UxsockQueue {
                rxq_off: rxq.base(),
                txq_off: txq.base(),
            });
            handles.push(rxq);
            handles.push(txq);
        }

        let ctx = AppContext {
            db_id,
            evfd: u.evfd,
            ready: true,
            kin_base: kin.base(),
            kin_len,
            kin_pos: 0,
            kout_base: kout.base(),
            kout_len,
            kout_pos: 0,
            handles,
        };

        let resp = UxsockResponse {
            app_out_off: kin.base(),
            app_in_off: kout.base(),
            app_out_len: kin_len,
            app_in_len: kout_len,
            status: 0,
            db_id,
            qs_num: cores as u16,
            qs,
        };
        let mut buf = vec![0u8; resp.encoded_len()];
        resp.emit(&mut buf);
        let n = unsafe { libc::send(u.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n != buf.len() as isize {
            warn!("appif: short response send");
        }

        let app = self.apps[app_id].as_mut().unwrap();
        let mut ctx = ctx;
        ctx.handles.push(kin);
        ctx.handles.push(kout);
        app.contexts.push(ctx);
        debug!("appif: context db={db_id} registered for app {app_id}");
        Ok(())
    }

    /// Process pending admin requests from one context.
    fn appif_ctx_poll(&mut self, app_id: u16, ctx_id: usize) -> usize {
        let mut n = 0;
        for _ in 0..8 {
            let (base, len, pos) = {
                let ctx = &self.apps[app_id as usize].as_ref().unwrap().contexts[ctx_id];
                (ctx.kin_base, ctx.kin_len, ctx.kin_pos)
            };
            let off = base + pos as u64;

            let t = self.dma.slot_type(off, APPOUT_SIZE);
            if t == 0 {
                break;
            }
            let mut payload = [0u8; APPOUT_SIZE - 1];
            self.dma.read(off, &mut payload);
            let op = AppOut::parse(t, &payload);
            self.dma.clear_slot(off, APPOUT_SIZE);

            {
                let ctx = &mut self.apps[app_id as usize].as_mut().unwrap().contexts[ctx_id];
                ctx.kin_pos = (pos + APPOUT_SIZE as u32) % len;
            }

            match op {
                Some(op) => self.appif_handle(app_id, ctx_id, op),
                None => warn!("appif: unknown request type {t}"),
            }
            n += 1;
        }
        n
    }

    fn appif_handle(&mut self, app_id: u16, ctx_id: usize, op: AppOut) {
        match op {
            AppOut::ConnOpen {
                opaque,
                remote_ip,
                flags: _,
                remote_port,
            } => {
                let db_id = self.apps[app_id as usize].as_ref().unwrap().contexts[ctx_id].db_id;
                match self.tcp_open(app_id, ctx_id, opaque, remote_ip, remote_port, db_id) {
                    Ok(id) => {
                        self.apps[app_id as usize].as_mut().unwrap().conns.push(id);
                    }
                    Err(status) => {
                        self.kout_push(
                            app_id,
                            ctx_id,
                            AppIn::ConnOpened(AppInConnInfo {
                                opaque,
                                status,
                                ..Default::default()
                            }),
                        );
                    }
                }
            }

            AppOut::ConnClose {
                opaque,
                remote_ip,
                remote_port,
                local_port,
                ..
            } => {
                let found = self.app_conn_find(app_id, opaque, remote_ip, remote_port, local_port);
                match found {
                    Some(id) => {
                        if self.tcp_close(id).is_err() {
                            self.kout_push(
                                app_id,
                                ctx_id,
                                AppIn::Status {
                                    kind: APPIN_STATUS_CONN_CLOSE,
                                    opaque,
                                    status: -1,
                                },
                            );
                        }
                    }
                    None => {
                        warn!("appif: close for unknown connection");
                        self.kout_push(
                            app_id,
                            ctx_id,
                            AppIn::Status {
                                kind: APPIN_STATUS_CONN_CLOSE,
                                opaque,
                                status: -1,
                            },
                        );
                    }
                }
            }

            AppOut::ConnMove {
                opaque,
                remote_ip,
                remote_port,
                local_port,
                db_id,
                ..
            } => {
                let status = match self.app_conn_find(app_id, opaque, remote_ip, remote_port, local_port)
                {
                    Some(id) => {
                        let flow_id = self.conn(id).flow_id;
                        self.nicif_connection_move(flow_id, db_id);
                        0
                    }
                    None => -1,
                };
                self.kout_push(
                    app_id,
                    ctx_id,
                    AppIn::Status {
                        kind: APPIN_STATUS_CONN_MOVE,
                        opaque,
                        status,
                    },
                );
            }

            AppOut::ListenOpen {
                opaque,
                backlog,
                local_port,
                flags,
            } => {
                let reuseport = flags & APPOUT_LISTEN_REUSEPORT != 0;
                let status =
                    match self.tcp_listen(app_id, ctx_id, opaque, local_port, backlog, reuseport) {
                        Ok(lid) => {
                            self.apps[app_id as usize]
                                .as_mut()
                                .unwrap()
                                .listeners
                                .push(lid);
                            0
                        }
                        Err(s) => s,
                    };
                self.kout_push(
                    app_id,
                    ctx_id,
                    AppIn::Status {
                        kind: APPIN_STATUS_LISTEN_OPEN,
                        opaque,
                        status,
                    },
                );
            }

            AppOut::ListenClose { opaque, local_port } => {
                let status = self.listen_close(app_id, opaque, local_port);
                self.kout_push(
                    app_id,
                    ctx_id,
                    AppIn::Status {
                        kind: APPIN_STATUS_LISTEN_CLOSE,
                        opaque,
                        status,
                    },
                );
            }

            AppOut::AcceptConn {
                listen_opaque,
                conn_opaque,
                local_port: _,
            } => {
                let lid = self.app_listener_find(app_id, listen_opaque);
                let db_id = self.apps[app_id as usize].as_ref().unwrap().contexts[ctx_id].db_id;
                match lid {
                    Some(lid) => {
                        if self
                            .tcp_accept(app_id, ctx_id, conn_opaque, lid, db_id)
                            .is_err()
                        {
                            warn!("appif: accept failed");
                        }
                    }
                    None => warn!("appif: accept on unknown listener"),
                }
            }

            AppOut::ReqScale { num_cores } => {
                let status = self.req_scale(num_cores);
                self.kout_push(
                    app_id,
                    ctx_id,
                    AppIn::Status {
                        kind: APPIN_STATUS_REQ_SCALE,
                        opaque: 0,
                        status,
                    },
                );
            }
        }
    }

    /// Rebalance the RSS steering table over `num_cores` cores; moved flows
    /// migrate lazily through the forwarding rings on their next touch.
    fn req_scale(&mut self, num_cores: u32) -> i32 {
        let cores = self.nic.rxq_base.len() as u32;
        if num_cores == 0 || num_cores > cores {
            return -1;
        }
        for (fg, slot) in self.pl.flow_group_steering.iter().enumerate() {
            slot.store((fg as u32 % num_cores) as u8, Ordering::Relaxed);
        }
        info!("scaled fast path steering to {num_cores} cores");
        0
    }

    fn listen_close(&mut self, app_id: u16, opaque: u64, local_port: u16) -> i32 {
        let Some(lid) = self.app_listener_find(app_id, opaque) else {
            return -1;
        };
        match &mut self.ports[local_port as usize] {
            p @ PortState::Listen(_) => *p = PortState::Unused,
            PortState::ListenMulti(ls) => {
                ls.retain(|&l| l != lid);
                if ls.is_empty() {
                    self.ports[local_port as usize] = PortState::Unused;
                }
            }
            _ => return -1,
        }
        self.listeners[lid] = None;
        let app = self.apps[app_id as usize].as_mut().unwrap();
        app.listeners.retain(|&l| l != lid);
        0
    }

    fn app_conn_find(
        &self,
        app_id: u16,
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
        local_port: u16,
    ) -> Option<usize> {
        let app = self.apps[app_id as usize].as_ref()?;
        app.conns
            .iter()
            .copied()
            .find(|&id| {
                self.conns[id].as_ref().map_or(false, |c| {
                    c.opaque == opaque
                        && c.remote_ip == remote_ip
                        && c.remote_port == remote_port
                        && c.local_port == local_port
                })
            })
    }

    fn app_listener_find(&self, app_id: u16, opaque: u64) -> Option<usize> {
        let app = self.apps[app_id as usize].as_ref()?;
        app.listeners
            .iter()
            .copied()
            .find(|&lid| self.listeners[lid].as_ref().map_or(false, |l| l.opaque == opaque))
    }

    /// Append an entry to a context's service->app admin queue and ring its
    /// doorbell.
    pub(crate) fn kout_push(&mut self, app_id: u16, ctx_id: usize, entry: AppIn) {
        let Some(app) = self.apps.get(app_id as usize).and_then(|a| a.as_ref()) else {
            warn!("kout_push: unknown app {app_id}");
            return;
        };
        let Some(ctx) = app.contexts.get(ctx_id) else {
            warn!("kout_push: unknown context {ctx_id}");
            return;
        };
        let (base, len, pos, evfd) = (ctx.kout_base, ctx.kout_len, ctx.kout_pos, ctx.evfd);

        let off = base + pos as u64;
        if self.dma.slot_type(off, APPIN_SIZE) != 0 {
            warn!("kout_push: queue full, dropping completion");
            return;
        }
        let mut payload = [0u8; APPIN_SIZE - 1];
        entry.emit(&mut payload);
        self.dma.publish_slot(off, APPIN_SIZE, &payload, entry.type_byte());

        let app = self.apps[app_id as usize].as_mut().unwrap();
        app.contexts[ctx_id].kout_pos = (pos + APPIN_SIZE as u32) % len;

        notify_fd(evfd);
    }

    /*************************************************************************/
    /* Callbacks from the TCP module */

    pub(crate) fn appif_conn_opened(&mut self, id: usize, status: i32) {
        let (app_id, ctx_id, info) = {
            let c = self.conn(id);
            (
                c.app_id,
                c.ctx_id,
                AppInConnInfo {
                    opaque: c.opaque,
                    rx_off: c.rx_off,
                    tx_off: c.tx_off,
                    rx_len: c.rx_len,
                    tx_len: c.tx_len,
                    status,
                    seq_rx: c.remote_seq,
                    seq_tx: c.local_seq,
                    flow_id: c.flow_id,
                    local_ip: c.local_ip,
                    remote_ip: c.remote_ip,
                    local_port: c.local_port,
                    remote_port: c.remote_port,
                    fn_core: c.fn_core,
                },
            )
        };
        self.kout_push(app_id, ctx_id, AppIn::ConnOpened(info));
    }

    pub(crate) fn appif_accept_conn(&mut self, id: usize, status: i32) {
        let (app_id, ctx_id, info) = {
            let c = self.conn(id);
            (
                c.app_id,
                c.ctx_id,
                AppInConnInfo {
                    opaque: c.opaque,
                    rx_off: c.rx_off,
                    tx_off: c.tx_off,
                    rx_len: c.rx_len,
                    tx_len: c.tx_len,
                    status,
                    seq_rx: c.remote_seq,
                    seq_tx: c.local_seq.wrapping_add(1),
                    flow_id: c.flow_id,
                    local_ip: c.local_ip,
                    remote_ip: c.remote_ip,
                    local_port: c.local_port,
                    remote_port: c.remote_port,
                    fn_core: c.fn_core,
                },
            )
        };
        if status == 0 {
            let app_idx = app_id as usize;
            if let Some(Some(app)) = self.apps.get_mut(app_idx) {
                app.conns.push(id);
            }
        }
        self.kout_push(app_id, ctx_id, AppIn::AcceptedConn(info));
    }

    pub(crate) fn appif_conn_closed(&mut self, id: usize, status: i32) {
        let (app_id, ctx_id, opaque) = {
            let c = self.conn(id);
            (c.app_id, c.ctx_id, c.opaque)
        };
        if let Some(Some(app)) = self.apps.get_mut(app_id as usize) {
            app.conns.retain(|&c| c != id);
        }
        self.kout_push(
            app_id,
            ctx_id,
            AppIn::Status {
                kind: APPIN_STATUS_CONN_CLOSE,
                opaque,
                status,
            },
        );
    }

    pub(crate) fn appif_listen_newconn(
        &mut self,
        app_id: u16,
        ctx_id: usize,
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
    ) {
        self.kout_push(
            app_id,
            ctx_id,
            AppIn::ListenNewConn {
                opaque,
                remote_ip,
                remote_port,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::{UxsockResponse, APPIN_CONN_OPENED, APPOUT_CONN_OPEN, APPOUT_LISTEN_OPEN};
    use crate::slowpath::tests_common::test_slowpath;
    use crate::slowpath::{ConnStatus, SlowPath};

    fn socketpair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let r = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(r, 0);
        (fds[0], fds[1])
    }

    fn register_ctx(sp: &mut SlowPath) -> (u16, i32) {
        let (svc_fd, app_fd) = socketpair();
        sp.appif_register_ctx(UxConn {
            fd: svc_fd,
            req: UxsockRequest {
                rxq_len: 16 * crate::shm::layout::ARX_SIZE as u32,
                txq_len: 16 * crate::shm::layout::ATX_SIZE as u32,
            },
            evfd: -1,
        })
        .unwrap();

        // the response arrives on the app side of the pair
        let mut buf = [0u8; 256];
        let n = unsafe {
            libc::recv(app_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert!(n as usize >= UxsockResponse::FIXED_LEN);
        (0, app_fd)
    }

    fn push_appout(sp: &SlowPath, app_id: u16, op: &AppOut) {
        let ctx = &sp.apps[app_id as usize].as_ref().unwrap().contexts[0];
        // producer side: next free slot is where kin_pos points while the
        // queue is empty in these tests
        let off = ctx.kin_base + ctx.kin_pos as u64;
        let mut payload = [0u8; APPOUT_SIZE - 1];
        op.emit(&mut payload);
        sp.dma.publish_slot(off, APPOUT_SIZE, &payload, op.type_byte());
    }

    fn pop_appin(sp: &SlowPath, app_id: u16, slot: u32) -> Option<AppIn> {
        let ctx = &sp.apps[app_id as usize].as_ref().unwrap().contexts[0];
        let off = ctx.kout_base + (slot * APPIN_SIZE as u32) as u64;
        let t = sp.dma.slot_type(off, APPIN_SIZE);
        if t == 0 {
            return None;
        }
        let mut payload = [0u8; APPIN_SIZE - 1];
        sp.dma.read(off, &mut payload);
        sp.dma.clear_slot(off, APPIN_SIZE);
        AppIn::parse(t, &payload)
    }

    #[test]
    fn context_registration_publishes_rings() {
        let mut sp = test_slowpath(1);
        let (app_id, _fd) = register_ctx(&mut sp);

        let app = sp.apps[app_id as usize].as_ref().unwrap();
        assert_eq!(app.contexts.len(), 1);
        let db = app.contexts[0].db_id as usize;

        // fast-path registers are live
        let regs = &sp.pl.appctx[0][0][db];
        assert_ne!(regs.rx_len.load(Ordering::Acquire), 0);
        assert_ne!(regs.tx_len.load(Ordering::Acquire), 0);
    }

    #[test]
    fn listen_open_round_trip() {
        let mut sp = test_slowpath(1);
        let (app_id, _fd) = register_ctx(&mut sp);

        push_appout(
            &sp,
            app_id,
            &AppOut::ListenOpen {
                opaque: 0x77,
                backlog: 8,
                local_port: 8080,
                flags: 0,
            },
        );
        sp.appif_poll();

        // completion with status 0
        match pop_appin(&sp, app_id, 0) {
            Some(AppIn::Status { kind, opaque, status }) => {
                assert_eq!(kind, APPIN_STATUS_LISTEN_OPEN);
                assert_eq!(opaque, 0x77);
                assert_eq!(status, 0);
            }
            other => panic!("unexpected completion {other:?}"),
        }
        assert!(matches!(sp.ports[8080], PortState::Listen(_)));
        let _ = APPOUT_LISTEN_OPEN;
    }

    #[test]
    fn conn_open_starts_handshake() {
        let mut sp = test_slowpath(1);
        let (app_id, _fd) = register_ctx(&mut sp);

        push_appout(
            &sp,
            app_id,
            &AppOut::ConnOpen {
                opaque: 0x99,
                remote_ip: 0x0a000042,
                flags: 0,
                remote_port: 443,
            },
        );
        sp.appif_poll();

        // the connection is waiting on ARP and owned by the app
        let app = sp.apps[app_id as usize].as_ref().unwrap();
        assert_eq!(app.conns.len(), 1);
        let id = app.conns[0];
        assert_eq!(sp.conn(id).status, ConnStatus::ArpPending);
        assert_eq!(sp.conn(id).opaque, 0x99);

        // an ARP request for the target went out
        let frames = sp.nic_tx_frames();
        assert!(frames.iter().any(|f| {
            crate::wire::EthernetFrame::new_checked(&f[..])
                .map(|e| e.ethertype() == crate::wire::EthernetProtocol::Arp)
                .unwrap_or(false)
        }));
        let _ = (APPOUT_CONN_OPEN, APPIN_CONN_OPENED);
    }

    #[test]
    fn req_scale_rewrites_steering() {
        let mut sp = test_slowpath(1);
        let (app_id, _fd) = register_ctx(&mut sp);

        push_appout(&sp, app_id, &AppOut::ReqScale { num_cores: 1 });
        sp.appif_poll();

        match pop_appin(&sp, app_id, 0) {
            Some(AppIn::Status { kind, status, .. }) => {
                assert_eq!(kind, APPIN_STATUS_REQ_SCALE);
                assert_eq!(status, 0);
            }
            other => panic!("unexpected completion {other:?}"),
        }
        // a single core keeps every flow group
        assert!(sp
            .pl
            .flow_group_steering
            .iter()
            .all(|s| s.load(Ordering::Relaxed) == 0));

        // scaling beyond the core count is refused
        push_appout(&sp, app_id, &AppOut::ReqScale { num_cores: 4 });
        sp.appif_poll();
        match pop_appin(&sp, app_id, 1) {
            Some(AppIn::Status { status, .. }) => assert_eq!(status, -1),
            other => panic!("unexpected completion {other:?}"),
        }
    }
}
