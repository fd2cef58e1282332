/*! On-memory formats shared with applications.

Queue entries are little-endian, packed, power-of-two sized so they never
straddle cache lines. The last byte of every slot is the `type`
discriminator: it doubles as the publication flag, written last by
producers and tested first by consumers (see
[`DmaMem::publish_slot`](super::DmaMem::publish_slot)).
*/

use byteorder::{ByteOrder, LittleEndian};

/// Size of the service info page.
pub const INFO_BYTES: usize = 0x1000;

/// Service is done initializing.
pub const FLAG_READY: u64 = 1;
/// Shared memory is on huge pages.
pub const FLAG_HUGEPAGES: u64 = 2;

/// Layout of the info page applications map first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceInfo {
    /// See FLAG_*.
    pub flags: u64,
    /// Size of DMA memory region in bytes.
    pub dma_mem_size: u64,
    /// Size of internal pipeline memory in bytes.
    pub internal_mem_size: u64,
    /// Local MAC address.
    pub mac_address: u64,
    /// Cycles an application polls before blocking.
    pub poll_cycle_app: u64,
    /// Cycles the service polls before blocking.
    pub poll_cycle_tas: u64,
    /// Number of queue manager queues.
    pub qmq_num: u32,
    /// Number of fast-path cores.
    pub cores_num: u32,
}

impl ServiceInfo {
    pub const ENCODED_LEN: usize = 56;

    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.flags);
        LittleEndian::write_u64(&mut buf[8..16], self.dma_mem_size);
        LittleEndian::write_u64(&mut buf[16..24], self.internal_mem_size);
        LittleEndian::write_u64(&mut buf[24..32], self.mac_address);
        LittleEndian::write_u64(&mut buf[32..40], self.poll_cycle_app);
        LittleEndian::write_u64(&mut buf[40..48], self.poll_cycle_tas);
        LittleEndian::write_u32(&mut buf[48..52], self.qmq_num);
        LittleEndian::write_u32(&mut buf[52..56], self.cores_num);
    }

    pub fn parse(buf: &[u8]) -> ServiceInfo {
        ServiceInfo {
            flags: LittleEndian::read_u64(&buf[0..8]),
            dma_mem_size: LittleEndian::read_u64(&buf[8..16]),
            internal_mem_size: LittleEndian::read_u64(&buf[16..24]),
            mac_address: LittleEndian::read_u64(&buf[24..32]),
            poll_cycle_app: LittleEndian::read_u64(&buf[32..40]),
            poll_cycle_tas: LittleEndian::read_u64(&buf[40..48]),
            qmq_num: LittleEndian::read_u32(&buf[48..52]),
            cores_num: LittleEndian::read_u32(&buf[52..56]),
        }
    }
}

/// Pipeline sizing constants.
pub const APPST_NUM: usize = 8;
pub const APPST_CTX_NUM: usize = 31;
pub const APPST_CTX_MCS: usize = 16;
pub const APPCTX_NUM: usize = 16;
/// Tenant (VM) slots; single-tenant deployments use slot 0 only.
pub const VMST_NUM: usize = 16;
pub const FLOWST_NUM: usize = 128 * 1024;
pub const FLOWHT_ENTRIES: usize = FLOWST_NUM * 2;
pub const FLOWHT_NBSZ: usize = 4;
pub const MAX_FLOWGROUPS: usize = 4096;

/******************************************************************************/
/* Slow-path admin RX queue (fast path -> slow path) */

pub const KRX_INVALID: u8 = 0x0;
pub const KRX_PACKET: u8 = 0x1;

pub const KRX_SIZE: usize = 64;

/// Admin rx entry: a packet handed up to the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KrxPacket {
    /// DMA offset of the packet buffer.
    pub addr: u64,
    pub len: u16,
    /// Fast-path core the packet arrived on.
    pub fn_core: u16,
    /// RSS flow group of the packet.
    pub flow_group: u16,
}

impl KrxPacket {
    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.addr);
        LittleEndian::write_u16(&mut buf[8..10], self.len);
        LittleEndian::write_u16(&mut buf[10..12], self.fn_core);
        LittleEndian::write_u16(&mut buf[12..14], self.flow_group);
    }

    pub fn parse(buf: &[u8]) -> KrxPacket {
        KrxPacket {
            addr: LittleEndian::read_u64(&buf[0..8]),
            len: LittleEndian::read_u16(&buf[8..10]),
            fn_core: LittleEndian::read_u16(&buf[10..12]),
            flow_group: LittleEndian::read_u16(&buf[12..14]),
        }
    }
}

/******************************************************************************/
/* Slow-path admin TX queue (slow path -> fast path) */

pub const KTX_INVALID: u8 = 0x0;
pub const KTX_PACKET: u8 = 0x1;
pub const KTX_CONNRETRAN: u8 = 0x2;
pub const KTX_PACKET_NOTS: u8 = 0x3;

pub const KTX_SIZE: usize = 64;

/// Admin tx entry: raw packet or retransmit command for a fast-path core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtxMsg {
    /// Send the buffer at `addr`, injecting the current TCP timestamp.
    Packet { addr: u64, len: u16 },
    /// Send the buffer at `addr` verbatim.
    PacketNoTs { addr: u64, len: u16 },
    /// Roll the flow back to its last acknowledged position and re-arm.
    ConnRetran { flow_id: u32 },
}

impl KtxMsg {
    pub fn type_byte(&self) -> u8 {
        match self {
            KtxMsg::Packet { .. } => KTX_PACKET,
            KtxMsg::PacketNoTs { .. } => KTX_PACKET_NOTS,
            KtxMsg::ConnRetran { .. } => KTX_CONNRETRAN,
        }
    }

    pub fn emit(&self, buf: &mut [u8]) {
        match *self {
            KtxMsg::Packet { addr, len } | KtxMsg::PacketNoTs { addr, len } => {
                LittleEndian::write_u64(&mut buf[0..8], addr);
                LittleEndian::write_u16(&mut buf[8..10], len);
            }
            KtxMsg::ConnRetran { flow_id } => {
                LittleEndian::write_u32(&mut buf[0..4], flow_id);
            }
        }
    }

    /// Decode from payload bytes plus the already-read type byte.
    pub fn parse(type_byte: u8, buf: &[u8]) -> Option<KtxMsg> {
        match type_byte {
            KTX_PACKET => Some(KtxMsg::Packet {
                addr: LittleEndian::read_u64(&buf[0..8]),
                len: LittleEndian::read_u16(&buf[8..10]),
            }),
            KTX_PACKET_NOTS => Some(KtxMsg::PacketNoTs {
                addr: LittleEndian::read_u64(&buf[0..8]),
                len: LittleEndian::read_u16(&buf[8..10]),
            }),
            KTX_CONNRETRAN => Some(KtxMsg::ConnRetran {
                flow_id: LittleEndian::read_u32(&buf[0..4]),
            }),
            _ => None,
        }
    }
}

/******************************************************************************/
/* Application RX queue (service -> app) */

pub const ARX_INVALID: u8 = 0x0;
pub const ARX_CONNUPDATE: u8 = 0x1;

/// Receive direction of the flow finished (FIN delivered).
pub const ARX_FL_RXDONE: u8 = 0x1;

pub const ARX_SIZE: usize = 32;

/// Update of a flow's receive and transmit queue pointers toward the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArxConnUpdate {
    pub opaque: u64,
    pub rx_bump: u32,
    pub rx_pos: u32,
    pub tx_bump: u32,
    pub flags: u8,
}

impl ArxConnUpdate {
    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.opaque);
        LittleEndian::write_u32(&mut buf[8..12], self.rx_bump);
        LittleEndian::write_u32(&mut buf[12..16], self.rx_pos);
        LittleEndian::write_u32(&mut buf[16..20], self.tx_bump);
        buf[20] = self.flags;
    }

    pub fn parse(buf: &[u8]) -> ArxConnUpdate {
        ArxConnUpdate {
            opaque: LittleEndian::read_u64(&buf[0..8]),
            rx_bump: LittleEndian::read_u32(&buf[8..12]),
            rx_pos: LittleEndian::read_u32(&buf[12..16]),
            tx_bump: LittleEndian::read_u32(&buf[16..20]),
            flags: buf[20],
        }
    }
}

/******************************************************************************/
/* Application TX queue (app -> service) */

pub const ATX_INVALID: u8 = 0x0;
pub const ATX_CONNUPDATE: u8 = 0x1;

/// App is done transmitting on the flow (needs one dummy byte).
pub const ATX_FL_TXDONE: u8 = 0x1;

pub const ATX_SIZE: usize = 16;

/// Update of a flow's queue pointers from the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtxConnUpdate {
    pub rx_bump: u32,
    pub tx_bump: u32,
    pub flow_id: u32,
    pub bump_seq: u16,
    pub flags: u8,
}

impl AtxConnUpdate {
    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.rx_bump);
        LittleEndian::write_u32(&mut buf[4..8], self.tx_bump);
        LittleEndian::write_u32(&mut buf[8..12], self.flow_id);
        LittleEndian::write_u16(&mut buf[12..14], self.bump_seq);
        buf[14] = self.flags;
    }

    pub fn parse(buf: &[u8]) -> AtxConnUpdate {
        AtxConnUpdate {
            rx_bump: LittleEndian::read_u32(&buf[0..4]),
            tx_bump: LittleEndian::read_u32(&buf[4..8]),
            flow_id: LittleEndian::read_u32(&buf[8..12]),
            bump_seq: LittleEndian::read_u16(&buf[12..14]),
            flags: buf[14],
        }
    }
}

/******************************************************************************/
/* Admin channel: app -> service (over the per-context admin queue) */

pub const APPOUT_INVALID: u8 = 0;
pub const APPOUT_CONN_OPEN: u8 = 1;
pub const APPOUT_CONN_CLOSE: u8 = 2;
pub const APPOUT_CONN_MOVE: u8 = 3;
pub const APPOUT_LISTEN_OPEN: u8 = 4;
pub const APPOUT_LISTEN_CLOSE: u8 = 5;
pub const APPOUT_ACCEPT_CONN: u8 = 6;
pub const APPOUT_REQ_SCALE: u8 = 7;

/// Close carries a reset request.
pub const APPOUT_CLOSE_RESET: u32 = 0x1;
/// Listener wants reuseport.
pub const APPOUT_LISTEN_REUSEPORT: u8 = 0x1;

pub const APPOUT_SIZE: usize = 64;

/// Admin operations from applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppOut {
    ConnOpen {
        opaque: u64,
        remote_ip: u32,
        flags: u32,
        remote_port: u16,
    },
    ConnClose {
        opaque: u64,
        remote_ip: u32,
        local_ip: u32,
        remote_port: u16,
        local_port: u16,
        flags: u32,
    },
    ConnMove {
        opaque: u64,
        remote_ip: u32,
        local_ip: u32,
        remote_port: u16,
        local_port: u16,
        db_id: u16,
    },
    ListenOpen {
        opaque: u64,
        backlog: u32,
        local_port: u16,
        flags: u8,
    },
    ListenClose {
        opaque: u64,
        local_port: u16,
    },
    AcceptConn {
        listen_opaque: u64,
        conn_opaque: u64,
        local_port: u16,
    },
    ReqScale {
        num_cores: u32,
    },
}

impl AppOut {
    pub fn type_byte(&self) -> u8 {
        match self {
            AppOut::ConnOpen { .. } => APPOUT_CONN_OPEN,
            AppOut::ConnClose { .. } => APPOUT_CONN_CLOSE,
            AppOut::ConnMove { .. } => APPOUT_CONN_MOVE,
            AppOut::ListenOpen { .. } => APPOUT_LISTEN_OPEN,
            AppOut::ListenClose { .. } => APPOUT_LISTEN_CLOSE,
            AppOut::AcceptConn { .. } => APPOUT_ACCEPT_CONN,
            AppOut::ReqScale { .. } => APPOUT_REQ_SCALE,
        }
    }

    pub fn emit(&self, buf: &mut [u8]) {
        match *self {
            AppOut::ConnOpen {
                opaque,
                remote_ip,
                flags,
                remote_port,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], opaque);
                LittleEndian::write_u32(&mut buf[8..12], remote_ip);
                LittleEndian::write_u32(&mut buf[12..16], flags);
                LittleEndian::write_u16(&mut buf[16..18], remote_port);
            }
            AppOut::ConnClose {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                flags,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], opaque);
                LittleEndian::write_u32(&mut buf[8..12], remote_ip);
                LittleEndian::write_u32(&mut buf[12..16], local_ip);
                LittleEndian::write_u16(&mut buf[16..18], remote_port);
                LittleEndian::write_u16(&mut buf[18..20], local_port);
                LittleEndian::write_u32(&mut buf[20..24], flags);
            }
            AppOut::ConnMove {
                opaque,
                remote_ip,
                local_ip,
                remote_port,
                local_port,
                db_id,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], opaque);
                LittleEndian::write_u32(&mut buf[8..12], remote_ip);
                LittleEndian::write_u32(&mut buf[12..16], local_ip);
                LittleEndian::write_u16(&mut buf[16..18], remote_port);
                LittleEndian::write_u16(&mut buf[18..20], local_port);
                LittleEndian::write_u16(&mut buf[20..22], db_id);
            }
            AppOut::ListenOpen {
                opaque,
                backlog,
                local_port,
                flags,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], opaque);
                LittleEndian::write_u32(&mut buf[8..12], backlog);
                LittleEndian::write_u16(&mut buf[12..14], local_port);
                buf[14] = flags;
            }
            AppOut::ListenClose { opaque, local_port } => {
                LittleEndian::write_u64(&mut buf[0..8], opaque);
                LittleEndian::write_u16(&mut buf[8..10], local_port);
            }
            AppOut::AcceptConn {
                listen_opaque,
                conn_opaque,
                local_port,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], listen_opaque);
                LittleEndian::write_u64(&mut buf[8..16], conn_opaque);
                LittleEndian::write_u16(&mut buf[16..18], local_port);
            }
            AppOut::ReqScale { num_cores } => {
                LittleEndian::write_u32(&mut buf[0..4], num_cores);
            }
        }
    }

    pub fn parse(type_byte: u8, buf: &[u8]) -> Option<AppOut> {
        match type_byte {
            APPOUT_CONN_OPEN => Some(AppOut::ConnOpen {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                remote_ip: LittleEndian::read_u32(&buf[8..12]),
                flags: LittleEndian::read_u32(&buf[12..16]),
                remote_port: LittleEndian::read_u16(&buf[16..18]),
            }),
            APPOUT_CONN_CLOSE => Some(AppOut::ConnClose {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                remote_ip: LittleEndian::read_u32(&buf[8..12]),
                local_ip: LittleEndian::read_u32(&buf[12..16]),
                remote_port: LittleEndian::read_u16(&buf[16..18]),
                local_port: LittleEndian::read_u16(&buf[18..20]),
                flags: LittleEndian::read_u32(&buf[20..24]),
            }),
            APPOUT_CONN_MOVE => Some(AppOut::ConnMove {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                remote_ip: LittleEndian::read_u32(&buf[8..12]),
                local_ip: LittleEndian::read_u32(&buf[12..16]),
                remote_port: LittleEndian::read_u16(&buf[16..18]),
                local_port: LittleEndian::read_u16(&buf[18..20]),
                db_id: LittleEndian::read_u16(&buf[20..22]),
            }),
            APPOUT_LISTEN_OPEN => Some(AppOut::ListenOpen {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                backlog: LittleEndian::read_u32(&buf[8..12]),
                local_port: LittleEndian::read_u16(&buf[12..14]),
                flags: buf[14],
            }),
            APPOUT_LISTEN_CLOSE => Some(AppOut::ListenClose {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                local_port: LittleEndian::read_u16(&buf[8..10]),
            }),
            APPOUT_ACCEPT_CONN => Some(AppOut::AcceptConn {
                listen_opaque: LittleEndian::read_u64(&buf[0..8]),
                conn_opaque: LittleEndian::read_u64(&buf[8..16]),
                local_port: LittleEndian::read_u16(&buf[16..18]),
            }),
            APPOUT_REQ_SCALE => Some(AppOut::ReqScale {
                num_cores: LittleEndian::read_u32(&buf[0..4]),
            }),
            _ => None,
        }
    }
}

/******************************************************************************/
/* Admin channel: service -> app */

pub const APPIN_INVALID: u8 = 0;
pub const APPIN_STATUS_CONN_CLOSE: u8 = 1;
pub const APPIN_STATUS_CONN_MOVE: u8 = 2;
pub const APPIN_STATUS_LISTEN_OPEN: u8 = 3;
pub const APPIN_STATUS_LISTEN_CLOSE: u8 = 4;
pub const APPIN_STATUS_REQ_SCALE: u8 = 5;
pub const APPIN_CONN_OPENED: u8 = 6;
pub const APPIN_LISTEN_NEWCONN: u8 = 7;
pub const APPIN_ACCEPTED_CONN: u8 = 8;

pub const APPIN_SIZE: usize = 64;

/// Completion details for an opened or accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppInConnInfo {
    pub opaque: u64,
    pub rx_off: u64,
    pub tx_off: u64,
    pub rx_len: u32,
    pub tx_len: u32,
    pub status: i32,
    pub seq_rx: u32,
    pub seq_tx: u32,
    pub flow_id: u32,
    pub local_ip: u32,
    pub remote_ip: u32,
    pub local_port: u16,
    pub remote_port: u16,
    pub fn_core: u16,
}

/// Admin completions and events toward applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppIn {
    /// Generic operation status; `kind` is one of APPIN_STATUS_*.
    Status { kind: u8, opaque: u64, status: i32 },
    ConnOpened(AppInConnInfo),
    ListenNewConn {
        opaque: u64,
        remote_ip: u32,
        remote_port: u16,
    },
    AcceptedConn(AppInConnInfo),
}

impl AppIn {
    pub fn type_byte(&self) -> u8 {
        match self {
            AppIn::Status { kind, .. } => *kind,
            AppIn::ConnOpened(_) => APPIN_CONN_OPENED,
            AppIn::ListenNewConn { .. } => APPIN_LISTEN_NEWCONN,
            AppIn::AcceptedConn(_) => APPIN_ACCEPTED_CONN,
        }
    }

    fn emit_conn_info(info: &AppInConnInfo, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], info.opaque);
        LittleEndian::write_u64(&mut buf[8..16], info.rx_off);
        LittleEndian::write_u64(&mut buf[16..24], info.tx_off);
        LittleEndian::write_u32(&mut buf[24..28], info.rx_len);
        LittleEndian::write_u32(&mut buf[28..32], info.tx_len);
        LittleEndian::write_i32(&mut buf[32..36], info.status);
        LittleEndian::write_u32(&mut buf[36..40], info.seq_rx);
        LittleEndian::write_u32(&mut buf[40..44], info.seq_tx);
        LittleEndian::write_u32(&mut buf[44..48], info.flow_id);
        LittleEndian::write_u32(&mut buf[48..52], info.local_ip);
        LittleEndian::write_u32(&mut buf[52..56], info.remote_ip);
        LittleEndian::write_u16(&mut buf[56..58], info.local_port);
        LittleEndian::write_u16(&mut buf[58..60], info.remote_port);
        LittleEndian::write_u16(&mut buf[60..62], info.fn_core);
    }

    fn parse_conn_info(buf: &[u8]) -> AppInConnInfo {
        AppInConnInfo {
            opaque: LittleEndian::read_u64(&buf[0..8]),
            rx_off: LittleEndian::read_u64(&buf[8..16]),
            tx_off: LittleEndian::read_u64(&buf[16..24]),
            rx_len: LittleEndian::read_u32(&buf[24..28]),
            tx_len: LittleEndian::read_u32(&buf[28..32]),
            status: LittleEndian::read_i32(&buf[32..36]),
            seq_rx: LittleEndian::read_u32(&buf[36..40]),
            seq_tx: LittleEndian::read_u32(&buf[40..44]),
            flow_id: LittleEndian::read_u32(&buf[44..48]),
            local_ip: LittleEndian::read_u32(&buf[48..52]),
            remote_ip: LittleEndian::read_u32(&buf[52..56]),
            local_port: LittleEndian::read_u16(&buf[56..58]),
            remote_port: LittleEndian::read_u16(&buf[58..60]),
            fn_core: LittleEndian::read_u16(&buf[60..62]),
        }
    }

    pub fn emit(&self, buf: &mut [u8]) {
        match self {
            AppIn::Status { opaque, status, .. } => {
                LittleEndian::write_u64(&mut buf[0..8], *opaque);
                LittleEndian::write_i32(&mut buf[8..12], *status);
            }
            AppIn::ConnOpened(info) | AppIn::AcceptedConn(info) => {
                Self::emit_conn_info(info, buf);
            }
            AppIn::ListenNewConn {
                opaque,
                remote_ip,
                remote_port,
            } => {
                LittleEndian::write_u64(&mut buf[0..8], *opaque);
                LittleEndian::write_u32(&mut buf[8..12], *remote_ip);
                LittleEndian::write_u16(&mut buf[12..14], *remote_port);
            }
        }
    }

    pub fn parse(type_byte: u8, buf: &[u8]) -> Option<AppIn> {
        match type_byte {
            APPIN_STATUS_CONN_CLOSE
            | APPIN_STATUS_CONN_MOVE
            | APPIN_STATUS_LISTEN_OPEN
            | APPIN_STATUS_LISTEN_CLOSE
            | APPIN_STATUS_REQ_SCALE => Some(AppIn::Status {
                kind: type_byte,
                opaque: LittleEndian::read_u64(&buf[0..8]),
                status: LittleEndian::read_i32(&buf[8..12]),
            }),
            APPIN_CONN_OPENED => Some(AppIn::ConnOpened(Self::parse_conn_info(buf))),
            APPIN_ACCEPTED_CONN => Some(AppIn::AcceptedConn(Self::parse_conn_info(buf))),
            APPIN_LISTEN_NEWCONN => Some(AppIn::ListenNewConn {
                opaque: LittleEndian::read_u64(&buf[0..8]),
                remote_ip: LittleEndian::read_u32(&buf[8..12]),
                remote_port: LittleEndian::read_u16(&buf[12..14]),
            }),
            _ => None,
        }
    }
}

/******************************************************************************/
/* Unix control socket */

/// Abstract unix socket address applications connect to.
pub const CONTROL_SOCKET_PATH: &[u8] = b"\0flexnic_os";
/// Control socket listen backlog.
pub const CONTROL_SOCKET_BACKLOG: i32 = 8;

/// Application handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UxsockRequest {
    pub rxq_len: u32,
    pub txq_len: u32,
}

impl UxsockRequest {
    pub const ENCODED_LEN: usize = 8;

    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.rxq_len);
        LittleEndian::write_u32(&mut buf[4..8], self.txq_len);
    }

    pub fn parse(buf: &[u8]) -> UxsockRequest {
        UxsockRequest {
            rxq_len: LittleEndian::read_u32(&buf[0..4]),
            txq_len: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Per-core ring pair offsets in the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UxsockQueue {
    pub rxq_off: u64,
    pub txq_off: u64,
}

/// Application handshake response, followed by `qs.len()` queue pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UxsockResponse {
    pub app_out_off: u64,
    pub app_in_off: u64,
    pub app_out_len: u32,
    pub app_in_len: u32,
    pub status: u32,
    pub db_id: u16,
    pub qs_num: u16,
    pub qs: Vec<UxsockQueue>,
}

impl UxsockResponse {
    pub const FIXED_LEN: usize = 32;

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.qs.len() * 16
    }

    pub fn emit(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.app_out_off);
        LittleEndian::write_u64(&mut buf[8..16], self.app_in_off);
        LittleEndian::write_u32(&mut buf[16..20], self.app_out_len);
        LittleEndian::write_u32(&mut buf[20..24], self.app_in_len);
        LittleEndian::write_u32(&mut buf[24..28], self.status);
        LittleEndian::write_u16(&mut buf[28..30], self.db_id);
        LittleEndian::write_u16(&mut buf[30..32], self.qs_num);
        for (i, q) in self.qs.iter().enumerate() {
            let off = Self::FIXED_LEN + i * 16;
            LittleEndian::write_u64(&mut buf[off..off + 8], q.rxq_off);
            LittleEndian::write_u64(&mut buf[off + 8..off + 16], q.txq_off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atx_roundtrip() {
        let e = AtxConnUpdate {
            rx_bump: 1024,
            tx_bump: 32,
            flow_id: 77,
            bump_seq: 12,
            flags: ATX_FL_TXDONE,
        };
        let mut buf = [0u8; ATX_SIZE - 1];
        e.emit(&mut buf);
        assert_eq!(AtxConnUpdate::parse(&buf), e);
    }

    #[test]
    fn arx_roundtrip() {
        let e = ArxConnUpdate {
            opaque: 0xdead_beef_cafe,
            rx_bump: 1448,
            rx_pos: 4096,
            tx_bump: 0,
            flags: ARX_FL_RXDONE,
        };
        let mut buf = [0u8; ARX_SIZE - 1];
        e.emit(&mut buf);
        assert_eq!(ArxConnUpdate::parse(&buf), e);
    }

    #[test]
    fn ktx_variants() {
        let mut buf = [0u8; KTX_SIZE - 1];
        let m = KtxMsg::ConnRetran { flow_id: 42 };
        m.emit(&mut buf);
        assert_eq!(KtxMsg::parse(m.type_byte(), &buf), Some(m));

        let m = KtxMsg::Packet {
            addr: 0x10000,
            len: 96,
        };
        m.emit(&mut buf);
        assert_eq!(KtxMsg::parse(m.type_byte(), &buf), Some(m));
        assert_eq!(KtxMsg::parse(0, &buf), None);
    }

    #[test]
    fn appout_variants() {
        let mut buf = [0u8; APPOUT_SIZE - 1];
        let ops = [
            AppOut::ConnOpen {
                opaque: 1,
                remote_ip: 0x0a000001,
                flags: 0,
                remote_port: 80,
            },
            AppOut::ListenOpen {
                opaque: 2,
                backlog: 8,
                local_port: 8080,
                flags: APPOUT_LISTEN_REUSEPORT,
            },
            AppOut::AcceptConn {
                listen_opaque: 2,
                conn_opaque: 3,
                local_port: 8080,
            },
            AppOut::ReqScale { num_cores: 4 },
        ];
        for op in ops {
            op.emit(&mut buf);
            assert_eq!(AppOut::parse(op.type_byte(), &buf), Some(op));
        }
    }

    #[test]
    fn appin_conn_opened_roundtrip() {
        let info = AppInConnInfo {
            opaque: 7,
            rx_off: 0x1000,
            tx_off: 0x3000,
            rx_len: 8192,
            tx_len: 8192,
            status: 0,
            seq_rx: 1000,
            seq_tx: 2000,
            flow_id: 5,
            local_ip: 0x0a000001,
            remote_ip: 0x0a000002,
            local_port: 12345,
            remote_port: 80,
            fn_core: 1,
        };
        let mut buf = [0u8; APPIN_SIZE - 1];
        let e = AppIn::ConnOpened(info);
        e.emit(&mut buf);
        assert_eq!(AppIn::parse(e.type_byte(), &buf), Some(e));
    }

    #[test]
    fn service_info_roundtrip() {
        let info = ServiceInfo {
            flags: FLAG_READY,
            dma_mem_size: 1 << 30,
            internal_mem_size: 1 << 24,
            mac_address: 0x0201_0304_0506,
            poll_cycle_app: 1000,
            poll_cycle_tas: 1000,
            qmq_num: FLOWST_NUM as u32,
            cores_num: 2,
        };
        let mut buf = [0u8; ServiceInfo::ENCODED_LEN];
        info.emit(&mut buf);
        let back = ServiceInfo::parse(&buf);
        assert_eq!(back.flags, FLAG_READY);
        assert_eq!(back.cores_num, 2);
        assert_eq!(back.qmq_num, FLOWST_NUM as u32);
    }
}
