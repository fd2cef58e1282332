/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*: functions to
extract fields from sequences of octets and to insert fields into sequences
of octets, through the `Packet` family of structures, plus compact
`Repr` representations where the space of valid values is small.

The `Packet::new_checked` method is a shorthand for a combination of
`Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input it is *necessary* to use `new_checked`; so long as the buffer is not
modified, no accessor will fail afterwards. When emitting output it is
*incorrect* to use `new_checked`; the buffer length for emission is not
calculated by the `Packet` layer.
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

use core::fmt;

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    HEADER_LEN as ETHERNET_HEADER_LEN,
};

mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
    PACKET_LEN as ARP_PACKET_LEN,
};

pub(crate) mod ipv4;
pub use self::ipv4::{
    checksum, Packet as Ipv4Packet, Protocol as IpProtocol, HEADER_LEN as IPV4_HEADER_LEN,
};

pub(crate) mod tcp;
pub use self::tcp::{
    emit_mss_option, emit_ts_option, emit_ws_option, flags as tcpflags, Packet as TcpPacket,
    TcpOpts, TimestampOpt, HEADER_LEN as TCP_HEADER_LEN, TS_OPT_LEN_PADDED,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by warptcp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
