use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;
use std::net::Ipv4Addr;

use super::ipv4::checksum;
use super::{Error, IpProtocol, Result};

/// TCP header flag bits (in the low 9 bits of the offset/flags word).
pub mod flags {
    pub const FIN: u16 = 0x001;
    pub const SYN: u16 = 0x002;
    pub const RST: u16 = 0x004;
    pub const PSH: u16 = 0x008;
    pub const ACK: u16 = 0x010;
    pub const URG: u16 = 0x020;
    pub const ECE: u16 = 0x040;
    pub const CWR: u16 = 0x080;
    pub const NS: u16 = 0x100;
}

/// Option kinds understood by the service.
pub const OPT_KIND_EOL: u8 = 0;
pub const OPT_KIND_NOP: u8 = 1;
pub const OPT_KIND_MSS: u8 = 2;
pub const OPT_KIND_WS: u8 = 3;
pub const OPT_KIND_TIMESTAMP: u8 = 8;

/// Unpadded length of the timestamp option.
pub const TS_OPT_LEN: usize = 10;
/// Timestamp option length padded to a 4-byte boundary.
pub const TS_OPT_LEN_PADDED: usize = (TS_OPT_LEN + 3) & !3;

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const OPTIONS: Rest = URGENT.end..;
}

pub const HEADER_LEN: usize = field::URGENT.end;

/// A parsed timestamp option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampOpt {
    pub ts_val: u32,
    pub ts_ecr: u32,
}

/// Pointers to parsed TCP options.
///
/// `ts_off` is the offset of the timestamp option value (past kind and
/// length) from the start of the TCP header, so the fast path can patch the
/// timestamps in place when it turns a received segment into an ACK.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOpts {
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub ts: Option<TimestampOpt>,
    pub ts_off: usize,
}

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the header
    /// (including options) claims.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            Err(Error)
        } else {
            let header_len = self.header_len() as usize;
            if header_len < HEADER_LEN || len < header_len {
                Err(Error)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> u32 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u32(&data[field::SEQ_NUM])
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u32(&data[field::ACK_NUM])
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        ((NetworkEndian::read_u16(&data[field::FLAGS]) >> 12) * 4) as u8
    }

    /// Return the flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::FLAGS]) & 0x0fff
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Validate the packet checksum.
    pub fn verify_checksum(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> bool {
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }

    /// Parse the option list.
    ///
    /// Returns `Err(Error)` on malformed options (truncated list, bad option
    /// length). Unknown options are skipped.
    pub fn options(&self) -> Result<TcpOpts> {
        let data = self.buffer.as_ref();
        let opts_len = self.header_len() as usize - HEADER_LEN;
        if HEADER_LEN + opts_len > data.len() {
            return Err(Error);
        }
        let opt = &data[HEADER_LEN..HEADER_LEN + opts_len];

        let mut parsed = TcpOpts::default();
        let mut off = 0;
        while off < opt.len() {
            let kind = opt[off];
            match kind {
                OPT_KIND_EOL => break,
                OPT_KIND_NOP => {
                    off += 1;
                    continue;
                }
                _ => (),
            }
            if opt.len() - off < 2 {
                return Err(Error);
            }
            let len = opt[off + 1] as usize;
            if len < 2 || off + len > opt.len() {
                return Err(Error);
            }
            match kind {
                OPT_KIND_MSS => {
                    if len != 4 {
                        return Err(Error);
                    }
                    parsed.mss = Some(NetworkEndian::read_u16(&opt[off + 2..off + 4]));
                }
                OPT_KIND_WS => {
                    if len != 3 {
                        return Err(Error);
                    }
                    parsed.wscale = Some(opt[off + 2]);
                }
                OPT_KIND_TIMESTAMP => {
                    if len != TS_OPT_LEN {
                        return Err(Error);
                    }
                    parsed.ts = Some(TimestampOpt {
                        ts_val: NetworkEndian::read_u32(&opt[off + 2..off + 6]),
                        ts_ecr: NetworkEndian::read_u32(&opt[off + 6..off + 10]),
                    });
                    parsed.ts_off = HEADER_LEN + off + 2;
                }
                _ => (),
            }
            off += len;
        }

        Ok(parsed)
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[self.header_len() as usize..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ_NUM], value)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: u32) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK_NUM], value)
    }

    /// Set the header length (in octets) and flag bits in one store.
    #[inline]
    pub fn set_header_len_flags(&mut self, header_len: u8, flags: u16) {
        let data = self.buffer.as_mut();
        let raw = ((header_len as u16 / 4) << 12) | (flags & 0x0fff);
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the flag bits, preserving the header length.
    #[inline]
    pub fn set_flags(&mut self, flags: u16) {
        let header_len = self.header_len();
        self.set_header_len_flags(header_len, flags)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Write a timestamp option value at `ts_off` (from [`TcpOpts::ts_off`]).
    #[inline]
    pub fn patch_timestamps(&mut self, ts_off: usize, ts_val: u32, ts_ecr: u32) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[ts_off..ts_off + 4], ts_val);
        NetworkEndian::write_u32(&mut data[ts_off + 4..ts_off + 8], ts_ecr);
    }

    /// Return a mutable pointer to the options area.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[field::OPTIONS.start..header_len]
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }

    /// Compute and fill in the checksum over the whole buffer.
    pub fn fill_checksum(&mut self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum)
    }
}

/// Write a padded timestamp option into `buf` and return the bytes used.
///
/// Trailing pad bytes are zero, which reads back as end-of-options.
pub fn emit_ts_option(buf: &mut [u8], ts_val: u32, ts_ecr: u32) -> usize {
    buf[..TS_OPT_LEN_PADDED].fill(0);
    buf[0] = OPT_KIND_TIMESTAMP;
    buf[1] = TS_OPT_LEN as u8;
    NetworkEndian::write_u32(&mut buf[2..6], ts_val);
    NetworkEndian::write_u32(&mut buf[6..10], ts_ecr);
    TS_OPT_LEN_PADDED
}

/// Write an MSS option into `buf` and return the bytes used.
pub fn emit_mss_option(buf: &mut [u8], mss: u16) -> usize {
    buf[0] = OPT_KIND_MSS;
    buf[1] = 4;
    NetworkEndian::write_u16(&mut buf[2..4], mss);
    4
}

/// Write a window scale option into `buf` and return the bytes used.
pub fn emit_ws_option(buf: &mut [u8], scale: u8) -> usize {
    buf[0] = OPT_KIND_WS;
    buf[1] = 3;
    buf[2] = scale;
    3
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} ack={} flags={:03x} win={}",
            self.src_port(),
            self.dst_port(),
            self.seq_number(),
            self.ack_number(),
            self.flags(),
            self.window_len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_segment(opts: &[u8]) -> Vec<u8> {
        let header_len = HEADER_LEN + opts.len();
        let mut bytes = vec![0u8; header_len + 4];
        {
            let mut packet = Packet::new_unchecked(&mut bytes[..]);
            packet.set_src_port(4321);
            packet.set_dst_port(80);
            packet.set_seq_number(0x01020304);
            packet.set_ack_number(0x0a0b0c0d);
            packet.set_header_len_flags(header_len as u8, flags::PSH | flags::ACK);
            packet.set_window_len(8192);
            packet.set_urgent_at(0);
        }
        bytes[HEADER_LEN..header_len].copy_from_slice(opts);
        bytes
    }

    #[test]
    fn header_fields() {
        let bytes = build_segment(&[]);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.src_port(), 4321);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), 0x01020304);
        assert_eq!(packet.ack_number(), 0x0a0b0c0d);
        assert_eq!(packet.flags(), flags::PSH | flags::ACK);
        assert_eq!(packet.header_len() as usize, HEADER_LEN);
        assert_eq!(packet.payload().len(), 4);
    }

    #[test]
    fn parse_timestamp_option() {
        let mut opts = [0u8; 12];
        emit_ts_option(&mut opts, 0x11223344, 0x55667788);
        let bytes = build_segment(&opts);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let parsed = packet.options().unwrap();
        let ts = parsed.ts.unwrap();
        assert_eq!(ts.ts_val, 0x11223344);
        assert_eq!(ts.ts_ecr, 0x55667788);
        assert_eq!(parsed.ts_off, HEADER_LEN + 2);
    }

    #[test]
    fn parse_syn_options() {
        let mut opts = [0u8; 20];
        let mut off = emit_mss_option(&mut opts, 1460);
        off += emit_ws_option(&mut opts[off..], 7);
        off += emit_ts_option(&mut opts[off..], 1, 0);
        let bytes = build_segment(&opts[..off.next_multiple_of(4)]);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let parsed = packet.options().unwrap();
        assert_eq!(parsed.mss, Some(1460));
        assert_eq!(parsed.wscale, Some(7));
        assert!(parsed.ts.is_some());
    }

    #[test]
    fn malformed_option_length() {
        // timestamp option claiming 3 bytes
        let bytes = build_segment(&[OPT_KIND_TIMESTAMP, 3, 0, 0]);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert!(packet.options().is_err());
    }

    #[test]
    fn patch_timestamps_in_place() {
        let mut opts = [0u8; 12];
        emit_ts_option(&mut opts, 1, 2);
        let mut bytes = build_segment(&opts);
        let ts_off = {
            let packet = Packet::new_checked(&bytes[..]).unwrap();
            packet.options().unwrap().ts_off
        };
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.patch_timestamps(ts_off, 100, 200);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let ts = packet.options().unwrap().ts.unwrap();
        assert_eq!(ts.ts_val, 100);
        assert_eq!(ts.ts_ecr, 200);
    }
}
