//! Bounds-checked frame parsing.
//!
//! Every read goes through [`bytes_at`], which refuses any access whose end
//! lies past the buffer. Nothing here indexes a slice directly.

use std::net::Ipv4Addr;

use kgguard_common::{PROTO_TCP, PROTO_UDP};

use crate::error::ParseError;
use crate::headers::{EthHdr, Ipv4Hdr, TcpHdr, UdpHdr, ETH_P_IP};

/// Where the IPv4 header starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// 14-byte Ethernet header in front of IPv4
    #[default]
    Ethernet,
    /// IPv4 at offset 0 (tun / WireGuard interfaces)
    RawIp,
}

impl LinkMode {
    pub fn from_config(value: u32) -> Self {
        if value == 1 {
            LinkMode::RawIp
        } else {
            LinkMode::Ethernet
        }
    }
}

/// Fields the pipeline needs from one frame. Built once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub proto: u8,
    /// 0 when unknown (non-TCP/UDP, fragment, or truncated L4)
    pub src_port: u16,
    pub dst_port: u16,
    /// Frame length as handed to the engine
    pub total_len: u32,
    pub is_fragment: bool,
    /// 0 unless a TCP header reaches the flags byte
    pub tcp_flags: u8,
    /// First four UDP payload bytes, when present
    pub payload_head: Option<[u8; 4]>,
}

impl PacketDescriptor {
    pub fn has_tcp_flag(&self, mask: u8) -> bool {
        self.proto == PROTO_TCP && self.tcp_flags & mask != 0
    }
}

/// Copy `N` bytes starting at `offset`, failing if the range leaves `data`.
#[inline(always)]
pub fn bytes_at<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let end = offset.checked_add(N).ok_or(ParseError::Truncated {
        need: usize::MAX,
        have: data.len(),
    })?;
    match data.get(offset..end) {
        Some(slice) => {
            let mut out = [0u8; N];
            out.copy_from_slice(slice);
            Ok(out)
        }
        None => Err(ParseError::Truncated {
            need: end,
            have: data.len(),
        }),
    }
}

#[inline(always)]
pub fn u16_at(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    bytes_at(data, offset).map(u16::from_be_bytes)
}

#[inline(always)]
pub fn u32_at(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    bytes_at(data, offset).map(u32::from_be_bytes)
}

/// Parse one frame into a [`PacketDescriptor`].
///
/// Fails on a buffer too short for the link + IPv4 header, a non-IPv4
/// ether type, an IHL below 5 words, or an IHL that points past the buffer.
/// L4 fields are best effort: a short L4 header leaves ports at 0.
pub fn parse_frame(data: &[u8], mode: LinkMode) -> Result<PacketDescriptor, ParseError> {
    let ip_offset = match mode {
        LinkMode::Ethernet => {
            let eth = EthHdr::parse(data)?;
            if eth.ether_type != ETH_P_IP {
                return Err(ParseError::NotIpv4 {
                    ether_type: eth.ether_type,
                });
            }
            EthHdr::LEN
        }
        LinkMode::RawIp => 0,
    };

    let ip = Ipv4Hdr::parse(data, ip_offset)?;
    if ip.ihl() < Ipv4Hdr::MIN_IHL {
        return Err(ParseError::BadHeaderLength { ihl: ip.ihl() });
    }

    let l4_offset = ip_offset + ip.header_len();
    if l4_offset > data.len() {
        return Err(ParseError::Truncated {
            need: l4_offset,
            have: data.len(),
        });
    }

    let mut desc = PacketDescriptor {
        src_addr: Ipv4Addr::from(ip.src_addr),
        dst_addr: Ipv4Addr::from(ip.dst_addr),
        proto: ip.proto,
        src_port: 0,
        dst_port: 0,
        total_len: u32::try_from(data.len()).unwrap_or(u32::MAX),
        is_fragment: ip.is_fragment(),
        tcp_flags: 0,
        payload_head: None,
    };

    // Fragments are one opaque class; no L4 parsing
    if desc.is_fragment {
        return Ok(desc);
    }

    if ip.proto == PROTO_TCP || ip.proto == PROTO_UDP {
        if let Ok([s0, s1, d0, d1]) = bytes_at::<4>(data, l4_offset) {
            desc.src_port = u16::from_be_bytes([s0, s1]);
            desc.dst_port = u16::from_be_bytes([d0, d1]);
        }
    }

    if ip.proto == PROTO_TCP {
        if let Ok([flags]) = bytes_at::<1>(data, l4_offset + TcpHdr::FLAGS_OFFSET) {
            desc.tcp_flags = flags;
        }
    } else if ip.proto == PROTO_UDP {
        desc.payload_head = bytes_at::<4>(data, l4_offset + UdpHdr::LEN).ok();
    }

    Ok(desc)
}


#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;
    use kgguard_common::{PROTO_ICMP, TCP_FLAG_ACK, TCP_FLAG_SYN};

    const SRC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);
    const DST: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    #[test]
    fn parses_tcp_ports_and_flags() {
        let f = tcp(SRC, DST, 40000, 27015, TCP_FLAG_SYN | TCP_FLAG_ACK);
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!(d.src_addr, SRC);
        assert_eq!(d.dst_addr, DST);
        assert_eq!(d.src_port, 40000);
        assert_eq!(d.dst_port, 27015);
        assert_eq!(d.tcp_flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(d.total_len as usize, f.len());
        assert!(!d.is_fragment);
        assert!(d.payload_head.is_none());
    }

    #[test]
    fn parses_udp_payload_head() {
        let f = udp(SRC, DST, 5000, 27015, &[0xFF, 0xFF, 0xFF, 0xFF, 0x54]);
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!(d.payload_head, Some([0xFF; 4]));
        assert_eq!(d.dst_port, 27015);
    }

    #[test]
    fn short_udp_payload_has_no_head() {
        let f = udp(SRC, DST, 5000, 27015, &[0xFF, 0xFF]);
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!(d.payload_head, None);
    }

    #[test]
    fn icmp_has_no_ports() {
        let d = parse_frame(&icmp(SRC, DST), LinkMode::Ethernet).unwrap();
        assert_eq!(d.proto, PROTO_ICMP);
        assert_eq!((d.src_port, d.dst_port), (0, 0));
    }

    #[test]
    fn truncated_l4_defaults_ports_to_zero() {
        let mut f = tcp(SRC, DST, 1, 2, 0);
        f.truncate(14 + 20 + 3);
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!((d.src_port, d.dst_port, d.tcp_flags), (0, 0, 0));
    }

    #[test]
    fn rejects_short_buffer() {
        let f = tcp(SRC, DST, 1, 2, 0);
        for len in 0..34 {
            assert!(matches!(
                parse_frame(&f[..len], LinkMode::Ethernet),
                Err(ParseError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn rejects_non_ipv4_ether_type() {
        let mut f = tcp(SRC, DST, 1, 2, 0);
        f[12] = 0x86;
        f[13] = 0xDD;
        assert_eq!(
            parse_frame(&f, LinkMode::Ethernet),
            Err(ParseError::NotIpv4 { ether_type: 0x86DD })
        );
    }

    #[test]
    fn rejects_small_ihl() {
        let mut f = tcp(SRC, DST, 1, 2, 0);
        f[14] = 0x44;
        assert_eq!(
            parse_frame(&f, LinkMode::Ethernet),
            Err(ParseError::BadHeaderLength { ihl: 4 })
        );
    }

    #[test]
    fn rejects_ihl_past_buffer() {
        let mut f = ipv4(SRC, DST, 6, &[]);
        f[14] = 0x4F; // 60-byte header, only 20 present
        assert!(matches!(
            parse_frame(&f, LinkMode::Ethernet),
            Err(ParseError::Truncated { .. })
        ));
    }

    #[test]
    fn skips_ip_options() {
        let mut l4 = vec![0u8; 4]; // 4 bytes of options
        l4.extend_from_slice(&[0x13, 0x88, 0x69, 0x87]);
        let mut f = ipv4(SRC, DST, 17, &l4);
        f[14] = 0x46;
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!((d.src_port, d.dst_port), (5000, 27015));
    }

    #[test]
    fn flags_fragments_without_l4() {
        let mut f = udp(SRC, DST, 5000, 27015, &[0xFF; 4]);
        f[14 + 6] = 0x20; // MF
        let d = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert!(d.is_fragment);
        assert_eq!((d.src_port, d.dst_port), (0, 0));
        assert!(d.payload_head.is_none());

        let mut f = udp(SRC, DST, 5000, 27015, &[]);
        f[14 + 7] = 0x10; // offset only
        assert!(parse_frame(&f, LinkMode::Ethernet).unwrap().is_fragment);
    }

    #[test]
    fn dont_fragment_is_not_a_fragment() {
        let mut f = udp(SRC, DST, 5000, 27015, &[]);
        f[14 + 6] = 0x40; // DF
        assert!(!parse_frame(&f, LinkMode::Ethernet).unwrap().is_fragment);
    }

    #[test]
    fn raw_ip_mode_skips_ethernet() {
        let f = udp(SRC, DST, 5000, 27015, &[]);
        let d = parse_frame(&f[14..], LinkMode::RawIp).unwrap();
        assert_eq!(d.src_addr, SRC);
        assert_eq!(d.total_len as usize, f.len() - 14);
    }
}
