use crate::error::ParseError;
use crate::parsing::{bytes_at, u16_at, u32_at};

pub const ETH_P_IP: u16 = 0x0800;

/// Fragment flags/offset mask: MF bit plus 13-bit offset
pub const IP_MF: u16 = 0x2000;
pub const IP_OFFSET: u16 = 0x1FFF;

pub struct EthHdr {
    pub dst_addr: [u8; 6],
    pub src_addr: [u8; 6],
    pub ether_type: u16,
}

impl EthHdr {
    pub const LEN: usize = 14;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            dst_addr: bytes_at(data, 0)?,
            src_addr: bytes_at(data, 6)?,
            ether_type: u16_at(data, 12)?,
        })
    }
}

/// IPv4 header with multi-byte fields already in host byte order
pub struct Ipv4Hdr {
    pub version_ihl: u8,
    pub tos: u8,
    pub tot_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub check: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl Ipv4Hdr {
    pub const MIN_LEN: usize = 20;
    /// Minimum legal IHL in 32-bit words
    pub const MIN_IHL: u8 = 5;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let [version_ihl, tos] = bytes_at::<2>(data, offset)?;
        let [ttl, proto] = bytes_at::<2>(data, offset + 8)?;
        Ok(Self {
            version_ihl,
            tos,
            tot_len: u16_at(data, offset + 2)?,
            id: u16_at(data, offset + 4)?,
            frag_off: u16_at(data, offset + 6)?,
            ttl,
            proto,
            check: u16_at(data, offset + 10)?,
            src_addr: u32_at(data, offset + 12)?,
            dst_addr: u32_at(data, offset + 16)?,
        })
    }

    pub fn ihl(&self) -> u8 {
        self.version_ihl & 0x0F
    }

    pub fn header_len(&self) -> usize {
        self.ihl() as usize * 4
    }

    /// MF set or non-zero offset
    pub fn is_fragment(&self) -> bool {
        self.frag_off & (IP_MF | IP_OFFSET) != 0
    }
}

pub struct UdpHdr;

impl UdpHdr {
    pub const LEN: usize = 8;
}

pub struct TcpHdr;

impl TcpHdr {
    /// Offset of the flags byte within the TCP header
    pub const FLAGS_OFFSET: usize = 13;
}
