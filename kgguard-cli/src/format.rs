use kgguard_common::{block_reason_str, reason_str, PROTO_TCP};
use kgguard_xdp::{BlockedIpInfo, PacketDescriptor, Verdict, XdpAction};

use crate::config::proto_to_str;

/// Format TCP flags byte into human-readable string
pub fn format_tcp_flags(flags: u8) -> String {
    let mut result = String::new();
    if flags & 0x01 != 0 { result.push_str("FIN "); }
    if flags & 0x02 != 0 { result.push_str("SYN "); }
    if flags & 0x04 != 0 { result.push_str("RST "); }
    if flags & 0x08 != 0 { result.push_str("PSH "); }
    if flags & 0x10 != 0 { result.push_str("ACK "); }
    if flags & 0x20 != 0 { result.push_str("URG "); }
    if result.is_empty() {
        format!("0x{:02x}", flags)
    } else {
        result.trim().to_string()
    }
}

pub fn describe_packet(pkt: &PacketDescriptor) -> String {
    let mut out = format!(
        "{}:{} -> {}:{} {} len={}",
        pkt.src_addr,
        pkt.src_port,
        pkt.dst_addr,
        pkt.dst_port,
        proto_to_str(pkt.proto),
        pkt.total_len
    );
    if pkt.proto == PROTO_TCP {
        out.push_str(&format!(" [{}]", format_tcp_flags(pkt.tcp_flags)));
    }
    if pkt.is_fragment {
        out.push_str(" frag");
    }
    out
}

pub fn describe_verdict(v: &Verdict) -> String {
    match v.action {
        XdpAction::Pass => format!("✅ PASS ({})", reason_str(v.reason)),
        XdpAction::Drop => format!("❌ DROP ({})", reason_str(v.reason)),
    }
}

pub fn describe_block(info: &BlockedIpInfo) -> String {
    let ttl = match info.ttl_secs {
        -1 => "permanent".to_string(),
        0 => "expired".to_string(),
        s => format!("{}s left", s),
    };
    format!("{} [{}] {}", info.network, block_reason_str(info.reason), ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgguard_common::{BLOCK_REASON_FLOOD, REASON_GEOIP};
    use kgguard_xdp::{parse_frame, LinkMode};

    #[test]
    fn tcp_flags() {
        assert_eq!(format_tcp_flags(0x12), "SYN ACK");
        assert_eq!(format_tcp_flags(0x04), "RST");
        assert_eq!(format_tcp_flags(0xC0), "0xc0");
    }

    #[test]
    fn packet_line() {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&[0x08, 0x00, 0x45, 0x00, 0x00, 40, 0, 1, 0, 0, 64, 6, 0, 0]);
        f.extend_from_slice(&[45, 1, 2, 3, 203, 0, 113, 5]);
        f.extend_from_slice(&[0x9c, 0x40, 0x69, 0x87, 0, 0, 0, 0, 0, 0, 0, 0, 0x50, 0x02, 0, 0, 0, 0, 0, 0]);
        let pkt = parse_frame(&f, LinkMode::Ethernet).unwrap();
        assert_eq!(describe_packet(&pkt), "45.1.2.3:40000 -> 203.0.113.5:27015 tcp len=54 [SYN]");
    }

    #[test]
    fn verdict_and_block_lines() {
        assert_eq!(describe_verdict(&Verdict::drop(REASON_GEOIP)), "❌ DROP (GEOIP)");
        let info = BlockedIpInfo {
            network: "192.0.2.0/24".parse().unwrap(),
            reason: BLOCK_REASON_FLOOD,
            expires_at: 0,
            ttl_secs: -1,
        };
        assert_eq!(describe_block(&info), "192.0.2.0/24 [flood] permanent");
    }
}
