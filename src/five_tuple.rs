// five_tuple.rs
use std::fmt;
use std::net::Ipv4Addr;

const TCP_SYN: u8 = 0x02;
const TCP_ACK: u8 = 0x10;

/// 被扣住的连接请求的摘要，只用于日志
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
}

impl FiveTuple {
    /// 纯 SYN：新连接的第一个包
    pub fn is_syn(&self) -> bool {
        self.proto == 6 && self.tcp_flags & (TCP_SYN | TCP_ACK) == TCP_SYN
    }
}

impl From<&[u8]> for FiveTuple {
    fn from(payload: &[u8]) -> Self {
        let mut t = FiveTuple {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            proto: 0,
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
        };

        // IP 头至少 20 字节，且必须是 IPv4
        if payload.len() < 20 || (payload[0] >> 4) != 4 {
            return t;
        }

        let ihl = (payload[0] & 0x0F) as usize * 4;
        if payload.len() < ihl {
            return t;
        }

        t.proto = payload[9];
        t.src = Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]);
        t.dst = Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]);

        if (t.proto == 6 || t.proto == 17) && payload.len() >= ihl + 4 {
            t.src_port = u16::from_be_bytes([payload[ihl], payload[ihl + 1]]);
            t.dst_port = u16::from_be_bytes([payload[ihl + 2], payload[ihl + 3]]);
        }
        // TCP flags 在 TCP 头第 13 字节
        if t.proto == 6 && payload.len() > ihl + 13 {
            t.tcp_flags = payload[ihl + 13];
        }

        t
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} (proto {})",
            self.src, self.src_port, self.dst, self.dst_port, self.proto
        )
    }
}

#[cfg(test)]
pub(crate) fn syn_packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x45;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[32] = 0x50;
    pkt[33] = TCP_SYN;
    pkt
}
