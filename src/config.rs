use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::{DrainError, Result};

/// 内核 hold 队列的容量上限
pub const MAX_PACKETS_IN_QUEUE: u32 = 65536;

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub addresses: Vec<IpAddr>,
    pub queue_num: u16,
    pub max_queue_len: u32,
    pub iptables: PathBuf,
    /// 防火墙命令失败后的重试次数，0 表示直接 fail-fast
    pub rule_retries: u32,
}

impl DrainConfig {
    pub fn new(addresses: Vec<IpAddr>, queue_num: u16) -> Self {
        Self {
            addresses,
            queue_num,
            max_queue_len: MAX_PACKETS_IN_QUEUE,
            iptables: PathBuf::from("iptables"),
            rule_retries: 0,
        }
    }
}

/// Parses a comma separated address list. An empty string yields no addresses.
pub fn parse_addresses(arg: &str) -> Result<Vec<IpAddr>> {
    if arg.is_empty() {
        return Ok(Vec::new());
    }
    arg.split(',')
        .map(|s| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|_| DrainError::InvalidAddress(s.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_list_is_no_addresses() {
        assert!(parse_addresses("").unwrap().is_empty());
    }

    #[test]
    fn parses_mixed_families() {
        let ips = parse_addresses("10.0.0.1, 10.0.0.2,::1").unwrap();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(ips[2].is_ipv6());
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_addresses("10.0.0.1,nope").unwrap_err();
        assert!(matches!(err, DrainError::InvalidAddress(ref s) if s == "nope"));
    }

    #[test]
    fn defaults() {
        let cfg = DrainConfig::new(Vec::new(), 7);
        assert_eq!(cfg.max_queue_len, 65536);
        assert_eq!(cfg.rule_retries, 0);
        assert_eq!(cfg.iptables, PathBuf::from("iptables"));
    }
}
