use lazy_static::lazy_static;
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP 地址到国家代码的映射
///
/// 实现必须是快速的本地查询，失败时返回 `None`，不能 panic。
pub trait RegionClassifier: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// IPv4 网段
#[derive(Debug, Clone, Copy)]
struct Ipv4Network {
    network: u32,
    mask: u32,
}

impl Ipv4Network {
    fn parse(ip: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };
        Some(Self {
            network: u32::from(ip) & mask,
            mask,
        })
    }

    #[inline]
    fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask) == self.network
    }
}

/// IPv6 网段
#[derive(Debug, Clone, Copy)]
struct Ipv6Network {
    network: u128,
    mask: u128,
}

impl Ipv6Network {
    fn parse(ip: Ipv6Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 128 {
            return None;
        }
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u128 << (128 - prefix_len)
        };
        Some(Self {
            network: u128::from(ip) & mask,
            mask,
        })
    }

    #[inline]
    fn contains(&self, ip: Ipv6Addr) -> bool {
        (u128::from(ip) & self.mask) == self.network
    }
}

#[derive(Debug, Clone, Copy)]
enum Network {
    V4(Ipv4Network),
    V6(Ipv6Network),
}

impl Network {
    /// 解析 `a.b.c.d/n`、`x::/n` 或单个地址
    fn parse(cidr: &str) -> Option<Self> {
        let (ip_str, prefix) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.trim(), Some(prefix.trim().parse::<u8>().ok()?)),
            None => (cidr.trim(), None),
        };

        match ip_str.parse::<IpAddr>().ok()? {
            IpAddr::V4(ip) => Ipv4Network::parse(ip, prefix.unwrap_or(32)).map(Network::V4),
            IpAddr::V6(ip) => Ipv6Network::parse(ip, prefix.unwrap_or(128)).map(Network::V6),
        }
    }

    #[inline]
    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Network::V4(net), IpAddr::V4(ip)) => net.contains(ip),
            (Network::V6(net), IpAddr::V6(ip)) => net.contains(ip),
            _ => false,
        }
    }
}

lazy_static! {
    /// 私有 / 保留网段，含回环和文档地址
    static ref PRIVATE_NETWORKS: Vec<Network> = [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/29",
        "192.0.0.170/31",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "255.255.255.255/32",
        "::/128",
        "::1/128",
        "100::/64",
        "2001::/23",
        "2001:2::/48",
        "2001:db8::/32",
        "2001:10::/28",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|cidr| Network::parse(cidr))
    .collect();
}

/// IPv4 映射的 IPv6 地址按 IPv4 处理
#[inline]
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// 地址未解析（全零哨兵）
#[inline]
pub fn is_unresolved(ip: IpAddr) -> bool {
    canonical(ip).is_unspecified()
}

#[inline]
pub fn is_loopback(ip: IpAddr) -> bool {
    canonical(ip).is_loopback()
}

/// 私有或保留地址（回环地址也算私有）
pub fn is_private(ip: IpAddr) -> bool {
    let ip = canonical(ip);
    PRIVATE_NETWORKS.iter().any(|net| net.contains(ip))
}

/// 基于 CIDR 表的国家代码查询
///
/// 按添加顺序匹配，第一个命中的网段生效。
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    entries: Vec<(Network, String)>,
}

impl CountryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 `CIDR 国家代码` 格式的行构建，无效行会被忽略
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(cidr), Some(code)) => {
                    if !table.add(cidr, code) {
                        warn!("无效的 GeoIP 网段: {}", line);
                    }
                }
                _ => warn!("无效的 GeoIP 条目: {}", line),
            }
        }
        info!("GeoIP 表加载完成: {} 个网段", table.len());
        table
    }

    /// 添加一个网段，返回是否有效
    pub fn add(&mut self, cidr: &str, code: &str) -> bool {
        match Network::parse(cidr) {
            Some(net) if !code.is_empty() => {
                self.entries.push((net, code.to_uppercase()));
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegionClassifier for CountryTable {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        let ip = canonical(ip);
        self.entries
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, code)| code.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_unresolved() {
        assert!(is_unresolved(ip("0.0.0.0")));
        assert!(is_unresolved(ip("::")));
        assert!(is_unresolved(ip("::ffff:0.0.0.0")));
        assert!(!is_unresolved(ip("1.1.1.1")));
    }

    #[test]
    fn test_loopback() {
        assert!(is_loopback(ip("127.0.0.1")));
        assert!(is_loopback(ip("127.255.255.254")));
        assert!(is_loopback(ip("::1")));
        assert!(is_loopback(ip("::ffff:127.0.0.1")));
        assert!(!is_loopback(ip("10.0.0.1")));
    }

    #[test]
    fn test_private_networks() {
        assert!(is_private(ip("10.1.2.3")));
        assert!(is_private(ip("172.16.0.1")));
        assert!(is_private(ip("172.31.255.255")));
        assert!(!is_private(ip("172.32.0.1")));
        assert!(is_private(ip("192.168.1.1")));
        assert!(is_private(ip("169.254.10.1")));
        assert!(is_private(ip("fd00::1")));
        assert!(is_private(ip("fe80::1")));
        assert!(is_private(ip("::ffff:192.168.0.1")));

        assert!(!is_private(ip("8.8.8.8")));
        assert!(!is_private(ip("2400:cb00::1")));
    }

    #[test]
    fn test_reserved_and_loopback_are_private() {
        // 文档网段
        assert!(is_private(ip("192.0.2.1")));
        assert!(is_private(ip("198.51.100.1")));
        assert!(is_private(ip("203.0.113.9")));
        assert!(is_private(ip("2001:db8::1")));
        assert!(is_private(ip("2001:0:1::1")));
        assert!(is_private(ip("255.255.255.255")));

        // 回环地址
        assert!(is_private(ip("127.0.0.1")));
        assert!(is_private(ip("::1")));

        // 运营商级 NAT 不算私有
        assert!(!is_private(ip("100.64.0.1")));
        assert!(!is_private(ip("192.0.0.8")));
    }

    #[test]
    fn test_country_table_lookup() {
        let table = CountryTable::from_lines([
            "1.0.1.0/24 cn",
            "8.8.8.0/24 US",
            "2001:250::/32 CN",
            "203.0.113.7 JP",
        ]);

        assert_eq!(table.len(), 4);
        assert_eq!(table.country_code(ip("1.0.1.200")), Some("CN".to_string()));
        assert_eq!(table.country_code(ip("8.8.8.8")), Some("US".to_string()));
        assert_eq!(table.country_code(ip("::ffff:8.8.8.8")), Some("US".to_string()));
        assert_eq!(table.country_code(ip("2001:250:1::1")), Some("CN".to_string()));
        assert_eq!(table.country_code(ip("203.0.113.7")), Some("JP".to_string()));
        assert_eq!(table.country_code(ip("203.0.113.8")), None);
        assert_eq!(table.country_code(ip("9.9.9.9")), None);
    }

    #[test]
    fn test_country_table_first_match_wins() {
        let table = CountryTable::from_lines(["10.0.0.0/16 HK", "10.0.0.0/8 CN"]);

        assert_eq!(table.country_code(ip("10.0.1.1")), Some("HK".to_string()));
        assert_eq!(table.country_code(ip("10.1.0.1")), Some("CN".to_string()));
    }

    #[test]
    fn test_country_table_invalid_lines() {
        // 无效的条目被忽略，不会 panic
        let table = CountryTable::from_lines([
            "invalid CN",
            "192.168.1.0/33 CN",
            "2001:db8::/129 CN",
            "1.2.3.0/24",
            "",
            "# comment",
        ]);

        assert!(table.is_empty());
    }
}
