use log::debug;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{DecisionLevel, RouterConfig};
use crate::geoip;
use crate::region::RegionCache;
use crate::rules::RuleSet;

/// 路由判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingVerdict {
    /// 必须经由上级代理
    Proxy,
    /// 必须直连
    Direct,
    /// 未决：先尝试直连，失败后按优先级尝试上级代理
    Undetermined,
}

impl RoutingVerdict {
    #[inline]
    pub fn is_proxy(self) -> bool {
        self == RoutingVerdict::Proxy
    }

    fn from_rule_match(matched: bool) -> Self {
        if matched {
            RoutingVerdict::Proxy
        } else {
            RoutingVerdict::Direct
        }
    }
}

impl fmt::Display for RoutingVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingVerdict::Proxy => "proxy",
            RoutingVerdict::Direct => "direct",
            RoutingVerdict::Undetermined => "undetermined",
        };
        f.write_str(s)
    }
}

/// 手动覆盖的主机表（由外部重定向表维护）
pub trait HostOverrides: Send + Sync {
    fn contains(&self, host: &str) -> bool;
}

impl HostOverrides for HashSet<String> {
    fn contains(&self, host: &str) -> bool {
        HashSet::contains(self, host)
    }
}

/// GFW 判定阶梯
///
/// 自上而下逐级判断，第一个命中的条件决定结果，不会继续往下。
/// 只读取规则集和地区缓存，不修改规则集。
pub struct GfwPolicy {
    config: Arc<RouterConfig>,
    local: Arc<dyn RuleSet>,
    ignore: Arc<dyn RuleSet>,
    blocklist: Arc<dyn RuleSet>,
    region: Arc<RegionCache>,
    hosts: Arc<dyn HostOverrides>,
}

impl GfwPolicy {
    pub fn new(
        config: Arc<RouterConfig>,
        local: Arc<dyn RuleSet>,
        ignore: Arc<dyn RuleSet>,
        blocklist: Arc<dyn RuleSet>,
        region: Arc<RegionCache>,
        hosts: Arc<dyn HostOverrides>,
    ) -> Self {
        Self {
            config,
            local,
            ignore,
            blocklist,
            region,
            hosts,
        }
    }

    /// 判定请求的路由方式
    ///
    /// * `uri`  - `http://host/path`，CONNECT 请求为 `host:port`
    /// * `host` - 不含端口的主机名
    /// * `ip`   - 解析得到的地址，解析失败时传入全零地址
    pub fn classify(
        &self,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        level: DecisionLevel,
    ) -> RoutingVerdict {
        let (verdict, reason) = self.evaluate(uri, host, ip, level);
        debug!(
            "判定 {} ({}:{}, {}, level {}): {} [{}]",
            uri, host, port, ip, level, verdict, reason
        );
        verdict
    }

    fn evaluate(
        &self,
        uri: &str,
        host: &str,
        ip: IpAddr,
        level: DecisionLevel,
    ) -> (RoutingVerdict, &'static str) {
        use RoutingVerdict::*;

        if level == DecisionLevel::Direct {
            return (Direct, "level 0");
        }
        if self.config.reverse_proxy {
            return (Undetermined, "反向代理模式");
        }
        if geoip::is_unresolved(ip) {
            return (Proxy, "地址未解析");
        }
        if geoip::is_loopback(ip) {
            return (Direct, "回环地址");
        }
        if level == DecisionLevel::GlobalAll {
            return (Proxy, "level 5");
        }
        if geoip::is_private(ip) {
            return (Direct, "私有地址");
        }
        if level == DecisionLevel::Global {
            return (Proxy, "level 4");
        }
        if let Some(matched) = self.local.matches(uri, host) {
            return (RoutingVerdict::from_rule_match(matched), "本地规则");
        }
        if self.ignore.matches(uri, host) == Some(true) {
            return (Undetermined, "忽略规则");
        }
        if self.region.is_host_in_region(host, ip) {
            return (Direct, "地区内地址");
        }
        if level == DecisionLevel::EncryptAll && is_plain_http(uri) {
            return (Proxy, "level 2 明文请求");
        }
        if self.hosts.contains(host) {
            return (Undetermined, "手动覆盖主机");
        }
        if level == DecisionLevel::Chnroute {
            return (Proxy, "level 3");
        }
        if self.config.blocklist_enabled && self.blocklist.matches(uri, host) == Some(true) {
            return (Proxy, "黑名单");
        }
        (Undetermined, "无匹配")
    }
}

#[inline]
fn is_plain_http(uri: &str) -> bool {
    uri.get(..7)
        .map_or(false, |scheme| scheme.eq_ignore_ascii_case("http://"))
}
