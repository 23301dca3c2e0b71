use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::RouterConfig;
use crate::decision::RoutingVerdict;
use crate::geoip::{self, RegionClassifier};
use crate::metrics::Metrics;
use crate::parent::{Command, ParentCatalogue, ParentHandle, DIRECT};

/// 无法获取目标国家时使用的位置
pub const UNKNOWN_LOCATION: &str = "unknown";

/// 上级代理候选选择器
///
/// 根据判定结果生成有序的重试列表，实际连接由传输层按顺序尝试。
pub struct ParentSelector {
    config: Arc<RouterConfig>,
    catalogue: Arc<dyn ParentCatalogue>,
    classifier: Arc<dyn RegionClassifier>,
    metrics: Metrics,
}

impl ParentSelector {
    pub fn new(
        config: Arc<RouterConfig>,
        catalogue: Arc<dyn ParentCatalogue>,
        classifier: Arc<dyn RegionClassifier>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            catalogue,
            classifier,
            metrics,
        }
    }

    pub fn select_parents(
        &self,
        verdict: RoutingVerdict,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        command: &Command,
    ) -> Vec<ParentHandle> {
        self.select_parents_with_rng(verdict, uri, host, port, ip, command, &mut rand::thread_rng())
    }

    /// 与 `select_parents` 相同，使用指定的随机数生成器打乱同优先级候选
    #[allow(clippy::too_many_arguments)]
    pub fn select_parents_with_rng<R: Rng + ?Sized>(
        &self,
        verdict: RoutingVerdict,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        command: &Command,
        rng: &mut R,
    ) -> Vec<ParentHandle> {
        let direct = self.catalogue.direct();

        if verdict == RoutingVerdict::Direct {
            if geoip::is_private(ip) {
                if let Some(local) = self.catalogue.local() {
                    return vec![local];
                }
            }
            return vec![direct];
        }

        let max_retry = self.config.max_retry.max(1);
        let base: Vec<ParentHandle> = if command.is_connect() {
            self.catalogue.https_parents()
        } else {
            self.catalogue.http_parents()
        }
        .into_iter()
        .filter(|p| !p.name().contains(DIRECT))
        .collect();

        let mut parents = base.clone();
        if parents.len() < max_retry {
            // 未决时第一个重试位留给直连
            let skip = if verdict == RoutingVerdict::Undetermined { 1 } else { 0 };
            parents.extend(base.iter().skip(skip).cloned());
            parents.truncate(max_retry);
        }

        let location = self
            .classifier
            .country_code(ip)
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());

        if parents.len() > 1 {
            // 先随机打乱再稳定排序：同优先级的候选顺序随机，不同优先级严格有序
            parents.shuffle(rng);
            let mut scored: Vec<(f64, ParentHandle)> = parents
                .into_iter()
                .map(|p| (p.priority(command, host, &location), p))
                .collect();
            scored.sort_by(|a, b| a.0.total_cmp(&b.0));
            parents = scored.into_iter().map(|(_, p)| p).collect();
        }

        match verdict {
            RoutingVerdict::Proxy if parents.is_empty() => {
                warn!("没有可用的上级代理，使用直连: {}", uri);
                self.metrics.inc_direct_fallbacks();
                return vec![direct];
            }
            RoutingVerdict::Undetermined => parents.insert(0, direct),
            _ => {}
        }

        if parents.len() == 1 && parents[0].name() == DIRECT {
            return parents;
        }

        parents.truncate(max_retry);
        debug!(
            "{} {} ({}:{}) 候选: {:?}",
            command,
            uri,
            host,
            port,
            parents.iter().map(|p| p.name()).collect::<Vec<_>>()
        );
        parents
    }
}
