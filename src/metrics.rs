use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::decision::RoutingVerdict;

/// 路由决策统计
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 判定统计
    proxy_verdicts: AtomicU64,
    direct_verdicts: AtomicU64,
    undetermined_verdicts: AtomicU64,

    // 地区缓存统计
    region_cache_hits: AtomicU64,
    region_cache_misses: AtomicU64,
    region_lookup_failures: AtomicU64,

    // 反馈统计
    outcome_reports: AtomicU64,
    failed_outcomes: AtomicU64,
    temp_rules_added: AtomicU64,

    // 没有可用上级代理时退回直连的次数
    direct_fallbacks: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                proxy_verdicts: AtomicU64::new(0),
                direct_verdicts: AtomicU64::new(0),
                undetermined_verdicts: AtomicU64::new(0),
                region_cache_hits: AtomicU64::new(0),
                region_cache_misses: AtomicU64::new(0),
                region_lookup_failures: AtomicU64::new(0),
                outcome_reports: AtomicU64::new(0),
                failed_outcomes: AtomicU64::new(0),
                temp_rules_added: AtomicU64::new(0),
                direct_fallbacks: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_verdict(&self, verdict: RoutingVerdict) {
        let counter = match verdict {
            RoutingVerdict::Proxy => &self.inner.proxy_verdicts,
            RoutingVerdict::Direct => &self.inner.direct_verdicts,
            RoutingVerdict::Undetermined => &self.inner.undetermined_verdicts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_region_cache_hits(&self) {
        self.inner.region_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_region_cache_misses(&self) {
        self.inner.region_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_region_lookup_failures(&self) {
        self.inner.region_lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outcome_reports(&self, success: bool) {
        self.inner.outcome_reports.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.failed_outcomes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_temp_rules_added(&self) {
        self.inner.temp_rules_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_fallbacks(&self) {
        self.inner.direct_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            proxy_verdicts: self.inner.proxy_verdicts.load(Ordering::Relaxed),
            direct_verdicts: self.inner.direct_verdicts.load(Ordering::Relaxed),
            undetermined_verdicts: self.inner.undetermined_verdicts.load(Ordering::Relaxed),
            region_cache_hits: self.inner.region_cache_hits.load(Ordering::Relaxed),
            region_cache_misses: self.inner.region_cache_misses.load(Ordering::Relaxed),
            region_lookup_failures: self.inner.region_lookup_failures.load(Ordering::Relaxed),
            outcome_reports: self.inner.outcome_reports.load(Ordering::Relaxed),
            failed_outcomes: self.inner.failed_outcomes.load(Ordering::Relaxed),
            temp_rules_added: self.inner.temp_rules_added.load(Ordering::Relaxed),
            direct_fallbacks: self.inner.direct_fallbacks.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印统计摘要
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 路由统计 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("代理判定: {}", snapshot.proxy_verdicts);
        log::info!("直连判定: {}", snapshot.direct_verdicts);
        log::info!("未决判定: {}", snapshot.undetermined_verdicts);
        log::info!("地区缓存命中: {}", snapshot.region_cache_hits);
        log::info!("地区缓存未命中: {}", snapshot.region_cache_misses);

        let lookups = snapshot.region_cache_hits + snapshot.region_cache_misses;
        if lookups > 0 {
            let hit_rate = snapshot.region_cache_hits as f64 / lookups as f64 * 100.0;
            log::info!("地区缓存命中率: {:.2}%", hit_rate);
        }

        log::info!("国家代码查询失败: {}", snapshot.region_lookup_failures);
        log::info!("结果反馈: {} (失败 {})", snapshot.outcome_reports, snapshot.failed_outcomes);
        log::info!("新增临时规则: {}", snapshot.temp_rules_added);
        log::info!("退回直连: {}", snapshot.direct_fallbacks);
    }
}

/// 统计快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub proxy_verdicts: u64,
    pub direct_verdicts: u64,
    pub undetermined_verdicts: u64,
    pub region_cache_hits: u64,
    pub region_cache_misses: u64,
    pub region_lookup_failures: u64,
    pub outcome_reports: u64,
    pub failed_outcomes: u64,
    pub temp_rules_added: u64,
    pub direct_fallbacks: u64,
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_verdicts() {
        let metrics = Metrics::new();
        metrics.record_verdict(RoutingVerdict::Proxy);
        metrics.record_verdict(RoutingVerdict::Proxy);
        metrics.record_verdict(RoutingVerdict::Direct);
        metrics.record_verdict(RoutingVerdict::Undetermined);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.proxy_verdicts, 2);
        assert_eq!(snapshot.direct_verdicts, 1);
        assert_eq!(snapshot.undetermined_verdicts, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.inc_outcome_reports(false);
        clone.inc_outcome_reports(true);
        clone.inc_temp_rules_added();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.outcome_reports, 2);
        assert_eq!(snapshot.failed_outcomes, 1);
        assert_eq!(snapshot.temp_rules_added, 1);
    }
}
