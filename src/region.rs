use log::{debug, info};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RouterConfig;
use crate::geoip::RegionClassifier;
use crate::metrics::Metrics;

/// 默认缓存容量
pub const REGION_CACHE_CAPACITY: usize = 256;
/// 默认缓存有效期
pub const REGION_CACHE_TTL: Duration = Duration::from_secs(120);

/// 主机是否在本地区的缓存
///
/// 以 (host, ip) 为键，LRU 淘汰 + 固定有效期。分类器查询在锁外进行，
/// 并发填充时后写入者覆盖，结果由相同输入确定，因此无害。
pub struct RegionCache {
    cache: Mutex<LruCache<(String, String), (bool, Instant)>>,
    ttl: Duration,
    classifier: Arc<dyn RegionClassifier>,
    config: Arc<RouterConfig>,
    metrics: Metrics,
}

impl RegionCache {
    pub fn new(
        classifier: Arc<dyn RegionClassifier>,
        config: Arc<RouterConfig>,
        metrics: Metrics,
    ) -> Self {
        Self::with_capacity(
            REGION_CACHE_CAPACITY,
            REGION_CACHE_TTL,
            classifier,
            config,
            metrics,
        )
    }

    pub fn with_capacity(
        capacity: usize,
        ttl: Duration,
        classifier: Arc<dyn RegionClassifier>,
        config: Arc<RouterConfig>,
        metrics: Metrics,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            classifier,
            config,
            metrics,
        }
    }

    /// 主机 IP 是否在本地区
    pub fn is_host_in_region(&self, host: &str, ip: IpAddr) -> bool {
        self.is_host_in_region_at(host, ip, Instant::now())
    }

    pub fn is_host_in_region_at(&self, host: &str, ip: IpAddr, now: Instant) -> bool {
        let key = (host.to_string(), ip.to_string());

        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let cached = cache.get(&key).copied();
            match cached {
                Some((in_region, expires_at)) if expires_at > now => {
                    self.metrics.inc_region_cache_hits();
                    return in_region;
                }
                Some(_) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }
        self.metrics.inc_region_cache_misses();

        // 分类失败不缓存，等分类器恢复后重试
        let code = match self.classifier.country_code(ip) {
            Some(code) => code,
            None => {
                debug!("无法获取 {} ({}) 的国家代码", host, ip);
                self.metrics.inc_region_lookup_failures();
                return false;
            }
        };

        let in_region = self.config.in_home_region(&code);
        if in_region {
            info!("{} 位于 {}", host, code);
        }

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, (in_region, now + self.ttl));

        in_region
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!("地区缓存已清除");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用次数的分类器，总是返回固定结果
    struct CountingClassifier {
        calls: AtomicUsize,
        code: Option<&'static str>,
    }

    impl RegionClassifier for CountingClassifier {
        fn country_code(&self, _ip: IpAddr) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.code.map(str::to_string)
        }
    }

    fn cache(code: Option<&'static str>, capacity: usize) -> (RegionCache, Arc<CountingClassifier>) {
        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            code,
        });
        let config = Arc::new(RouterConfig::default().with_home_region(["CN"]));
        let cache = RegionCache::with_capacity(
            capacity,
            REGION_CACHE_TTL,
            classifier.clone(),
            config,
            Metrics::new(),
        );
        (cache, classifier)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let (cache, classifier) = cache(Some("CN"), 256);
        let now = Instant::now();

        assert!(cache.is_host_in_region_at("baidu.com", ip("1.2.3.4"), now));
        assert!(cache.is_host_in_region_at(
            "baidu.com",
            ip("1.2.3.4"),
            now + Duration::from_secs(119)
        ));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_expires() {
        let (cache, classifier) = cache(Some("CN"), 256);
        let now = Instant::now();

        cache.is_host_in_region_at("baidu.com", ip("1.2.3.4"), now);
        cache.is_host_in_region_at("baidu.com", ip("1.2.3.4"), now + Duration::from_secs(121));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_not_in_region_is_cached() {
        let (cache, classifier) = cache(Some("US"), 256);

        assert!(!cache.is_host_in_region("google.com", ip("8.8.8.8")));
        assert!(!cache.is_host_in_region("google.com", ip("8.8.8.8")));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_classifier_failure_not_cached() {
        let (cache, classifier) = cache(None, 256);

        assert!(!cache.is_host_in_region("example.com", ip("9.9.9.9")));
        assert!(!cache.is_host_in_region("example.com", ip("9.9.9.9")));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_includes_host_and_ip() {
        let (cache, classifier) = cache(Some("CN"), 256);

        cache.is_host_in_region("a.com", ip("1.1.1.1"));
        cache.is_host_in_region("b.com", ip("1.1.1.1"));
        cache.is_host_in_region("a.com", ip("1.1.1.2"));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_lru_eviction() {
        let (cache, classifier) = cache(Some("CN"), 2);

        cache.is_host_in_region("a.com", ip("1.1.1.1"));
        cache.is_host_in_region("b.com", ip("1.1.1.2"));
        // 访问 a，使 b 成为最久未使用
        cache.is_host_in_region("a.com", ip("1.1.1.1"));
        cache.is_host_in_region("c.com", ip("1.1.1.3"));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);

        cache.is_host_in_region("a.com", ip("1.1.1.1"));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
        cache.is_host_in_region("b.com", ip("1.1.1.2"));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 4);
    }
}
