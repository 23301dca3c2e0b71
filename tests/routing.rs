use gfw_router::parent::DIRECT;
use gfw_router::region::{REGION_CACHE_CAPACITY, REGION_CACHE_TTL};
use gfw_router::{
    Command, CountryTable, DecisionLevel, Metrics, ParentList, ParentProxy, RegionCache,
    RegionClassifier, Request, Router, RouterConfig, RoutingVerdict, RuleSet,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CONFIG: &str = r#"{
    "decision_level": 1,
    "max_retry": 4,
    "region": ["CN"],
    "parents": [
        {"name": "hk", "url": "socks5://10.0.0.2:1080", "priority": 10, "country": "HK"},
        {"name": "us", "url": "ss://10.0.0.3:8388", "priority": 20, "country": "US"}
    ],
    "geoip": ["1.0.1.0/24 CN", "8.8.8.0/24 US", "112.118.0.0/16 HK"]
}"#;

fn config() -> RouterConfig {
    RouterConfig::from_json(CONFIG).unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn names(router_result: &[gfw_router::ParentHandle]) -> Vec<String> {
    router_result.iter().map(|p| p.name().to_string()).collect()
}

#[test]
fn test_scenario_home_region_direct() {
    let router = Router::builder(config()).build();
    let get = Command::parse("GET");

    let (verdict, parents) = router.route(&Request {
        command: get,
        uri: "http://www.baidu.com/",
        host: "www.baidu.com",
        port: 80,
        ip: ip("1.0.1.8"),
    });

    assert_eq!(verdict, RoutingVerdict::Direct);
    assert_eq!(names(&parents), vec![DIRECT]);
}

#[test]
fn test_scenario_encrypt_all_plain_http() {
    let router = Router::builder(config().with_decision_level(DecisionLevel::EncryptAll)).build();

    // 无论是否在黑名单中都走代理
    for blocked in [false, true] {
        if blocked {
            router.add_rule("||plain.com", false);
        }
        let verdict = router.classify("http://plain.com/index.html", "plain.com", 80, ip("8.8.8.8"));
        assert_eq!(verdict, RoutingVerdict::Proxy);
    }
}

#[test]
fn test_scenario_learned_temp_rule() {
    let list = Arc::new(
        ParentList::new().with_parent(ParentProxy::new("hk", "socks5://10.0.0.2:1080", 10.0)),
    );
    list.proxy(DIRECT)
        .unwrap()
        .record_response_time("example.com", Duration::from_secs(2));
    let router = Router::builder(config()).catalogue(list).build();

    let added = router.report_outcome(
        &Command::Connect,
        "example.com:443",
        ("example.com", 443),
        true,
        &["direct"],
        Some("hk"),
        Duration::from_millis(1500),
    );

    assert_eq!(added.as_deref(), Some("|https://example.com"));
    assert!(router.local_rules().contains("|https://example.com"));

    // 有效期约 5.66 分钟
    let now = Instant::now();
    let local = router.local_rules();
    assert_eq!(local.matches_at("example.com:443", "example.com", now), Some(true));
    assert_eq!(
        local.matches_at("example.com:443", "example.com", now + Duration::from_secs(5 * 60)),
        Some(true)
    );
    assert_eq!(
        local.matches_at("example.com:443", "example.com", now + Duration::from_secs(6 * 60)),
        None
    );
}

struct CountingClassifier {
    calls: AtomicUsize,
}

impl RegionClassifier for CountingClassifier {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some("CN".to_string())
    }
}

#[test]
fn test_scenario_region_cache_ttl_and_lru() {
    let classifier = Arc::new(CountingClassifier {
        calls: AtomicUsize::new(0),
    });
    let cache = RegionCache::new(classifier.clone(), Arc::new(config()), Metrics::new());
    let addr = ip("1.0.1.1");
    let start = Instant::now();

    assert!(cache.is_host_in_region_at("first.cn", addr, start));
    assert!(cache.is_host_in_region_at("first.cn", addr, start + Duration::from_secs(119)));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

    // 过期后重新查询
    let later = start + REGION_CACHE_TTL + Duration::from_secs(1);
    assert!(cache.is_host_in_region_at("first.cn", addr, later));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);

    // 超出容量，最久未使用的 first.cn 被淘汰
    for i in 0..REGION_CACHE_CAPACITY {
        cache.is_host_in_region_at(&format!("host{}.cn", i), addr, later);
    }
    assert_eq!(cache.len(), REGION_CACHE_CAPACITY);
    let calls = classifier.calls.load(Ordering::SeqCst);

    assert!(cache.is_host_in_region_at("host1.cn", addr, later));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), calls);
    assert!(cache.is_host_in_region_at("first.cn", addr, later));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), calls + 1);
}

#[test]
fn test_level_zero_ignores_everything() {
    let router = Router::builder(config().with_decision_level(DecisionLevel::Direct)).build();
    router.add_rule("||blocked.com", true);

    for addr in ["0.0.0.0", "8.8.8.8", "192.168.0.1"] {
        let (verdict, parents) = router.route(&Request {
            command: Command::Connect,
            uri: "blocked.com:443",
            host: "blocked.com",
            port: 443,
            ip: ip(addr),
        });
        assert_eq!(verdict, RoutingVerdict::Direct);
        assert_eq!(names(&parents), vec![DIRECT]);
    }
}

#[test]
fn test_private_destination_uses_local_parent() {
    let config = RouterConfig::from_json(
        r#"{
            "parents": [{"name": "hk", "url": "socks5://10.0.0.2:1080"}],
            "local_parent": {"name": "office", "url": "http://192.168.1.1:3128"}
        }"#,
    )
    .unwrap();
    let router = Router::builder(config).build();

    let (verdict, parents) = router.route(&Request {
        command: Command::parse("GET"),
        uri: "http://nas.lan/",
        host: "nas.lan",
        port: 80,
        ip: ip("192.168.1.20"),
    });
    assert_eq!(verdict, RoutingVerdict::Direct);
    assert_eq!(names(&parents), vec!["local"]);

    // 回环和文档网段同样算私有地址
    for addr in ["127.0.0.1", "::1", "203.0.113.9"] {
        let (verdict, parents) = router.route(&Request {
            command: Command::parse("GET"),
            uri: "http://localhost/",
            host: "localhost",
            port: 80,
            ip: ip(addr),
        });
        assert_eq!(verdict, RoutingVerdict::Direct);
        assert_eq!(names(&parents), vec!["local"], "addr {}", addr);
    }
}

#[test]
fn test_blocklist_base64_and_priority_order() {
    let router = Router::builder(config()).build();
    // "[AutoProxy 0.2.9]\n||blocked.com\n"
    let encoded = "W0F1dG9Qcm94eSAwLjIuOV0KfHxibG9ja2VkLmNvbQo=";
    assert_eq!(router.load_blocklist(encoded), 1);

    let mut rng = StdRng::seed_from_u64(1);
    let verdict = router.classify("blocked.com:443", "blocked.com", 443, ip("112.118.1.9"));
    assert_eq!(verdict, RoutingVerdict::Proxy);

    let parents = router.select_parents_with_rng(
        verdict,
        "blocked.com:443",
        "blocked.com",
        443,
        ip("112.118.1.9"),
        &Command::Connect,
        &mut rng,
    );
    // [hk us hk us]，hk 优先级更高且与目标同国
    assert_eq!(names(&parents), vec!["hk", "hk", "us", "us"]);
}

#[test]
fn test_undetermined_tries_direct_first() {
    let router = Router::builder(config()).build();

    for _ in 0..16 {
        let (verdict, parents) = router.route(&Request {
            command: Command::Connect,
            uri: "unknown.org:443",
            host: "unknown.org",
            port: 443,
            ip: ip("8.8.4.4"),
        });
        assert_eq!(verdict, RoutingVerdict::Undetermined);
        assert_eq!(parents[0].name(), DIRECT);
        assert!(parents.len() <= 4);
        assert!(parents[1..].iter().all(|p| p.name() != DIRECT));
    }
}

#[test]
fn test_concurrent_routing_and_feedback() {
    let router = Arc::new(Router::builder(config()).build());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let router = router.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let host = format!("site{}.com", i % 10);
                    let uri = format!("{}:443", host);
                    router.route(&Request {
                        command: Command::Connect,
                        uri: &uri,
                        host: &host,
                        port: 443,
                        ip: ip("8.8.8.8"),
                    });
                    if (t + i) % 3 == 0 {
                        router.report_outcome(
                            &Command::Connect,
                            &uri,
                            (&host, 443),
                            true,
                            &[DIRECT],
                            Some("hk"),
                            Duration::from_millis(200),
                        );
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // 每个主机只会有一条规则
    assert_eq!(router.local_rules().len(), 10);
    let snapshot = router.metrics().snapshot();
    assert_eq!(snapshot.temp_rules_added, 10);
    assert_eq!(
        snapshot.proxy_verdicts + snapshot.direct_verdicts + snapshot.undetermined_verdicts,
        400
    );
}

#[test]
fn test_custom_classifier_and_catalogue() {
    let table = CountryTable::from_lines(["8.8.8.0/24 JP"]);
    let router = Router::builder(config().with_home_region(["JP"]))
        .classifier(Arc::new(table))
        .catalogue(Arc::new(ParentList::new()))
        .build();

    assert!(router.is_host_in_region("dns.google", ip("8.8.8.8")));
    assert!(!router.is_host_in_region("www.baidu.com", ip("1.0.1.1")));

    let (verdict, parents) = router.route(&Request {
        command: Command::Connect,
        uri: "unknown.org:443",
        host: "unknown.org",
        port: 443,
        ip: ip("0.0.0.0"),
    });
    assert_eq!(verdict, RoutingVerdict::Proxy);
    assert_eq!(names(&parents), vec![DIRECT]);
    assert_eq!(router.metrics().snapshot().direct_fallbacks, 1);
}
