use log::info;
use lru::LruCache;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::{ParentConfig, RouterConfig};

/// 直连候选的名称
pub const DIRECT: &str = "direct";
/// 目标为私有地址时使用的候选名称
pub const LOCAL: &str = "local";

/// 每个统计窗口保留的样本数
const SAMPLE_WINDOW: usize = 10;
/// 按主机统计的最大主机数
const MAX_TRACKED_HOSTS: usize = 1024;

/// 请求类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// CONNECT 隧道
    Connect,
    /// 普通 HTTP 请求（GET/POST/...）
    Http(String),
}

impl Command {
    pub fn parse(method: &str) -> Self {
        let method = method.trim().to_uppercase();
        if method == "CONNECT" {
            Command::Connect
        } else {
            Command::Http(method)
        }
    }

    #[inline]
    pub fn is_connect(&self) -> bool {
        matches!(self, Command::Connect)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Http(method) => method,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上级代理候选
pub trait Parent: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn supports_http(&self) -> bool;

    fn supports_https(&self) -> bool;

    /// 优先级分数，越小越优先
    fn priority(&self, command: &Command, host: &str, location: &str) -> f64;

    /// 平均响应时间（秒），`host` 为 `None` 时返回总体平均值
    fn avg_resp_time(&self, host: Option<&str>) -> f64;
}

pub type ParentHandle = Arc<dyn Parent>;

/// 上级代理目录
///
/// 必须始终包含 `direct` 候选。
pub trait ParentCatalogue: Send + Sync {
    /// 支持 HTTP 的上级代理（不含 direct）
    fn http_parents(&self) -> Vec<ParentHandle>;

    /// 支持 CONNECT 的上级代理（不含 direct）
    fn https_parents(&self) -> Vec<ParentHandle>;

    fn get(&self, name: &str) -> Option<ParentHandle>;

    fn direct(&self) -> ParentHandle;

    fn local(&self) -> Option<ParentHandle>;
}

/// 滑动窗口平均值
#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<f64>,
}

impl Window {
    fn push(&mut self, value: f64) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

/// 响应时间统计，由传输层写入
#[derive(Debug)]
pub struct ResponseStats {
    inner: Mutex<ResponseStatsInner>,
}

#[derive(Debug)]
struct ResponseStatsInner {
    overall: Window,
    by_host: LruCache<String, Window>,
}

impl Default for ResponseStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseStats {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_HOSTS).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(ResponseStatsInner {
                overall: Window::default(),
                by_host: LruCache::new(capacity),
            }),
        }
    }

    /// 记录一次响应时间
    pub fn record(&self, host: &str, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.overall.push(secs);
        inner
            .by_host
            .get_or_insert_mut(host.to_string(), Window::default)
            .push(secs);
    }

    /// 主机没有样本时退回总体平均值，都没有时为 0
    pub fn average(&self, host: Option<&str>) -> f64 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let overall = inner.overall.average().unwrap_or(0.0);
        match host {
            Some(host) => inner
                .by_host
                .get(host)
                .and_then(Window::average)
                .unwrap_or(overall),
            None => overall,
        }
    }
}

/// 上级代理
#[derive(Debug)]
pub struct ParentProxy {
    name: String,
    url: String,
    base_priority: f64,
    http: bool,
    https: bool,
    /// 代理服务器所在国家
    country: Option<String>,
    stats: ResponseStats,
}

impl ParentProxy {
    pub fn new(name: &str, url: &str, base_priority: f64) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            base_priority,
            http: true,
            https: true,
            country: None,
            stats: ResponseStats::new(),
        }
    }

    /// 直连候选，不出现在 HTTP/HTTPS 代理列表中
    pub fn direct() -> Self {
        Self::new(DIRECT, "", 0.0).with_support(false, false)
    }

    pub fn from_config(config: &ParentConfig) -> Self {
        let mut parent = Self::new(&config.name, &config.url, config.priority)
            .with_support(config.http, config.https);
        parent.country = config.country.as_ref().map(|c| c.to_uppercase());
        parent
    }

    pub fn with_support(mut self, http: bool, https: bool) -> Self {
        self.http = http;
        self.https = https;
        self
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = Some(country.to_uppercase());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 传输层记录响应时间
    pub fn record_response_time(&self, host: &str, elapsed: Duration) {
        self.stats.record(host, elapsed);
    }
}

impl Parent for ParentProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_http(&self) -> bool {
        self.http
    }

    fn supports_https(&self) -> bool {
        self.https
    }

    fn priority(&self, _command: &Command, host: &str, location: &str) -> f64 {
        let mut score = self.base_priority
            + 5.0 * (self.stats.average(None) + self.stats.average(Some(host)));
        // 与目标同一国家的代理优先
        if let Some(country) = &self.country {
            if country.eq_ignore_ascii_case(location) {
                score -= 5.0;
            }
        }
        score
    }

    fn avg_resp_time(&self, host: Option<&str>) -> f64 {
        self.stats.average(host)
    }
}

/// 基于配置的上级代理目录
#[derive(Debug)]
pub struct ParentList {
    parents: Vec<Arc<ParentProxy>>,
    direct: Arc<ParentProxy>,
    local: Option<Arc<ParentProxy>>,
}

impl Default for ParentList {
    fn default() -> Self {
        Self::new()
    }
}

impl ParentList {
    /// 只包含 direct 的目录
    pub fn new() -> Self {
        Self {
            parents: Vec::new(),
            direct: Arc::new(ParentProxy::direct()),
            local: None,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        let mut list = Self::new();
        for parent in &config.parents {
            list = list.with_parent(ParentProxy::from_config(parent));
        }
        if let Some(local) = &config.local_parent {
            let mut local = ParentProxy::from_config(local);
            local.name = LOCAL.to_string();
            list = list.with_local(local);
        }
        info!("上级代理: {} 个, 私有地址代理: {}", list.parents.len(), list.local.is_some());
        list
    }

    pub fn with_parent(mut self, parent: ParentProxy) -> Self {
        self.parents.push(Arc::new(parent));
        self
    }

    pub fn with_local(mut self, local: ParentProxy) -> Self {
        self.local = Some(Arc::new(local));
        self
    }

    /// 按名称获取具体代理，供传输层记录统计
    pub fn proxy(&self, name: &str) -> Option<Arc<ParentProxy>> {
        if name == DIRECT {
            return Some(self.direct.clone());
        }
        if name == LOCAL {
            if let Some(local) = &self.local {
                return Some(local.clone());
            }
        }
        self.parents.iter().find(|p| p.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    fn filtered(&self, pred: impl Fn(&ParentProxy) -> bool) -> Vec<ParentHandle> {
        self.parents
            .iter()
            .filter(|p| !p.name.contains(DIRECT) && pred(p))
            .map(|p| p.clone() as ParentHandle)
            .collect()
    }
}

impl ParentCatalogue for ParentList {
    fn http_parents(&self) -> Vec<ParentHandle> {
        self.filtered(|p| p.http)
    }

    fn https_parents(&self) -> Vec<ParentHandle> {
        self.filtered(|p| p.https)
    }

    fn get(&self, name: &str) -> Option<ParentHandle> {
        self.proxy(name).map(|p| p as ParentHandle)
    }

    fn direct(&self) -> ParentHandle {
        self.direct.clone()
    }

    fn local(&self) -> Option<ParentHandle> {
        self.local.clone().map(|p| p as ParentHandle)
    }
}
