use base64::Engine;
use log::{debug, info, warn};
use regex::{Regex, RegexBuilder};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::error::RuleError;

/// 规则集合（autoproxy 风格）
///
/// 匹配结果为三值：
/// - `Some(true)`  命中代理规则
/// - `Some(false)` 命中例外规则（`@@` 开头）
/// - `None`        未命中
pub trait RuleSet: Send + Sync {
    /// 匹配请求
    fn matches(&self, uri: &str, host: &str) -> Option<bool>;

    /// 添加规则，`ttl` 为 `None` 时永久有效
    fn add(&self, text: &str, ttl: Option<Duration>) -> Result<(), RuleError>;

    /// 是否已存在相同文本且未过期的规则
    fn contains(&self, text: &str) -> bool;

    /// 当前有效规则的文本
    fn rule_texts(&self) -> Vec<String>;

    /// 当前有效规则数量
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 不存在时才添加，返回是否插入
    ///
    /// 默认实现不是原子的，需要原子性的实现应覆盖此方法
    fn add_if_absent(&self, text: &str, ttl: Option<Duration>) -> Result<bool, RuleError> {
        if self.contains(text) {
            return Ok(false);
        }
        self.add(text, ttl).map(|_| true)
    }
}

/// 编译后的匹配模式
#[derive(Debug, Clone)]
enum Pattern {
    /// `||example.com`：域名及其子域名
    Domain(String),
    /// `|https://example.com`：URI 前缀（可含 `*`）
    Prefix(String),
    /// 普通关键字：URI 子串（可含 `*`）
    Keyword(String),
    /// `/pattern/`：在 URI 中搜索，不区分大小写
    Regex(Regex),
}

/// 单条规则
#[derive(Debug, Clone)]
pub struct Rule {
    /// 原始规则文本
    text: String,
    pattern: Pattern,
    /// 例外规则（`@@`）
    exception: bool,
    /// 过期时间，`None` 表示永久
    expires_at: Option<Instant>,
}

impl Rule {
    /// 解析一条规则
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let text = text.trim();

        if text.is_empty() {
            return Err(RuleError::Empty);
        }
        if text.starts_with('!') || text.starts_with('[') {
            return Err(RuleError::Comment(text.to_string()));
        }
        if text.chars().any(char::is_whitespace) {
            return Err(RuleError::Whitespace(text.to_string()));
        }

        let (exception, body) = match text.strip_prefix("@@") {
            Some(rest) => (true, rest),
            None => (false, text),
        };

        let pattern = if body.len() > 2 && body.starts_with('/') && body.ends_with('/') {
            let regex = RegexBuilder::new(&body[1..body.len() - 1])
                .case_insensitive(true)
                .build()
                .map_err(|e| RuleError::InvalidRegex {
                    rule: text.to_string(),
                    reason: e.to_string(),
                })?;
            Pattern::Regex(regex)
        } else {
            Self::parse_plain(text, &body.to_lowercase())?
        };

        Ok(Self {
            text: text.to_string(),
            pattern,
            exception,
            expires_at: None,
        })
    }

    /// 解析非正则规则，`body` 已去掉 `@@` 并转为小写
    fn parse_plain(text: &str, body: &str) -> Result<Pattern, RuleError> {
        let pattern = if let Some(domain) = body.strip_prefix("||") {
            let domain = domain.trim_end_matches('/');
            if domain.is_empty() || domain.contains('/') {
                return Err(RuleError::Malformed {
                    rule: text.to_string(),
                    reason: "域名规则格式错误",
                });
            }
            Pattern::Domain(domain.to_string())
        } else if let Some(prefix) = body.strip_prefix('|') {
            if !prefix.contains("://") {
                return Err(RuleError::Malformed {
                    rule: text.to_string(),
                    reason: "前缀规则缺少协议",
                });
            }
            Pattern::Prefix(prefix.to_string())
        } else {
            if body.chars().all(|c| c == '*') {
                return Err(RuleError::Malformed {
                    rule: text.to_string(),
                    reason: "规则不能只包含通配符",
                });
            }
            Pattern::Keyword(body.to_string())
        };
        Ok(pattern)
    }

    /// 设置有效期
    pub fn with_expiry(mut self, expires_at: Option<Instant>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_exception(&self) -> bool {
        self.exception
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// `uri` 与 `host` 需已转为小写，`uri` 需包含协议
    fn matches(&self, uri: &str, host: &str) -> bool {
        match &self.pattern {
            Pattern::Domain(domain) => {
                if host == domain {
                    return true;
                }
                // 确保匹配的是完整的子域名
                host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
            }
            Pattern::Prefix(prefix) => wildcard_find(prefix, uri, true),
            Pattern::Keyword(keyword) => wildcard_find(keyword, uri, false),
            Pattern::Regex(regex) => regex.is_match(uri),
        }
    }
}

/// 带 `*` 通配符的查找，`anchored` 时要求从开头匹配
fn wildcard_find(pattern: &str, text: &str, anchored: bool) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");

    let mut rest = if anchored {
        match text.strip_prefix(first) {
            Some(rest) => rest,
            None => return false,
        }
    } else {
        match text.find(first) {
            Some(pos) => &text[pos + first.len()..],
            None => return false,
        }
    };

    for part in parts {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    true
}

/// CONNECT 请求的 URI 只有 `host:port`，按 https 处理
fn normalize_uri(uri: &str) -> String {
    let uri = uri.to_lowercase();
    if uri.contains("://") {
        uri
    } else {
        format!("https://{}", uri)
    }
}

/// 读写锁保护的有序规则列表
///
/// 读路径只持有读锁；发现过期规则时才短暂获取写锁清理。
#[derive(Debug)]
pub struct RuleList {
    name: &'static str,
    rules: RwLock<Vec<Rule>>,
}

impl RuleList {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 按指定时间点匹配
    pub fn matches_at(&self, uri: &str, host: &str, now: Instant) -> Option<bool> {
        let uri = normalize_uri(uri);
        let host = host.to_lowercase();

        let mut saw_expired = false;
        let mut hit = false;
        let mut result = None;
        {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            for rule in rules.iter() {
                if rule.is_expired(now) {
                    saw_expired = true;
                    continue;
                }
                if !rule.matches(&uri, &host) {
                    continue;
                }
                if rule.exception {
                    result = Some(false);
                    break;
                }
                hit = true;
            }
        }

        if saw_expired {
            self.purge_expired(now);
        }

        result.or(if hit { Some(true) } else { None })
    }

    /// 清理过期规则
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| {
            let expired = rule.is_expired(now);
            if expired {
                debug!("[{}] 规则过期: {}", self.name, rule.text);
            }
            !expired
        });
        before - rules.len()
    }

    pub fn add_at(&self, text: &str, ttl: Option<Duration>, now: Instant) -> Result<(), RuleError> {
        let rule = Rule::parse(text)?.with_expiry(ttl.map(|ttl| now + ttl));
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
        Ok(())
    }

    /// 检查与插入在同一把写锁内完成
    pub fn add_if_absent_at(
        &self,
        text: &str,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<bool, RuleError> {
        let rule = Rule::parse(text)?.with_expiry(ttl.map(|ttl| now + ttl));
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules
            .iter()
            .any(|r| r.text == rule.text && !r.is_expired(now))
        {
            return Ok(false);
        }
        rules.push(rule);
        Ok(true)
    }

    pub fn contains_at(&self, text: &str, now: Instant) -> bool {
        let text = text.trim();
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.text == text && !r.is_expired(now))
    }

    fn live_count(&self, now: Instant) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| !r.is_expired(now))
            .count()
    }
}

impl RuleSet for RuleList {
    fn matches(&self, uri: &str, host: &str) -> Option<bool> {
        self.matches_at(uri, host, Instant::now())
    }

    fn add(&self, text: &str, ttl: Option<Duration>) -> Result<(), RuleError> {
        self.add_at(text, ttl, Instant::now())
    }

    fn contains(&self, text: &str) -> bool {
        self.contains_at(text, Instant::now())
    }

    fn rule_texts(&self) -> Vec<String> {
        let now = Instant::now();
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| !r.is_expired(now))
            .map(|r| r.text.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.live_count(Instant::now())
    }

    fn add_if_absent(&self, text: &str, ttl: Option<Duration>) -> Result<bool, RuleError> {
        self.add_if_absent_at(text, ttl, Instant::now())
    }
}

/// 添加一行规则，失败只记录 debug 日志
pub fn add_rule_line(set: &dyn RuleSet, line: &str) -> bool {
    match set.add(line, None) {
        Ok(()) => true,
        Err(RuleError::Empty) | Err(RuleError::Comment(_)) => false,
        Err(e) => {
            debug!("创建 autoproxy 规则失败: {}", e);
            false
        }
    }
}

/// 加载本地规则文件内容
///
/// 每行格式为 `规则 [目标]`；带目标的行是重定向规则，原样返回给调用方
/// 交给重定向器处理。
pub fn load_local_rules(set: &dyn RuleSet, text: &str) -> Vec<(String, String)> {
    let mut redirects = Vec::new();
    let mut loaded = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }
        let (rule, dest) = match line.split_once(char::is_whitespace) {
            Some((rule, dest)) => (rule, dest.trim()),
            None => (line, ""),
        };

        if !dest.is_empty() {
            redirects.push((rule.to_string(), dest.to_string()));
        } else if add_rule_line(set, rule) {
            loaded += 1;
        }
    }

    info!("加载本地规则 {} 条, 重定向规则 {} 条", loaded, redirects.len());
    redirects
}

/// 加载第三方黑名单
///
/// 内容不含 `!` 时视为 base64 编码（gfwlist 格式）。
pub fn load_blocklist(set: &dyn RuleSet, data: &str) -> usize {
    let decoded;
    let data = if data.contains('!') {
        data
    } else {
        let compact: String = data.split_whitespace().collect();
        let bytes = match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("黑名单已损坏 (base64 解码失败): {}", e);
                return 0;
            }
        };
        decoded = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("黑名单已损坏 (非 UTF-8 内容): {}", e);
                return 0;
            }
        };
        decoded.as_str()
    };

    let loaded = data.lines().filter(|line| add_rule_line(set, line)).count();
    info!("加载黑名单规则 {} 条", loaded);
    loaded
}
