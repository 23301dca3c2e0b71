use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

lazy_static! {
    /// 洲 -> 国家代码
    static ref CONTINENTS: HashMap<&'static str, &'static [&'static str]> = {
        let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        m.insert("asia", &[
            "AE", "AF", "AL", "AZ", "BD", "BH", "BN", "BT", "CN", "CY", "HK", "ID",
            "IL", "IN", "IQ", "IR", "JO", "JP", "KH", "KP", "KR", "KW", "KZ", "LA",
            "LB", "LU", "MN", "MO", "MV", "MY", "NP", "OM", "PH", "PK", "QA", "SA",
            "SG", "SY", "TH", "TJ", "TM", "TW", "UZ", "VN", "YE",
        ]);
        m.insert("africa", &[
            "AO", "BI", "BJ", "BW", "CF", "CG", "CM", "CV", "DZ", "EG", "ET", "GA", "GH",
            "GM", "GN", "GQ", "KE", "LY", "MA", "MG", "ML", "MR", "MU", "MZ", "NA", "NE",
            "NG", "RW", "SD", "SN", "SO", "TN", "TZ", "UG", "ZA", "ZM", "ZR", "ZW",
        ]);
        m.insert("north_america", &[
            "BM", "BS", "CA", "CR", "CU", "GD", "GT", "HN", "HT", "JM", "MX", "NI", "PA",
            "US", "VE",
        ]);
        m.insert("south_america", &["AR", "BO", "BR", "CL", "CO", "EC", "GY", "PE", "PY", "UY"]);
        m.insert("europe", &[
            "AT", "BE", "BG", "CH", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB",
            "GR", "HR", "HU", "IE", "IS", "IT", "LT", "LV", "MC", "MD", "MT", "NL",
            "NO", "PL", "PT", "RO", "RU", "SE", "SK", "SM", "UA", "UK", "VA", "YU",
        ]);
        m.insert("pacific", &["AU", "CK", "FJ", "GU", "NZ", "PG", "TO"]);
        m
    };
}

/// 将洲名和国家代码混合列表展开为国家代码集合
///
/// 未知的洲名如果是两位字母则按国家代码处理，否则返回错误。
pub fn aggregate_region<I, S>(names: I) -> Result<HashSet<String>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut codes = HashSet::new();
    for name in names {
        let name = name.as_ref().trim();
        if let Some(members) = CONTINENTS.get(name.to_lowercase().as_str()) {
            codes.extend(members.iter().map(|c| c.to_string()));
        } else if name.len() == 2 && name.chars().all(|c| c.is_ascii_alphabetic()) {
            codes.insert(name.to_uppercase());
        } else {
            return Err(ConfigError::Invalid {
                field: "region",
                reason: format!("未知的地区: {}", name),
            });
        }
    }
    Ok(codes)
}

/// 决策级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DecisionLevel {
    /// 0: 全部直连
    Direct = 0,
    /// 1: 本地规则 / 地区 / 黑名单自动判断
    Auto = 1,
    /// 2: 同 1，另外明文请求走代理
    EncryptAll = 2,
    /// 3: 不在地区内的全部走代理
    Chnroute = 3,
    /// 4: 除私有地址外全部走代理
    Global = 4,
    /// 5: 除回环地址外全部走代理
    GlobalAll = 5,
}

impl TryFrom<u8> for DecisionLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DecisionLevel::Direct),
            1 => Ok(DecisionLevel::Auto),
            2 => Ok(DecisionLevel::EncryptAll),
            3 => Ok(DecisionLevel::Chnroute),
            4 => Ok(DecisionLevel::Global),
            5 => Ok(DecisionLevel::GlobalAll),
            _ => Err(format!("决策级别必须在 0-5 之间: {}", value)),
        }
    }
}

impl From<DecisionLevel> for u8 {
    fn from(level: DecisionLevel) -> Self {
        level as u8
    }
}

impl Default for DecisionLevel {
    fn default() -> Self {
        DecisionLevel::Auto
    }
}

impl fmt::Display for DecisionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// 上级代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentConfig {
    pub name: String,
    /// 代理地址，例如 `http://127.0.0.1:8118`
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default = "default_true")]
    pub http: bool,
    #[serde(default = "default_true")]
    pub https: bool,
    /// 代理服务器所在国家
    #[serde(default)]
    pub country: Option<String>,
}

/// 日志配置（可选）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfigFile {
    /// 日志级别: off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志文件路径，不设置时输出到标准错误
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_path: None,
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

/// 路由配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub decision_level: DecisionLevel,
    /// 反向代理模式（不做 GFW 判断）
    #[serde(default)]
    pub reverse_proxy: bool,
    #[serde(default = "default_max_retry")]
    pub max_retry: usize,
    /// 洲名或国家代码
    #[serde(default = "default_region")]
    pub region: Vec<String>,
    /// 是否使用黑名单
    #[serde(default = "default_true")]
    pub blocklist_enabled: bool,
    #[serde(default)]
    pub parents: Vec<ParentConfig>,
    /// 目标为私有地址时使用的代理
    #[serde(default)]
    pub local_parent: Option<ParentConfig>,
    /// 手动覆盖的主机表
    #[serde(default)]
    pub hosts: Vec<String>,
    /// `CIDR 国家代码` 条目
    #[serde(default)]
    pub geoip: Vec<String>,
    #[serde(default)]
    pub log: Option<LogConfigFile>,

    #[serde(skip)]
    home_region: HashSet<String>,
}

fn default_priority() -> f64 {
    99.0
}

fn default_true() -> bool {
    true
}

fn default_max_retry() -> usize {
    4
}

fn default_region() -> Vec<String> {
    vec!["CN".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        let region = default_region();
        let home_region = region.iter().map(|c| c.to_uppercase()).collect();
        Self {
            decision_level: DecisionLevel::default(),
            reverse_proxy: false,
            max_retry: default_max_retry(),
            region,
            blocklist_enabled: true,
            parents: Vec::new(),
            local_parent: None,
            hosts: Vec::new(),
            geoip: Vec::new(),
            log: None,
            home_region,
        }
    }
}

impl RouterConfig {
    /// 从 JSON 字符串解析并校验
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let mut config: RouterConfig = serde_json::from_str(content)?;
        config.finalize()?;
        Ok(config)
    }

    /// 从文件读取
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// 展开地区并校验各字段
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.max_retry == 0 {
            return Err(ConfigError::Invalid {
                field: "max_retry",
                reason: "必须大于 0".to_string(),
            });
        }
        for parent in &self.parents {
            // 名称含 direct 的代理不会出现在候选列表中
            if parent.name.contains("direct") || parent.name == "local" {
                return Err(ConfigError::Invalid {
                    field: "parents",
                    reason: format!("保留的代理名称: {}", parent.name),
                });
            }
        }
        self.home_region = aggregate_region(&self.region)?;
        Ok(())
    }

    pub fn with_decision_level(mut self, level: DecisionLevel) -> Self {
        self.decision_level = level;
        self
    }

    pub fn with_reverse_proxy(mut self, enabled: bool) -> Self {
        self.reverse_proxy = enabled;
        self
    }

    /// 设置最大重试次数，至少为 1
    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry.max(1);
        self
    }

    pub fn with_blocklist(mut self, enabled: bool) -> Self {
        self.blocklist_enabled = enabled;
        self
    }

    /// 直接设置地区国家代码集合
    pub fn with_home_region<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.home_region = codes.into_iter().map(|c| c.as_ref().to_uppercase()).collect();
        self.region = self.home_region.iter().cloned().collect();
        self
    }

    pub fn home_region(&self) -> &HashSet<String> {
        &self.home_region
    }

    pub fn in_home_region(&self, code: &str) -> bool {
        self.home_region.contains(&code.to_uppercase())
    }
}
