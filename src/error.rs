use thiserror::Error;

/// 规则解析错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// 空规则
    #[error("空规则")]
    Empty,
    /// 注释行或列表头（`!` / `[...]`）
    #[error("注释行: {0}")]
    Comment(String),
    /// 规则中包含空白字符
    #[error("规则中包含空白字符: {0}")]
    Whitespace(String),
    /// 正则规则无法编译
    #[error("无效的正则规则 {rule}: {reason}")]
    InvalidRegex { rule: String, reason: String },
    /// 格式错误
    #[error("无效的规则 {rule}: {reason}")]
    Malformed { rule: String, reason: &'static str },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("解析配置文件失败: {0}")]
    Json(#[from] serde_json::Error),
    #[error("无效的配置项 {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
