use chrono::Local;
use env_logger::{Builder, Env, Target, WriteStyle};
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::LogConfigFile;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// 关闭所有日志
    Off,
    /// 错误日志
    Error,
    /// 警告日志
    Warn,
    /// 信息日志
    Info,
    /// 调试日志
    Debug,
    /// 追踪日志
    Trace,
}

impl LogLevel {
    /// 转换为 log::LevelFilter
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// 从字符串解析日志级别，不区分大小写
impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("未知的日志级别: {}", other)),
        }
    }
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// 标准错误
    Stderr,
    /// 追加写入文件（不使用颜色）
    File(PathBuf),
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否显示时间戳
    pub show_timestamp: bool,
    /// 是否显示模块路径
    pub show_module: bool,
    /// 是否使用颜色（仅终端）
    pub use_color: bool,
    /// 日志输出目标
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stderr,
        }
    }
}

impl LogConfig {
    /// 创建新的日志配置
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// 设置日志级别
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// 设置是否显示时间戳
    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    /// 设置是否显示模块路径
    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    /// 设置是否使用颜色
    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    /// 设置输出到文件
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }
}

impl From<&LogConfigFile> for LogConfig {
    /// 无效的级别退回 info
    fn from(file: &LogConfigFile) -> Self {
        let level = file.level.parse().unwrap_or(LogLevel::Info);
        let config = LogConfig::new(level)
            .with_timestamp(file.show_timestamp)
            .with_module(file.show_module)
            .with_color(file.use_color);
        match &file.file_path {
            Some(path) => config.with_file(path),
            None => config,
        }
    }
}

/// 按配置设置 env_logger 构造器
fn configure(builder: &mut Builder, config: &LogConfig) -> Result<(), String> {
    builder.filter_level(config.level.to_level_filter());
    builder.write_style(if config.use_color {
        WriteStyle::Auto
    } else {
        WriteStyle::Never
    });

    if let LogOutput::File(path) = &config.output {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| format!("无法创建日志目录: {}", e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("无法创建日志文件: {}", e))?;
        builder.target(Target::Pipe(Box::new(file)));
        builder.write_style(WriteStyle::Never);
    }

    let show_timestamp = config.show_timestamp;
    let show_module = config.show_module;
    builder.format(move |buf, record| {
        if show_timestamp {
            write!(buf, "[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))?;
        }
        let style = buf.default_level_style(record.level());
        write!(buf, "{style}{:<5}{style:#} ", record.level())?;
        if show_module {
            if let Some(module) = record.module_path() {
                write!(buf, "[{}] ", module)?;
            }
        }
        writeln!(buf, "{}", record.args())
    });

    Ok(())
}

/// 初始化日志系统，重复初始化返回错误
///
/// ```no_run
/// use gfw_router::logger::{init_logger, LogConfig, LogLevel};
///
/// let config = LogConfig::new(LogLevel::Debug).with_file("logs/gfw-router.log");
/// init_logger(config).unwrap();
/// ```
pub fn init_logger(config: LogConfig) -> Result<(), String> {
    let mut builder = Builder::new();
    configure(&mut builder, &config)?;
    builder
        .try_init()
        .map_err(|e| format!("设置日志器失败: {}", e))
}

/// 从 `RUST_LOG` 初始化，未设置时为 info
pub fn init_from_env() -> Result<(), String> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .try_init()
        .map_err(|e| format!("设置日志器失败: {}", e))
}
