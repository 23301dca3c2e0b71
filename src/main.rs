use anyhow::{anyhow, bail, Context, Result};
use gfw_router::logger::{init_from_env, init_logger, LogConfig};
use gfw_router::{Command, Request, Router, RouterConfig, RuleSet};
use std::fs;
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// 从请求行推导主机和端口
///
/// CONNECT 的 URI 为 `host:port`，其余为 `scheme://host[:port]/path`。
fn host_port(command: &Command, uri: &str) -> Result<(String, u16)> {
    let (authority, default_port) = if command.is_connect() {
        (uri, 443)
    } else {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| anyhow!("缺少协议: {}", uri))?;
        let port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        let authority = rest.split(&['/', '?', '#'][..]).next().unwrap_or(rest);
        (authority, port)
    };

    // [ipv6]:port
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("无效的 IPv6 地址: {}", authority))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().context(format!("无效的端口: {}", p))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().context(format!("无效的端口: {}", port))?;
            Ok((host.to_lowercase(), port))
        }
        None => Ok((authority.to_lowercase(), default_port)),
    }
}

fn handle_line(router: &Router, line: &str) -> Result<String> {
    let mut parts = line.split_whitespace();
    let (method, uri) = match (parts.next(), parts.next()) {
        (Some(method), Some(uri)) => (method, uri),
        _ => bail!("格式应为 METHOD URI [IP]"),
    };
    let ip: IpAddr = match parts.next() {
        Some(ip) => ip.parse().context(format!("无效的地址: {}", ip))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let command = Command::parse(method);
    let (host, port) = host_port(&command, uri)?;
    let request = Request {
        command,
        uri,
        host: &host,
        port,
        ip,
    };

    let (verdict, parents) = router.route(&request);
    let names: Vec<&str> = parents.iter().map(|p| p.name()).collect();
    Ok(format!("{} {} -> {} [{}]", method, uri, verdict, names.join(", ")))
}

fn load_rules_file(router: &Router, path: &str) -> Result<()> {
    let content = fs::read_to_string(path).context(format!("无法读取规则文件: {}", path))?;
    let file_name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if file_name.contains("gfwlist") || file_name.contains("blocklist") {
        let count = router.load_blocklist(&content);
        log::info!("黑名单 {}: {} 条规则", path, count);
    } else {
        let redirects = router.load_local_rules(&content);
        log::info!(
            "本地规则 {}: {} 条规则, {} 条重定向",
            path,
            router.local_rules().len(),
            redirects.len()
        );
        for (rule, dest) in redirects.iter().take(10) {
            log::debug!("  重定向 {} -> {}", rule, dest);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.json".to_string());

    let config = RouterConfig::from_file(&config_path)
        .context(format!("无法加载配置文件: {}", config_path))?;

    let logger = match &config.log {
        Some(log_config) => init_logger(LogConfig::from(log_config)),
        None => init_from_env(),
    };
    logger.map_err(|e| anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== 路由决策核心启动 ===");
    log::info!("配置文件: {}", config_path);
    log::info!("决策级别: {}", config.decision_level);
    log::info!("上级代理: {} 个", config.parents.len());

    let router = Router::builder(config).build();

    for path in args {
        load_rules_file(&router, &path)?;
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line.context("读取标准输入失败")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match handle_line(&router, line) {
            Ok(result) => writeln!(out, "{}", result)?,
            Err(e) => log::warn!("忽略无效请求 {:?}: {:#}", line, e),
        }
    }
    out.flush()?;

    router.metrics().print_summary();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port() {
        assert_eq!(
            host_port(&Command::Connect, "example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            host_port(&Command::parse("GET"), "http://Example.com/a:b").unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            host_port(&Command::parse("GET"), "http://example.com:8080/").unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            host_port(&Command::Connect, "[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(host_port(&Command::parse("GET"), "example.com/").is_err());
    }

    #[test]
    fn test_handle_line() {
        let router = Router::builder(RouterConfig::default()).build();

        let line = handle_line(&router, "GET http://nas.lan/ 192.168.1.2").unwrap();
        assert_eq!(line, "GET http://nas.lan/ -> direct [direct]");

        // 未解析的地址走代理，没有上级代理时退回直连
        let line = handle_line(&router, "CONNECT blocked.com:443").unwrap();
        assert_eq!(line, "CONNECT blocked.com:443 -> proxy [direct]");

        assert!(handle_line(&router, "GET").is_err());
        assert!(handle_line(&router, "GET http://a.com/ not-an-ip").is_err());
    }
}
