use log::{debug, info};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::metrics::Metrics;
use crate::parent::{Command, ParentCatalogue, DIRECT};
use crate::rules::RuleSet;

/// 临时规则的最长有效期（分钟）
pub const MAX_TEMP_RULE_MINUTES: f64 = 60.0;

/// 连接结果反馈
///
/// 直连失败而代理成功时，向 `local` 规则集写入临时代理规则，
/// 之后同一主机的请求不再先尝试直连。
pub struct FeedbackLoop {
    local: Arc<dyn RuleSet>,
    catalogue: Arc<dyn ParentCatalogue>,
    metrics: Metrics,
    /// 规则写入互斥，保证检查与插入之间没有其他写入者
    write_lock: Mutex<()>,
}

impl FeedbackLoop {
    pub fn new(local: Arc<dyn RuleSet>, catalogue: Arc<dyn ParentCatalogue>, metrics: Metrics) -> Self {
        Self {
            local,
            catalogue,
            metrics,
            write_lock: Mutex::new(()),
        }
    }

    /// 报告一次请求的最终结果，返回新增的规则
    ///
    /// * `request_host`   - (主机名, 端口)
    /// * `failed_parents` - 按尝试顺序失败的候选名称
    /// * `final_parent`   - 最后使用的候选
    #[allow(clippy::too_many_arguments)]
    pub fn report_outcome(
        &self,
        command: &Command,
        uri: &str,
        request_host: (&str, u16),
        success: bool,
        failed_parents: &[&str],
        final_parent: Option<&str>,
        elapsed: Duration,
    ) -> Option<String> {
        debug!(
            "notify: {} {} {}, failed_parents: {:?}, final: {}, {:?}",
            command,
            uri,
            if success { "Success" } else { "Failed" },
            failed_parents,
            final_parent.unwrap_or("None"),
            elapsed
        );
        self.metrics.inc_outcome_reports(success);

        // 复用连接池的失败不代表该候选真的不可用
        let direct_failed = failed_parents
            .iter()
            .filter(|name| !name.contains("pooled"))
            .any(|name| *name == DIRECT);

        if !success || !direct_failed {
            return None;
        }

        let (host, port) = request_host;
        let rule = temp_rule_text(command, host, port);
        if self.local.contains(&rule) {
            return None;
        }

        let resp_time = self.catalogue.direct().avg_resp_time(Some(host));
        let minutes = temp_rule_minutes(resp_time);

        if self.add_temp_rule(&rule, Some(minutes)) {
            Some(rule)
        } else {
            None
        }
    }

    /// 添加临时规则，`ttl_minutes` 为 `None`、非正数或非有限值时永久有效
    ///
    /// 已存在相同且未过期的规则时不做任何事，返回是否插入。
    pub fn add_temp_rule(&self, rule: &str, ttl_minutes: Option<f64>) -> bool {
        let rule = rule.trim();
        let ttl = ttl_minutes
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0));

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.local.add_if_absent(rule, ttl) {
            Ok(true) => {
                match ttl {
                    Some(ttl) => info!(
                        "添加 autoproxy 规则: {} {:.1} 分钟后过期",
                        rule,
                        ttl.as_secs_f64() / 60.0
                    ),
                    None => info!("添加 autoproxy 规则: {}", rule),
                }
                self.metrics.inc_temp_rules_added();
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("创建 autoproxy 规则失败: {}", e);
                false
            }
        }
    }
}

/// 强制代理该主机的规则文本
pub fn temp_rule_text(command: &Command, host: &str, port: u16) -> String {
    if command.is_connect() {
        format!("|https://{}", host)
    } else if port == 80 {
        format!("|http://{}", host)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 根据直连平均响应时间（秒）计算规则有效期（分钟）
pub fn temp_rule_minutes(resp_time: f64) -> f64 {
    let minutes = if resp_time > 1.0 {
        resp_time.powf(2.5)
    } else {
        1.0
    };
    minutes.min(MAX_TEMP_RULE_MINUTES)
}
