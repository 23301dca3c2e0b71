use log::info;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::{DecisionLevel, RouterConfig};
use crate::decision::{GfwPolicy, HostOverrides, RoutingVerdict};
use crate::feedback::FeedbackLoop;
use crate::geoip::{CountryTable, RegionClassifier};
use crate::metrics::Metrics;
use crate::parent::{Command, ParentCatalogue, ParentHandle, ParentList};
use crate::region::RegionCache;
use crate::rules::{self, RuleList, RuleSet};
use crate::selector::ParentSelector;

/// 一次请求的描述
#[derive(Debug, Clone)]
pub struct Request<'a> {
    /// 请求类型
    pub command: Command,
    /// `http://host/path`，CONNECT 为 `host:port`
    pub uri: &'a str,
    /// 不含端口的主机名
    pub host: &'a str,
    /// 目标端口
    pub port: u16,
    /// 解析失败时为全零地址
    pub ip: IpAddr,
}

/// 路由决策核心
///
/// 所有状态都在构造时注入，可在多个连接间共享（`Send + Sync`）。
/// `local` 规则集由读写锁保护，反馈写入由 `FeedbackLoop` 串行化。
pub struct Router {
    config: Arc<RouterConfig>,
    local: Arc<RuleList>,
    ignore: Arc<RuleList>,
    blocklist: Arc<RuleList>,
    region: Arc<RegionCache>,
    policy: GfwPolicy,
    selector: ParentSelector,
    feedback: FeedbackLoop,
    metrics: Metrics,
}

impl Router {
    /// 创建构造器
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    /// 获取路由配置
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// 获取统计信息
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 使用配置中的决策级别判定
    pub fn classify(&self, uri: &str, host: &str, port: u16, ip: IpAddr) -> RoutingVerdict {
        self.classify_with_level(uri, host, port, ip, self.config.decision_level)
    }

    /// 使用指定的决策级别判定，并记录判定统计
    pub fn classify_with_level(
        &self,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        level: DecisionLevel,
    ) -> RoutingVerdict {
        let verdict = self.policy.classify(uri, host, port, ip, level);
        self.metrics.record_verdict(verdict);
        verdict
    }

    /// 根据判定结果生成有序的上级代理重试列表
    pub fn select_parents(
        &self,
        verdict: RoutingVerdict,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        command: &Command,
    ) -> Vec<ParentHandle> {
        self.selector
            .select_parents(verdict, uri, host, port, ip, command)
    }

    /// 与 `select_parents` 相同，使用指定的随机数生成器
    #[allow(clippy::too_many_arguments)]
    pub fn select_parents_with_rng<R: Rng + ?Sized>(
        &self,
        verdict: RoutingVerdict,
        uri: &str,
        host: &str,
        port: u16,
        ip: IpAddr,
        command: &Command,
        rng: &mut R,
    ) -> Vec<ParentHandle> {
        self.selector
            .select_parents_with_rng(verdict, uri, host, port, ip, command, rng)
    }

    /// 判定并生成重试列表
    pub fn route(&self, request: &Request<'_>) -> (RoutingVerdict, Vec<ParentHandle>) {
        let verdict = self.classify(request.uri, request.host, request.port, request.ip);
        let parents = self.select_parents(
            verdict,
            request.uri,
            request.host,
            request.port,
            request.ip,
            &request.command,
        );
        (verdict, parents)
    }

    /// 报告请求结果，直连失败而代理成功时学习临时规则
    ///
    /// 返回新增的规则文本。
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
        self.feedback.report_outcome(
            command,
            uri,
            request_host,
            success,
            failed_parents,
            final_parent,
            elapsed,
        )
    }

    /// 向 `local` 规则集添加临时规则，返回是否插入
    pub fn add_temp_rule(&self, rule: &str, ttl_minutes: Option<f64>) -> bool {
        self.feedback.add_temp_rule(rule, ttl_minutes)
    }

    /// 主机 IP 是否在本地区（带缓存）
    pub fn is_host_in_region(&self, host: &str, ip: IpAddr) -> bool {
        self.region.is_host_in_region(host, ip)
    }

    /// 添加永久规则到 `local` 或黑名单，无效规则只记录 debug 日志
    pub fn add_rule(&self, line: &str, local: bool) -> bool {
        let set: &dyn RuleSet = if local {
            self.local.as_ref()
        } else {
            self.blocklist.as_ref()
        };
        rules::add_rule_line(set, line)
    }

    /// 由重定向器调用，添加延后处理的规则
    pub fn add_ignore_rule(&self, line: &str) -> bool {
        rules::add_rule_line(self.ignore.as_ref(), line)
    }

    /// 加载本地规则，返回需要交给重定向器的 (规则, 目标)
    pub fn load_local_rules(&self, text: &str) -> Vec<(String, String)> {
        rules::load_local_rules(self.local.as_ref(), text)
    }

    /// 加载黑名单，反向代理模式下跳过
    pub fn load_blocklist(&self, data: &str) -> usize {
        if self.config.reverse_proxy {
            return 0;
        }
        info!("加载黑名单...");
        rules::load_blocklist(self.blocklist.as_ref(), data)
    }

    /// `local` 规则集
    pub fn local_rules(&self) -> &RuleList {
        &self.local
    }

    /// 忽略规则集
    pub fn ignore_rules(&self) -> &RuleList {
        &self.ignore
    }

    /// 黑名单规则集
    pub fn blocklist_rules(&self) -> &RuleList {
        &self.blocklist
    }
}

/// `Router` 构造器，未指定的协作者使用配置中的默认实现
pub struct RouterBuilder {
    config: RouterConfig,
    classifier: Option<Arc<dyn RegionClassifier>>,
    catalogue: Option<Arc<dyn ParentCatalogue>>,
    hosts: Option<Arc<dyn HostOverrides>>,
    metrics: Metrics,
}

impl RouterBuilder {
    /// 创建构造器，协作者均使用默认实现
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            classifier: None,
            catalogue: None,
            hosts: None,
            metrics: Metrics::new(),
        }
    }

    /// 设置国家代码分类器，默认使用配置中的 GeoIP 表
    pub fn classifier(mut self, classifier: Arc<dyn RegionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 设置上级代理目录，默认使用配置中的代理列表
    pub fn catalogue(mut self, catalogue: Arc<dyn ParentCatalogue>) -> Self {
        self.catalogue = Some(catalogue);
        self
    }

    /// 设置手动覆盖主机表，默认使用配置中的 hosts
    pub fn hosts(mut self, hosts: Arc<dyn HostOverrides>) -> Self {
        self.hosts = Some(hosts);
        self
    }

    /// 设置统计信息，可与其他组件共享
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// 构建路由器
    pub fn build(self) -> Router {
        let config = Arc::new(self.config);
        let metrics = self.metrics;

        let classifier: Arc<dyn RegionClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(CountryTable::from_lines(&config.geoip)),
        };
        let catalogue: Arc<dyn ParentCatalogue> = match self.catalogue {
            Some(catalogue) => catalogue,
            None => Arc::new(ParentList::from_config(&config)),
        };
        let hosts: Arc<dyn HostOverrides> = match self.hosts {
            Some(hosts) => hosts,
            None => Arc::new(config.hosts.iter().cloned().collect::<HashSet<String>>()),
        };

        let local = Arc::new(RuleList::new("local"));
        let ignore = Arc::new(RuleList::new("ignore"));
        let blocklist = Arc::new(RuleList::new("blocklist"));

        let region = Arc::new(RegionCache::new(
            classifier.clone(),
            config.clone(),
            metrics.clone(),
        ));

        let policy = GfwPolicy::new(
            config.clone(),
            local.clone(),
            ignore.clone(),
            blocklist.clone(),
            region.clone(),
            hosts,
        );
        let selector = ParentSelector::new(
            config.clone(),
            catalogue.clone(),
            classifier,
            metrics.clone(),
        );
        let feedback = FeedbackLoop::new(local.clone(), catalogue, metrics.clone());

        info!(
            "路由器初始化: level {}, 最大重试 {}, 地区 {:?}",
            config.decision_level, config.max_retry, config.region
        );

        Router {
            config,
            local,
            ignore,
            blocklist,
            region,
            policy,
            selector,
            feedback,
            metrics,
        }
    }
}
