//! 代理转发的路由决策核心
//!
//! 对每个请求给出三种判定之一（代理 / 直连 / 未决），生成有序的上级代理重试列表，
//! 并根据连接结果学习临时代理规则。连接本身由调用方完成。
//!
//! ```no_run
//! use gfw_router::{Command, RouterConfig, Router, Request};
//!
//! let config = RouterConfig::from_file("config.json").unwrap();
//! let router = Router::builder(config).build();
//! let request = Request {
//!     command: Command::Connect,
//!     uri: "www.google.com:443",
//!     host: "www.google.com",
//!     port: 443,
//!     ip: "142.250.0.1".parse().unwrap(),
//! };
//! let (verdict, parents) = router.route(&request);
//! println!("{} {:?}", verdict, parents.iter().map(|p| p.name()).collect::<Vec<_>>());
//! ```

pub mod config;
pub mod decision;
pub mod error;
pub mod feedback;
pub mod geoip;
pub mod logger;
pub mod metrics;
pub mod parent;
pub mod region;
pub mod router;
pub mod rules;
pub mod selector;

pub use config::{DecisionLevel, ParentConfig, RouterConfig};
pub use decision::{GfwPolicy, HostOverrides, RoutingVerdict};
pub use error::{ConfigError, RuleError};
pub use feedback::FeedbackLoop;
pub use geoip::{CountryTable, RegionClassifier};
pub use metrics::{Metrics, MetricsSnapshot};
pub use parent::{Command, Parent, ParentCatalogue, ParentHandle, ParentList, ParentProxy};
pub use region::RegionCache;
pub use router::{Request, Router, RouterBuilder};
pub use rules::{RuleList, RuleSet};
pub use selector::ParentSelector;
