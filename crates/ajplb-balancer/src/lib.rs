pub mod balancer;
pub mod config;
pub mod connector;
pub mod maintainer;
pub mod member;
pub mod worker;

pub use balancer::{
    session_routes, Balancer, BalancerSettings, BalancerUpdate, MemberUpdate, Outcome, Selection,
};
pub use config::{
    BalancerConfig, ConnectorConfig, MaintainConfig, MemberConfig, PingMode, StatusConfig,
    WorkerConfig,
};
pub use connector::Connector;
pub use maintainer::{MaintainReport, Maintainer};
pub use member::BalancerMember;
pub use worker::{AjpWorker, ExchangeFailure, ExchangePhase, Served, WorkerUpdate};
