//! # EXCHANGES-WRAPPER-RS
//!
//! 多交易所 gRPC 网关 - 一个进程同时托管多个已认证的交易所会话
//!
//! ## 核心能力
//!
//! - **账户配置**: 从 TOML 解析账户与各交易所 REST/WS 端点
//! - **会话注册表**: 按账户名复用会话 (OpenClient)
//! - **限频控制**: 按交易所/调用类型的最小调用间隔 + 全局限频锁存
//! - **事件分发**: 适配器事件 → 每个订阅一个有界队列 (队列满则关闭订阅)
//! - **流式推送**: server-streaming RPC，StopStream 优雅结束
//! - **成交补偿**: 查询/撤单发现成交时合成成交事件
//!
//! ## 架构设计
//!
//! ```text
//! gRPC 客户端
//!     ↓
//! Service Layer (service/)       ← tonic Martin 服务
//!     ↓
//! Gateway (gateway/)             ← 注册表 / 限频 / 队列 / 分发 / 补偿
//!     ↓
//! Exchange Adapter (adapter/)    ← REST + WS 客户端 (外部实现)
//! ```

// ============================================================================
// 内部模块
// ============================================================================

/// 账户配置加载
pub mod account;

/// 交易所适配器契约 + 模拟盘适配器
pub mod adapter;

/// 网关核心：会话、限频、订阅队列、事件分发、成交补偿
pub mod gateway;

/// gRPC 服务层
pub mod service;

/// 服务生命周期
pub mod server;

/// 工具模块 (配置、日志、命名任务)
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use account::{get_account, Account, AccountError};
pub use adapter::{AdapterError, AdapterFactory, ExchangeAdapter, ExchangeId};
pub use gateway::Gateway;
pub use service::grpc::MartinServiceImpl;

/// 服务版本 (OpenClientConnectionId.srv_version)
pub const SRV_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// 全局错误类型
// ============================================================================

/// 网关错误类型
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Client {0} is not connected")]
    ClientNotFound(i64),

    #[error("Account {0} not registered into {1}")]
    AccountNotRegistered(String, String),

    #[error("Account config error: {0}")]
    Account(#[from] AccountError),

    #[error("{0}")]
    Adapter(#[from] AdapterError),

    #[error("No exchange adapter for account '{account}': {source}")]
    AdapterUnavailable {
        account: String,
        #[source]
        source: AdapterError,
    },

    #[error("OpenClientConnection for '{account}' failed: {source}")]
    SessionLoad {
        account: String,
        #[source]
        source: AdapterError,
    },

    #[error("Symbol {0} not exist")]
    SymbolNotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl GatewayError {
    /// 限频类错误 (需要置位全局限频锁存)
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GatewayError::Adapter(e) if e.is_rate_limit())
    }

    /// 任务取消 (不记录日志)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Adapter(AdapterError::Cancelled))
    }
}

impl From<GatewayError> for tonic::Status {
    fn from(err: GatewayError) -> Self {
        let details = err.to_string();
        match err {
            GatewayError::Adapter(e) => match e {
                AdapterError::RateLimitReached(_) | AdapterError::QueryCanceled(_) => {
                    tonic::Status::resource_exhausted(details)
                }
                AdapterError::Http { .. } => tonic::Status::failed_precondition(details),
                AdapterError::Cancelled => tonic::Status::cancelled(details),
                _ => tonic::Status::unknown(details),
            },
            GatewayError::SessionLoad { .. } => tonic::Status::resource_exhausted(details),
            GatewayError::ClientNotFound(_)
            | GatewayError::AccountNotRegistered(..)
            | GatewayError::Account(_)
            | GatewayError::AdapterUnavailable { .. }
            | GatewayError::SymbolNotFound(_) => tonic::Status::failed_precondition(details),
            GatewayError::InvalidParameter(_) => tonic::Status::invalid_argument(details),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

// ============================================================================
// 测试模块
// ============================================================================
