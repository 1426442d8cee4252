//! 交易所适配器契约
//!
//! 网关只依赖这里定义的 trait：每个交易所的 REST + WebSocket 客户端实现
//! `ExchangeAdapter`，返回 Binance 格式的 JSON。
//!
//! - `events`:  事件注册表 + 事件类型
//! - `pending`: PendingOrderMap (Bitfinex/Huobi 的挂单视图)
//! - `paper`:   进程内模拟盘适配器

pub mod events;
pub mod paper;
pub mod pending;

use crate::account::Account;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub use events::{EventHandler, EventRegistry, StreamEvent};
pub use pending::{PendingOrder, PendingOrderMap};

// ═══════════════════════════════════════════════════════════════════════════
// 交易所
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    Binance,
    Bitfinex,
    Huobi,
    Okx,
    Bybit,
}

/// 拆分交易对时识别的计价币种 (按长度优先匹配)
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "DAI", "USD", "EUR", "BTC", "ETH", "BNB",
];

/// `BTCUSDT` → `("BTC", "USDT")`
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    QUOTE_ASSETS.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, &symbol[base.len()..]))
    })
}

impl ExchangeId {
    /// 配置中的交易所名称 (`binance_us` 按 Binance 处理)
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "binance" | "binance_us" => Some(ExchangeId::Binance),
            "bitfinex" => Some(ExchangeId::Bitfinex),
            "huobi" => Some(ExchangeId::Huobi),
            "okx" => Some(ExchangeId::Okx),
            "bybit" => Some(ExchangeId::Bybit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bitfinex => "bitfinex",
            ExchangeId::Huobi => "huobi",
            ExchangeId::Okx => "okx",
            ExchangeId::Bybit => "bybit",
        }
    }

    /// 需要维护 PendingOrderMap 的交易所
    pub fn tracks_pending_orders(&self) -> bool {
        matches!(self, ExchangeId::Bitfinex | ExchangeId::Huobi)
    }

    /// 余额变动需要 REST 轮询流水
    pub fn polls_ledgers(&self) -> bool {
        matches!(self, ExchangeId::Bitfinex | ExchangeId::Huobi | ExchangeId::Bybit)
    }

    /// 余额变动由用户流推送
    pub fn pushes_balance_updates(&self) -> bool {
        matches!(self, ExchangeId::Binance | ExchangeId::Okx)
    }

    /// 下单返回空应答时需要按客户端订单号补查
    pub fn refetches_empty_order_reply(&self) -> bool {
        matches!(self, ExchangeId::Binance | ExchangeId::Huobi | ExchangeId::Okx)
    }

    pub fn order_book_depth(&self) -> u32 {
        match self {
            ExchangeId::Bitfinex | ExchangeId::Okx => 1,
            _ => 5,
        }
    }

    /// 资金账户查询 (Binance 仅限正式网)
    pub fn has_funding_wallet(&self, test_net: bool) -> bool {
        match self {
            ExchangeId::Bitfinex | ExchangeId::Okx | ExchangeId::Bybit => true,
            ExchangeId::Binance => !test_net,
            ExchangeId::Huobi => false,
        }
    }

    /// 行情事件类型中使用的交易对写法
    pub fn stream_symbol(&self, symbol: &str) -> String {
        match self {
            ExchangeId::Bitfinex => symbol_to_bfx(symbol),
            ExchangeId::Okx => symbol_to_okx(symbol),
            ExchangeId::Bybit => symbol.to_string(),
            _ => symbol.to_lowercase(),
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExchangeId::parse(s).ok_or_else(|| AdapterError::Unsupported(format!("exchange '{}'", s)))
    }
}

/// `BTCUSDT` → `tBTCUST` (Bitfinex 用 UST 表示 USDT，长代码用冒号分隔)
pub fn symbol_to_bfx(symbol: &str) -> String {
    match split_symbol(symbol) {
        Some((base, quote)) => {
            let quote = if quote == "USDT" { "UST" } else { quote };
            if base.len() > 3 || quote.len() > 3 {
                format!("t{}:{}", base, quote)
            } else {
                format!("t{}{}", base, quote)
            }
        }
        None => format!("t{}", symbol),
    }
}

/// `BTCUSDT` → `BTC-USDT`
pub fn symbol_to_okx(symbol: &str) -> String {
    match split_symbol(symbol) {
        Some((base, quote)) => format!("{}-{}", base, quote),
        None => symbol.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 错误类型
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("Rate limit reached: {0}")]
    RateLimitReached(String),

    #[error("Query canceled: {0}")]
    QueryCanceled(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AdapterError::RateLimitReached(_) | AdapterError::QueryCanceled(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

// ═══════════════════════════════════════════════════════════════════════════
// 下单参数
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub quantity: String,
    pub price: String,
    pub new_client_order_id: String,
}

/// 查询订单：按交易所订单号或客户端订单号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderQuery {
    OrderId(i64),
    ClientOrderId(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// 适配器 trait
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> ExchangeId;

    fn events(&self) -> &EventRegistry;

    fn rate_limit_reached(&self) -> bool;

    fn set_rate_limit_reached(&self, reached: bool);

    fn symbol_to_exchange(&self, symbol: &str) -> String {
        self.exchange().stream_symbol(symbol)
    }

    /// 一次性初始化 (交易规则、账户 ID)
    async fn load(&self, symbol: &str) -> AdapterResult<()>;

    /// `(uid, account_id)`，load 之后可用
    fn account_ids(&self) -> Option<(String, String)>;

    fn set_master_account(&self, uid: String, account_id: String);

    // ---- REST ----

    async fn fetch_server_time(&self) -> AdapterResult<Value>;

    async fn fetch_exchange_info(&self, symbol: &str) -> AdapterResult<Value>;

    async fn fetch_open_orders(&self, trade_id: &str, symbol: &str) -> AdapterResult<Vec<Value>>;

    async fn fetch_order(&self, trade_id: &str, symbol: &str, query: OrderQuery) -> AdapterResult<Value>;

    async fn fetch_order_trade_list(&self, trade_id: &str, symbol: &str, order_id: i64) -> AdapterResult<Vec<Value>>;

    async fn fetch_account_information(&self, trade_id: &str) -> AdapterResult<Value>;

    async fn fetch_funding_wallet(
        &self,
        asset: &str,
        need_btc_valuation: bool,
        receive_window: Option<u32>,
    ) -> AdapterResult<Vec<Value>>;

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> AdapterResult<Value>;

    async fn fetch_symbol_price_ticker(&self, symbol: &str) -> AdapterResult<Value>;

    async fn fetch_ticker_price_change_statistics(&self, symbol: &str) -> AdapterResult<Value>;

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: Option<u32>) -> AdapterResult<Vec<Value>>;

    /// 余额流水，行格式与 `balanceUpdate` 事件相同
    async fn fetch_ledgers(&self, symbol: &str) -> AdapterResult<Vec<Value>>;

    async fn fetch_account_trade_list(
        &self,
        trade_id: &str,
        symbol: &str,
        start_time: Option<i64>,
        limit: Option<u32>,
    ) -> AdapterResult<Vec<Value>>;

    async fn create_order(&self, trade_id: &str, order: NewOrder) -> AdapterResult<Value>;

    async fn cancel_order(&self, trade_id: &str, symbol: &str, order_id: i64) -> AdapterResult<Value>;

    async fn cancel_all_orders(&self, trade_id: &str, symbol: &str) -> AdapterResult<Value>;

    async fn transfer_to_master(&self, symbol: &str, quantity: &str) -> AdapterResult<Value>;

    async fn one_click_arrival_deposit(&self, tx_id: &str) -> AdapterResult<Value>;

    // ---- 监听器 ----

    async fn start_market_events_listener(&self, trade_id: &str) -> AdapterResult<()>;

    async fn start_user_events_listener(&self, trade_id: &str, symbol: &str) -> AdapterResult<()>;

    async fn stop_events_listener(&self, trade_id: &str) -> AdapterResult<()>;

    fn has_data_streams(&self, trade_id: &str) -> bool;

    // ---- PendingOrderMap ----

    fn active_order(&self, trade_id: &str, order_id: i64, orig_qty: &str, executed_qty: &str);

    fn active_orders_clear(&self, trade_id: &str);

    /// 关闭 HTTP/WS 会话
    async fn close(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// 适配器工厂
// ═══════════════════════════════════════════════════════════════════════════

pub trait AdapterFactory: Send + Sync {
    fn create(&self, account: &Account) -> AdapterResult<Arc<dyn ExchangeAdapter>>;
}

/// 按交易所分派的工厂
#[derive(Default)]
pub struct AdapterRegistry {
    factories: DashMap<ExchangeId, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, exchange: ExchangeId, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(exchange, factory);
    }

    pub fn supports(&self, exchange: ExchangeId) -> bool {
        self.factories.contains_key(&exchange)
    }
}

impl AdapterFactory for AdapterRegistry {
    fn create(&self, account: &Account) -> AdapterResult<Arc<dyn ExchangeAdapter>> {
        let factory = self
            .factories
            .get(&account.exchange)
            .map(|f| f.value().clone())
            .ok_or_else(|| AdapterError::Unsupported(format!("no adapter for exchange '{}'", account.exchange)))?;
        factory.create(account)
    }
}
