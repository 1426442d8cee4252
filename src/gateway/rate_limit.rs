//! 限频控制
//!
//! - 按 (交易所, 调用类型) 配置最小调用间隔，REST 调用前等待
//! - 全局限频锁存：任何调用遇到限频错误时置位，ResetRateLimit 在冷却期后清除
//! - 全局 rate_limiter：所有客户端请求值的最大值

use super::registry::OpenClient;
use crate::adapter::ExchangeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// 调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallClass {
    Default,
    CreateOrder,
    CancelOrder,
    FetchLedgers,
}

impl CallClass {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "default" => Some(CallClass::Default),
            "create_order" => Some(CallClass::CreateOrder),
            "cancel_order" => Some(CallClass::CancelOrder),
            "fetch_ledgers" => Some(CallClass::FetchLedgers),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Default => "default",
            CallClass::CreateOrder => "create_order",
            CallClass::CancelOrder => "cancel_order",
            CallClass::FetchLedgers => "fetch_ledgers",
        }
    }
}

impl fmt::Display for CallClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 间隔表
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct RateLimitTable {
    intervals: HashMap<(ExchangeId, CallClass), Duration>,
}

impl RateLimitTable {
    /// 内置默认值：Bitfinex REST 约 90 次/分钟
    pub fn builtin() -> Self {
        let mut table = Self::default();
        table.set(ExchangeId::Bitfinex, CallClass::Default, Duration::from_secs(1));
        table.set(ExchangeId::Bitfinex, CallClass::CreateOrder, Duration::from_millis(500));
        table.set(ExchangeId::Bitfinex, CallClass::CancelOrder, Duration::from_millis(500));
        table
    }

    /// 内置默认值 + 配置文件 `[rate_limit.<exchange>]` 覆盖
    pub fn from_config(config: &HashMap<String, HashMap<String, f64>>) -> Self {
        let mut table = Self::builtin();
        for (exchange, classes) in config {
            let Some(exchange_id) = ExchangeId::parse(exchange) else {
                log::warn!("rate_limit: unknown exchange '{}' ignored", exchange);
                continue;
            };
            for (class, secs) in classes {
                match CallClass::parse(class) {
                    Some(class) if secs.is_finite() && *secs >= 0.0 => {
                        table.set(exchange_id, class, Duration::from_secs_f64(*secs))
                    }
                    _ => log::warn!("rate_limit: invalid entry {}.{} = {} ignored", exchange, class, secs),
                }
            }
        }
        table
    }

    pub fn set(&mut self, exchange: ExchangeId, class: CallClass, interval: Duration) {
        self.intervals.insert((exchange, class), interval);
    }

    /// 专用间隔，否则 default，否则 0
    pub fn interval(&self, exchange: ExchangeId, class: CallClass) -> Duration {
        self.intervals
            .get(&(exchange, class))
            .or_else(|| self.intervals.get(&(exchange, CallClass::Default)))
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// 等待期间调用被取消时撤回预约
struct Reservation<'a> {
    client: &'a OpenClient,
    at: Instant,
    previous: Option<Instant>,
    sent: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.client.release_call(self.at, self.previous);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 控制器
// ═══════════════════════════════════════════════════════════════════════════

pub struct RateLimitController {
    table: RateLimitTable,
    reset_after: Duration,
    /// 全局限频锁存 (置位时刻)
    latch: Mutex<Option<Instant>>,
    rate_limiter: AtomicU32,
}

impl RateLimitController {
    pub fn new(table: RateLimitTable, reset_after: Duration) -> Self {
        Self {
            table,
            reset_after,
            latch: Mutex::new(None),
            rate_limiter: AtomicU32::new(0),
        }
    }

    pub fn interval(&self, exchange: ExchangeId, class: CallClass) -> Duration {
        self.table.interval(exchange, class)
    }

    /// REST 调用前等待，保证与上一次调用间隔不小于配置值
    pub async fn wait(&self, client: &OpenClient, class: CallClass) {
        let interval = self.interval(client.exchange(), class);
        if interval.is_zero() {
            return;
        }
        let (previous, at) = client.reserve(interval);
        if at > Instant::now() {
            log::debug!(
                "rate_limit: {} {} waits {:?}",
                client.name(),
                class,
                at.saturating_duration_since(Instant::now())
            );
            let mut pending = Reservation {
                client,
                at,
                previous,
                sent: false,
            };
            tokio::time::sleep_until(at).await;
            pending.sent = true;
        }
    }

    /// 置位全局锁存，记录最近一次限频错误的时刻
    pub fn arm(&self) {
        *self.latch.lock() = Some(Instant::now());
    }

    pub fn is_armed(&self) -> bool {
        self.latch.lock().is_some()
    }

    /// ResetRateLimit：
    /// - 已置位且超过冷却期 → 清除锁存与适配器标志，返回 true
    /// - 未置位但适配器报告限频 → 置位锁存
    pub fn reset(&self, client: &OpenClient) -> bool {
        let mut latch = self.latch.lock();
        match *latch {
            Some(armed_at) => {
                if armed_at.elapsed() > self.reset_after {
                    *latch = None;
                    client.adapter().set_rate_limit_reached(false);
                    log::info!("ResetRateLimit: {} rate limit cleared", client.name());
                    true
                } else {
                    false
                }
            }
            None => {
                if client.adapter().rate_limit_reached() {
                    *latch = Some(Instant::now());
                    log::warn!("ResetRateLimit: {} rate limit reached, latch armed", client.name());
                }
                false
            }
        }
    }

    /// 记录客户端请求的 rate_limiter，返回全局最大值
    pub fn observe_rate_limiter(&self, requested: u32) -> u32 {
        self.rate_limiter.fetch_max(requested, Ordering::SeqCst).max(requested)
    }

    pub fn rate_limiter(&self) -> u32 {
        self.rate_limiter.load(Ordering::SeqCst)
    }
}
