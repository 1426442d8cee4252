//! 事件注册表
//!
//! 适配器收到 WS 消息后先 `wrap_event` 成 `StreamEvent`，再按事件类型
//! (`btcusdt@depth5`、`executionReport` ...) 分发给注册的处理器。
//! 处理器按 trade_id 归组，`unregister` 一次移除某个 trade_id 的全部注册。

use super::{AdapterError, AdapterResult, ExchangeId};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// 事件处理器
pub type EventHandler = Arc<dyn Fn(StreamEvent) -> BoxFuture<'static, ()> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════
// 事件类型
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type")]
pub enum StreamEvent {
    #[serde(rename = "kline")]
    Kline(KlineEvent),
    #[serde(rename = "24hrMiniTicker")]
    MiniTicker(MiniTickerEvent),
    #[serde(rename = "depthSnapshot")]
    OrderBook(OrderBookEvent),
    #[serde(rename = "outboundAccountPosition")]
    AccountPosition(AccountPositionEvent),
    #[serde(rename = "balanceUpdate")]
    BalanceUpdate(BalanceUpdateEvent),
    #[serde(rename = "executionReport")]
    ExecutionReport(ExecutionReportEvent),
    /// 由成交列表合成，格式与 executionReport 一致
    #[serde(rename = "executionReport")]
    OrderTrades(OrderTradesEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KlineEvent {
    pub symbol: String,
    pub event_time: i64,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub quote_volume: String,
    pub trades: i64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
    pub is_closed: bool,
}

impl KlineEvent {
    /// 12 字段 K 线数组 (与 REST klines 行格式一致)
    pub fn candle(&self) -> Value {
        serde_json::json!([
            self.open_time,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.close_time,
            self.quote_volume,
            self.trades,
            self.taker_buy_base_volume,
            self.taker_buy_quote_volume,
            "0"
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiniTickerEvent {
    pub symbol: String,
    pub event_time: i64,
    pub open_price: String,
    pub close_price: String,
    pub high_price: String,
    pub low_price: String,
    pub base_volume: String,
    pub quote_volume: String,
}

/// `[price, qty]`
pub type Level = (String, String);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookEvent {
    pub last_update_id: i64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetBalance {
    pub free: String,
    pub locked: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountPositionEvent {
    pub event_time: i64,
    pub last_update_time: i64,
    pub balances: BTreeMap<String, AssetBalance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceUpdateEvent {
    pub event_time: i64,
    pub asset: String,
    pub balance_delta: String,
    pub clear_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReportEvent {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTradesEvent {
    pub symbol: String,
    pub client_order_id: String,
    pub side: String,
    pub order_price: String,
    pub order_quantity: String,
    pub order_status: String,
    pub order_id: i64,
    pub trade_id: i64,
    pub last_executed_quantity: String,
    pub last_executed_price: String,
    pub cumulative_filled_quantity: String,
    pub cumulative_quote_asset_transacted_quantity: String,
    pub quote_asset_transacted: String,
    pub commission_amount: String,
    pub commission_asset: String,
    pub transaction_time: i64,
    pub is_maker_side: bool,
}

// ---- JSON 取值 (交易所数值可能是字符串也可能是数字) ----

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(v) => v.to_string(),
    }
}

fn int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn levels(value: Option<&Value>) -> AdapterResult<Vec<Level>> {
    let rows = value
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Other("order book side is not an array".to_string()))?;
    rows.iter()
        .map(|row| match row.as_array().map(Vec::as_slice) {
            Some([price, qty, ..]) => Ok((text(Some(price)), text(Some(qty)))),
            _ => Err(AdapterError::Other(format!("malformed order book level {}", row))),
        })
        .collect()
}

impl OrderTradesEvent {
    /// 成交记录 (已合并订单字段 clientOrderId/orderPrice/origQty/...) → 事件
    pub fn from_trade(trade: &Map<String, Value>) -> Self {
        Self {
            symbol: text(trade.get("symbol")),
            client_order_id: text(trade.get("clientOrderId")),
            side: if flag(trade.get("isBuyer")) { "BUY" } else { "SELL" }.to_string(),
            order_price: text(trade.get("orderPrice")),
            order_quantity: text(trade.get("origQty")),
            order_status: text(trade.get("status")),
            order_id: int(trade.get("orderId")),
            trade_id: int(trade.get("id")),
            last_executed_quantity: text(trade.get("qty")),
            last_executed_price: text(trade.get("price")),
            cumulative_filled_quantity: text(trade.get("executedQty")),
            cumulative_quote_asset_transacted_quantity: text(trade.get("cummulativeQuoteQty")),
            quote_asset_transacted: text(trade.get("quoteQty")),
            commission_amount: text(trade.get("commission")),
            commission_asset: text(trade.get("commissionAsset")),
            transaction_time: int(trade.get("time")),
            is_maker_side: flag(trade.get("isMaker")),
        }
    }
}

impl StreamEvent {
    /// Binance 格式 WS 消息 → 事件
    pub fn from_payload(payload: &Value) -> AdapterResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| AdapterError::Other(format!("event payload is not an object: {}", payload)))?;

        if obj.contains_key("lastUpdateId") {
            return Ok(StreamEvent::OrderBook(OrderBookEvent {
                last_update_id: int(obj.get("lastUpdateId")),
                bids: levels(obj.get("bids"))?,
                asks: levels(obj.get("asks"))?,
            }));
        }

        match obj.get("e").and_then(Value::as_str) {
            Some("kline") => {
                let k = obj
                    .get("k")
                    .and_then(Value::as_object)
                    .ok_or_else(|| AdapterError::Other("kline event without 'k'".to_string()))?;
                Ok(StreamEvent::Kline(KlineEvent {
                    symbol: text(obj.get("s")),
                    event_time: int(obj.get("E")),
                    interval: text(k.get("i")),
                    open_time: int(k.get("t")),
                    close_time: int(k.get("T")),
                    open: text(k.get("o")),
                    high: text(k.get("h")),
                    low: text(k.get("l")),
                    close: text(k.get("c")),
                    volume: text(k.get("v")),
                    quote_volume: text(k.get("q")),
                    trades: int(k.get("n")),
                    taker_buy_base_volume: text(k.get("V")),
                    taker_buy_quote_volume: text(k.get("Q")),
                    is_closed: flag(k.get("x")),
                }))
            }
            Some("24hrMiniTicker") => Ok(StreamEvent::MiniTicker(MiniTickerEvent {
                symbol: text(obj.get("s")),
                event_time: int(obj.get("E")),
                open_price: text(obj.get("o")),
                close_price: text(obj.get("c")),
                high_price: text(obj.get("h")),
                low_price: text(obj.get("l")),
                base_volume: text(obj.get("v")),
                quote_volume: text(obj.get("q")),
            })),
            Some("outboundAccountPosition") => {
                let balances = obj
                    .get("B")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .map(|b| {
                                (
                                    text(b.get("a")),
                                    AssetBalance {
                                        free: text(b.get("f")),
                                        locked: text(b.get("l")),
                                    },
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(StreamEvent::AccountPosition(AccountPositionEvent {
                    event_time: int(obj.get("E")),
                    last_update_time: int(obj.get("u")),
                    balances,
                }))
            }
            Some("balanceUpdate") => Ok(StreamEvent::BalanceUpdate(BalanceUpdateEvent {
                event_time: int(obj.get("E")),
                asset: text(obj.get("a")),
                balance_delta: text(obj.get("d")),
                clear_time: int(obj.get("T")),
            })),
            Some("executionReport") => Ok(StreamEvent::ExecutionReport(ExecutionReportEvent { fields: obj.clone() })),
            other => Err(AdapterError::Unsupported(format!("event type {:?}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 注册表
// ═══════════════════════════════════════════════════════════════════════════

struct Registration {
    exchange: ExchangeId,
    trade_id: String,
    handler: EventHandler,
}

/// event_type → 注册列表
type Registrations = HashMap<String, Vec<Registration>>;

pub struct EventRegistry {
    exchange: ExchangeId,
    market: RwLock<Registrations>,
    user: RwLock<Registrations>,
}

impl EventRegistry {
    pub fn new(exchange: ExchangeId) -> Self {
        Self {
            exchange,
            market: RwLock::new(HashMap::new()),
            user: RwLock::new(HashMap::new()),
        }
    }

    pub fn wrap_event(&self, payload: &Value) -> AdapterResult<StreamEvent> {
        StreamEvent::from_payload(payload)
    }

    /// 注册行情事件处理器
    pub fn register_event(&self, handler: EventHandler, event_type: &str, exchange: ExchangeId, trade_id: &str) {
        self.market.write().entry(event_type.to_string()).or_default().push(Registration {
            exchange,
            trade_id: trade_id.to_string(),
            handler,
        });
    }

    /// 注册用户流事件处理器
    pub fn register_user_event(&self, handler: EventHandler, event_type: &str, trade_id: &str) {
        self.user.write().entry(event_type.to_string()).or_default().push(Registration {
            exchange: self.exchange,
            trade_id: trade_id.to_string(),
            handler,
        });
    }

    /// 移除 trade_id 的全部注册，返回移除数量
    pub fn unregister(&self, exchange: ExchangeId, trade_id: &str) -> usize {
        let mut removed = 0;
        for table in [&self.market, &self.user] {
            let mut table = table.write();
            for regs in table.values_mut() {
                let before = regs.len();
                regs.retain(|r| !(r.exchange == exchange && r.trade_id == trade_id));
                removed += before - regs.len();
            }
            table.retain(|_, regs| !regs.is_empty());
        }
        removed
    }

    fn handlers(table: &RwLock<Registrations>, event_type: &str) -> Vec<EventHandler> {
        table
            .read()
            .get(event_type)
            .map(|regs| regs.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    async fn deliver(handlers: Vec<EventHandler>, event: StreamEvent) -> usize {
        let count = handlers.len();
        for handler in handlers {
            handler(event.clone()).await;
        }
        count
    }

    /// 分发行情事件，返回调用的处理器数量
    pub async fn dispatch(&self, event_type: &str, event: StreamEvent) -> usize {
        Self::deliver(Self::handlers(&self.market, event_type), event).await
    }

    /// 分发用户流事件
    pub async fn dispatch_user(&self, event_type: &str, event: StreamEvent) -> usize {
        Self::deliver(Self::handlers(&self.user, event_type), event).await
    }

    /// trade_id 已注册的行情流数量
    pub fn registered_stream_count(&self, trade_id: &str) -> usize {
        self.market
            .read()
            .values()
            .map(|regs| regs.iter().filter(|r| r.trade_id == trade_id).count())
            .sum()
    }

    /// trade_id 订阅的行情事件类型
    pub fn market_streams(&self, trade_id: &str) -> Vec<String> {
        let mut streams: Vec<String> = self
            .market
            .read()
            .iter()
            .filter(|(_, regs)| regs.iter().any(|r| r.trade_id == trade_id))
            .map(|(event_type, _)| event_type.clone())
            .collect();
        streams.sort();
        streams
    }

    /// trade_id 是否还有任何注册
    pub fn has_registrations(&self, trade_id: &str) -> bool {
        [&self.market, &self.user]
            .iter()
            .any(|table| table.read().values().any(|regs| regs.iter().any(|r| r.trade_id == trade_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (EventHandler, Arc<Mutex<Vec<StreamEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |event| {
            let sink = sink.clone();
            async move { sink.lock().push(event) }.boxed()
        });
        (handler, seen)
    }

    #[test]
    fn test_wrap_kline() {
        let event = StreamEvent::from_payload(&json!({
            "e": "kline", "E": 1700000000100i64, "s": "BTCUSDT",
            "k": {"t": 1700000000000i64, "T": 1700000059999i64, "s": "BTCUSDT", "i": "1m",
                  "o": "100.0", "c": "101.0", "h": "102.0", "l": "99.0", "v": "10",
                  "n": 42, "x": false, "q": "1005.0", "V": "4", "Q": "402.0"}
        }))
        .unwrap();

        let StreamEvent::Kline(kline) = event else { panic!("expected kline") };
        assert_eq!(kline.interval, "1m");
        assert_eq!(
            kline.candle(),
            json!([1700000000000i64, "100.0", "102.0", "99.0", "101.0", "10", 1700000059999i64,
                   "1005.0", 42, "4", "402.0", "0"])
        );
    }

    #[test]
    fn test_wrap_depth_snapshot() {
        let event = StreamEvent::from_payload(&json!({
            "lastUpdateId": 7, "bids": [["100.0", "1.5"]], "asks": [["101.0", "2"], ["102", 3]]
        }))
        .unwrap();

        let StreamEvent::OrderBook(book) = event else { panic!("expected order book") };
        assert_eq!(book.last_update_id, 7);
        assert_eq!(book.bids, vec![("100.0".to_string(), "1.5".to_string())]);
        assert_eq!(book.asks[1], ("102".to_string(), "3".to_string()));
    }

    #[test]
    fn test_wrap_account_position_and_unknown() {
        let event = StreamEvent::from_payload(&json!({
            "e": "outboundAccountPosition", "E": 1, "u": 2,
            "B": [{"a": "BTC", "f": "1.0", "l": "0.5"}]
        }))
        .unwrap();
        let StreamEvent::AccountPosition(pos) = event else { panic!("expected position") };
        assert_eq!(pos.balances["BTC"].locked, "0.5");

        assert!(StreamEvent::from_payload(&json!({"e": "aggTrade"})).is_err());
        assert!(StreamEvent::from_payload(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_order_trades_serializes_as_execution_report() {
        let mut trade = Map::new();
        trade.insert("symbol".into(), json!("BTCUSDT"));
        trade.insert("id".into(), json!(11));
        trade.insert("orderId".into(), json!(5));
        trade.insert("isBuyer".into(), json!(true));
        trade.insert("qty".into(), json!("0.5"));
        let event = StreamEvent::OrderTrades(OrderTradesEvent::from_trade(&trade));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "executionReport");
        assert_eq!(value["side"], "BUY");
        assert_eq!(value["trade_id"], 11);
        assert_eq!(value["last_executed_quantity"], "0.5");
    }

    #[tokio::test]
    async fn test_dispatch_and_unregister() {
        let registry = EventRegistry::new(ExchangeId::Binance);
        let (h1, seen1) = recorder();
        let (h2, seen2) = recorder();
        registry.register_event(h1, "btcusdt@miniTicker", ExchangeId::Binance, "t1");
        registry.register_event(h2, "btcusdt@miniTicker", ExchangeId::Binance, "t2");

        let event = StreamEvent::BalanceUpdate(BalanceUpdateEvent {
            event_time: 1,
            asset: "BTC".into(),
            balance_delta: "1".into(),
            clear_time: 2,
        });
        assert_eq!(registry.dispatch("btcusdt@miniTicker", event.clone()).await, 2);
        assert_eq!(registry.registered_stream_count("t1"), 1);

        assert_eq!(registry.unregister(ExchangeId::Binance, "t1"), 1);
        assert_eq!(registry.dispatch("btcusdt@miniTicker", event).await, 1);
        assert_eq!(seen1.lock().len(), 1);
        assert_eq!(seen2.lock().len(), 2);
        assert!(!registry.has_registrations("t1"));
        assert_eq!(registry.market_streams("t2"), vec!["btcusdt@miniTicker".to_string()]);
    }

    #[tokio::test]
    async fn test_user_events_are_separate() {
        let registry = EventRegistry::new(ExchangeId::Okx);
        let (h, seen) = recorder();
        registry.register_user_event(h, "executionReport", "t1");

        assert_eq!(registry.registered_stream_count("t1"), 0);
        assert!(registry.has_registrations("t1"));

        let event = registry
            .wrap_event(&json!({"e": "executionReport", "s": "BTCUSDT", "i": 1}))
            .unwrap();
        assert_eq!(registry.dispatch("executionReport", event.clone()).await, 0);
        assert_eq!(registry.dispatch_user("executionReport", event).await, 1);
        assert_eq!(seen.lock().len(), 1);
    }
}
