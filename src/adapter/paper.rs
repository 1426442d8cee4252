//! 模拟盘适配器
//!
//! 完整实现 `ExchangeAdapter`，订单、成交、余额、流水都在内存中。
//! 以账户的交易所身份运行，网关里按交易所区分的分支都会被走到。
//!
//! 测试钩子：
//! - `fail_next`:              下一次 REST 调用返回指定错误
//! - `set_empty_create_reply`: 下单返回 `{}`
//! - `fill_order`:             成交并推送 executionReport
//! - `emit` / `emit_user`:     直接推送行情/用户事件

use super::events::EventRegistry;
use super::pending::{PendingOrder, PendingOrderMap};
use super::{
    split_symbol, AdapterError, AdapterFactory, AdapterResult, ExchangeAdapter, ExchangeId, NewOrder, OrderQuery,
    OrderType, Side,
};
use crate::account::Account;
use crate::utils::tasks::TaskRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// listenKey/ping 保活周期
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_PRICE: i64 = 100;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn decimal(value: &str, field: &str) -> AdapterResult<Decimal> {
    Decimal::from_str(value).map_err(|_| AdapterError::Http {
        status: 400,
        message: format!("Illegal characters found in parameter '{}'; legal range is '^([0-9]{{1,20}})(\\.[0-9]{{1,20}})?$'.", field),
    })
}

fn order_not_found() -> AdapterError {
    AdapterError::Http {
        status: 400,
        message: "Order does not exist.".to_string(),
    }
}

/// `1m` / `4h` / `1d` / `1w` → 毫秒
fn interval_ms(interval: &str) -> Option<i64> {
    let unit = interval.chars().last()?;
    let count: i64 = interval[..interval.len() - unit.len_utf8()].parse().ok()?;
    let unit_ms = match unit {
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        'w' => 604_800_000,
        _ => return None,
    };
    (count > 0).then_some(count * unit_ms)
}

// ═══════════════════════════════════════════════════════════════════════════
// 内存账本
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    order_id: i64,
    client_order_id: String,
    side: Side,
    order_type: OrderType,
    time_in_force: String,
    price: Decimal,
    orig_qty: Decimal,
    executed_qty: Decimal,
    cumm_quote_qty: Decimal,
    status: &'static str,
    time: i64,
    update_time: i64,
}

impl PaperOrder {
    fn is_open(&self) -> bool {
        matches!(self.status, "NEW" | "PARTIALLY_FILLED")
    }

    fn side_str(&self) -> &'static str {
        match self.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn type_str(&self) -> &'static str {
        match self.order_type {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "orderId": self.order_id,
            "orderListId": -1,
            "clientOrderId": self.client_order_id,
            "price": self.price.to_string(),
            "origQty": self.orig_qty.to_string(),
            "executedQty": self.executed_qty.to_string(),
            "cummulativeQuoteQty": self.cumm_quote_qty.to_string(),
            "status": self.status,
            "timeInForce": self.time_in_force,
            "type": self.type_str(),
            "side": self.side_str(),
            "stopPrice": "0.00000000",
            "icebergQty": "0.00000000",
            "time": self.time,
            "updateTime": self.update_time,
            "isWorking": true,
            "origQuoteOrderQty": "0.00000000",
        })
    }

    fn to_create_reply(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "orderId": self.order_id,
            "orderListId": -1,
            "clientOrderId": self.client_order_id,
            "transactTime": self.time,
            "price": self.price.to_string(),
            "origQty": self.orig_qty.to_string(),
            "executedQty": self.executed_qty.to_string(),
            "cummulativeQuoteQty": self.cumm_quote_qty.to_string(),
            "status": self.status,
            "timeInForce": self.time_in_force,
            "type": self.type_str(),
            "side": self.side_str(),
        })
    }

    fn to_cancel_reply(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "origClientOrderId": self.client_order_id,
            "orderId": self.order_id,
            "orderListId": -1,
            "clientOrderId": format!("cancel-{}", self.client_order_id),
            "price": self.price.to_string(),
            "origQty": self.orig_qty.to_string(),
            "executedQty": self.executed_qty.to_string(),
            "cummulativeQuoteQty": self.cumm_quote_qty.to_string(),
            "status": self.status,
            "timeInForce": self.time_in_force,
            "type": self.type_str(),
            "side": self.side_str(),
        })
    }
}

#[derive(Debug, Clone)]
struct PaperTrade {
    symbol: String,
    id: i64,
    order_id: i64,
    price: Decimal,
    qty: Decimal,
    commission_asset: String,
    time: i64,
    is_buyer: bool,
}

impl PaperTrade {
    fn to_json(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "id": self.id,
            "orderId": self.order_id,
            "orderListId": -1,
            "price": self.price.to_string(),
            "qty": self.qty.to_string(),
            "quoteQty": (self.price * self.qty).to_string(),
            "commission": "0",
            "commissionAsset": self.commission_asset,
            "time": self.time,
            "isBuyer": self.is_buyer,
            "isMaker": true,
            "isBestMatch": true,
        })
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    next_order_id: i64,
    next_trade_id: i64,
    next_txn_id: i64,
    update_id: i64,
    orders: BTreeMap<i64, PaperOrder>,
    trades: Vec<PaperTrade>,
    /// asset → (free, locked)
    balances: BTreeMap<String, (Decimal, Decimal)>,
    ledgers: VecDeque<Value>,
    prices: HashMap<String, Decimal>,
}

impl PaperBook {
    fn price(&self, symbol: &str) -> Decimal {
        self.prices.get(symbol).copied().unwrap_or_else(|| Decimal::from(DEFAULT_PRICE))
    }

    fn adjust(&mut self, asset: &str, delta: Decimal, time: i64) {
        let entry = self.balances.entry(asset.to_string()).or_default();
        entry.0 += delta;
        self.ledgers.push_back(json!({
            "e": "balanceUpdate",
            "E": time,
            "a": asset,
            "d": delta.to_string(),
            "T": time,
        }));
    }

    fn balance_rows(&self, assets: &[&str]) -> Vec<Value> {
        assets
            .iter()
            .map(|asset| {
                let (free, locked) = self.balances.get(*asset).copied().unwrap_or_default();
                json!({"a": asset, "f": free.to_string(), "l": locked.to_string()})
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 模拟盘适配器
// ═══════════════════════════════════════════════════════════════════════════

pub struct PaperExchange {
    me: Weak<PaperExchange>,
    account: Account,
    events: EventRegistry,
    tasks: Arc<TaskRegistry>,
    feed_interval: Option<Duration>,
    rate_limit_reached: AtomicBool,
    book: Mutex<PaperBook>,
    data_streams: DashMap<String, Vec<&'static str>>,
    pending: DashMap<String, PendingOrderMap>,
    account_ids: Mutex<Option<(String, String)>>,
    master: Mutex<Option<(String, String)>>,
    failures: Mutex<VecDeque<AdapterError>>,
    empty_create_reply: AtomicBool,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl PaperExchange {
    /// `feed_interval` 为 Some 时，行情监听器按周期推送当前价格
    pub fn new(account: Account, tasks: Arc<TaskRegistry>, feed_interval: Option<Duration>) -> Arc<Self> {
        let exchange = account.exchange;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            account,
            events: EventRegistry::new(exchange),
            tasks,
            feed_interval,
            rate_limit_reached: AtomicBool::new(false),
            book: Mutex::new(PaperBook {
                next_order_id: 1,
                next_trade_id: 1,
                next_txn_id: 1,
                ..Default::default()
            }),
            data_streams: DashMap::new(),
            pending: DashMap::new(),
            account_ids: Mutex::new(None),
            master: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            empty_create_reply: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn task_prefix(&self, trade_id: &str) -> String {
        format!("{}-{}-", self.account.name, trade_id)
    }

    /// 每次 REST 调用的入口：记录调用、注入失败
    fn begin(&self, call: &str) -> AdapterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Other(format!("{}: session closed", self.account.name)));
        }
        self.calls.lock().push(call.to_string());
        match self.failures.lock().pop_front() {
            Some(err) => {
                if err.is_rate_limit() {
                    self.rate_limit_reached.store(true, Ordering::SeqCst);
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn seed(&self, symbol: &str) {
        let mut book = self.book.lock();
        if let Some((base, quote)) = split_symbol(symbol) {
            book.balances.entry(base.to_string()).or_insert((Decimal::from(10), Decimal::ZERO));
            book.balances.entry(quote.to_string()).or_insert((Decimal::from(10_000), Decimal::ZERO));
        }
        book.prices.entry(symbol.to_string()).or_insert_with(|| Decimal::from(DEFAULT_PRICE));
    }

    fn paper_ids(&self) -> (String, String) {
        (format!("paper-uid-{}", self.account.name), format!("paper-{}", self.account.name))
    }

    // ---- 测试钩子 ----

    pub fn fail_next(&self, err: AdapterError) {
        self.failures.lock().push_back(err);
    }

    pub fn set_empty_create_reply(&self, empty: bool) {
        self.empty_create_reply.store(empty, Ordering::SeqCst);
    }

    pub fn set_price(&self, symbol: &str, price: &str) -> AdapterResult<()> {
        let price = decimal(price, "price")?;
        self.book.lock().prices.insert(symbol.to_string(), price);
        Ok(())
    }

    pub fn set_balance(&self, asset: &str, free: &str) -> AdapterResult<()> {
        let free = decimal(free, "free")?;
        self.book.lock().balances.insert(asset.to_string(), (free, Decimal::ZERO));
        Ok(())
    }

    pub fn push_ledger(&self, row: Value) {
        self.book.lock().ledgers.push_back(row);
    }

    /// REST 调用记录
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn pending_orders(&self, trade_id: &str) -> Vec<(i64, PendingOrder)> {
        self.pending
            .get(trade_id)
            .map(|map| {
                map.order_ids()
                    .into_iter()
                    .filter_map(|id| map.get(id).map(|o| (id, o.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn master_account(&self) -> Option<(String, String)> {
        self.master.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 推送行情事件
    pub async fn emit(&self, event_type: &str, payload: Value) -> AdapterResult<usize> {
        let event = self.events.wrap_event(&payload)?;
        Ok(self.events.dispatch(event_type, event).await)
    }

    /// 推送用户流事件
    pub async fn emit_user(&self, event_type: &str, payload: Value) -> AdapterResult<usize> {
        let event = self.events.wrap_event(&payload)?;
        Ok(self.events.dispatch_user(event_type, event).await)
    }

    /// 成交 `qty @ price`，返回成交记录
    pub async fn fill_order(&self, order_id: i64, qty: &str, price: &str) -> AdapterResult<Value> {
        let qty = decimal(qty, "qty")?;
        let price = decimal(price, "price")?;
        let time = now_ms();

        let (trade, report, position) = {
            let mut book = self.book.lock();
            let trade_id = book.next_trade_id;
            book.next_trade_id += 1;

            let order = book.orders.get_mut(&order_id).ok_or_else(order_not_found)?;
            if !order.is_open() || order.executed_qty + qty > order.orig_qty {
                return Err(AdapterError::Other(format!("order {} cannot fill {}", order_id, qty)));
            }
            order.executed_qty += qty;
            order.cumm_quote_qty += qty * price;
            order.status = if order.executed_qty == order.orig_qty {
                "FILLED"
            } else {
                "PARTIALLY_FILLED"
            };
            order.update_time = time;
            let order = order.clone();

            let (base, quote) = split_symbol(&order.symbol)
                .map(|(b, q)| (b.to_string(), q.to_string()))
                .ok_or_else(|| AdapterError::Other(format!("unknown symbol {}", order.symbol)))?;
            let (base_delta, quote_delta) = match order.side {
                Side::Buy => (qty, -(qty * price)),
                Side::Sell => (-qty, qty * price),
            };
            book.adjust(&base, base_delta, time);
            book.adjust(&quote, quote_delta, time);

            let trade = PaperTrade {
                symbol: order.symbol.clone(),
                id: trade_id,
                order_id,
                price,
                qty,
                commission_asset: quote.clone(),
                time,
                is_buyer: order.side == Side::Buy,
            };
            book.trades.push(trade.clone());

            let report = json!({
                "e": "executionReport",
                "E": time,
                "s": order.symbol,
                "c": order.client_order_id,
                "S": order.side_str(),
                "o": order.type_str(),
                "f": order.time_in_force,
                "q": order.orig_qty.to_string(),
                "p": order.price.to_string(),
                "x": "TRADE",
                "X": order.status,
                "i": order_id,
                "l": qty.to_string(),
                "z": order.executed_qty.to_string(),
                "L": price.to_string(),
                "n": "0",
                "N": quote,
                "T": time,
                "t": trade_id,
                "m": true,
                "Z": order.cumm_quote_qty.to_string(),
                "Y": (qty * price).to_string(),
            });
            let position = json!({
                "e": "outboundAccountPosition",
                "E": time,
                "u": time,
                "B": book.balance_rows(&[base.as_str(), quote.as_str()]),
            });
            (trade.to_json(), report, position)
        };

        self.emit_user("executionReport", report).await?;
        self.emit_user("outboundAccountPosition", position).await?;
        Ok(trade)
    }

    // ---- 行情推送 ----

    fn feed_payload(&self, stream: &str) -> Option<Value> {
        let (prefix, channel) = stream.split_once('@')?;
        let mut book = self.book.lock();
        let symbol = book
            .prices
            .keys()
            .find(|s| self.symbol_to_exchange(s) == prefix)
            .cloned()?;
        let price = book.price(&symbol).to_string();
        let time = now_ms();

        if channel == "miniTicker" {
            return Some(json!({
                "e": "24hrMiniTicker", "E": time, "s": symbol,
                "c": price, "o": price, "h": price, "l": price, "v": "0", "q": "0",
            }));
        }
        if channel == "depth5" {
            book.update_id += 1;
            return Some(json!({
                "lastUpdateId": book.update_id,
                "bids": [[price, "1"]],
                "asks": [[price, "1"]],
            }));
        }
        let interval = channel.strip_prefix("kline_")?;
        let step = interval_ms(interval)?;
        let open_time = time - time % step;
        Some(json!({
            "e": "kline", "E": time, "s": symbol,
            "k": {
                "t": open_time, "T": open_time + step - 1, "s": symbol, "i": interval,
                "o": price, "c": price, "h": price, "l": price, "v": "0",
                "n": 0, "x": false, "q": "0", "V": "0", "Q": "0",
            },
        }))
    }

    async fn feed_once(&self, trade_id: &str) {
        for stream in self.events.market_streams(trade_id) {
            if let Some(payload) = self.feed_payload(&stream) {
                if let Err(e) = self.emit(&stream, payload).await {
                    log::debug!("{}: feed {} failed: {}", self.account.name, stream, e);
                }
            }
        }
    }

    fn spawn_keepalive(&self, trade_id: &str, kind: &'static str) {
        let name = format!("{}{}-keepalive-heartbeat", self.task_prefix(trade_id), kind);
        let label = name.clone();
        self.tasks.spawn(name, async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                log::debug!("{}: keepalive", label);
            }
        });
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn exchange(&self) -> ExchangeId {
        self.account.exchange
    }

    fn events(&self) -> &EventRegistry {
        &self.events
    }

    fn rate_limit_reached(&self) -> bool {
        self.rate_limit_reached.load(Ordering::SeqCst)
    }

    fn set_rate_limit_reached(&self, reached: bool) {
        self.rate_limit_reached.store(reached, Ordering::SeqCst);
    }

    async fn load(&self, symbol: &str) -> AdapterResult<()> {
        self.begin("load")?;
        self.seed(symbol);
        *self.account_ids.lock() = Some(self.paper_ids());
        Ok(())
    }

    fn account_ids(&self) -> Option<(String, String)> {
        self.account_ids.lock().clone()
    }

    fn set_master_account(&self, uid: String, account_id: String) {
        *self.master.lock() = Some((uid, account_id));
    }

    async fn fetch_server_time(&self) -> AdapterResult<Value> {
        self.begin("fetch_server_time")?;
        Ok(json!({ "serverTime": now_ms() }))
    }

    async fn fetch_exchange_info(&self, symbol: &str) -> AdapterResult<Value> {
        self.begin("fetch_exchange_info")?;
        *self.account_ids.lock() = Some(self.paper_ids());
        let Some((base, quote)) = split_symbol(symbol) else {
            return Ok(json!({ "symbols": [] }));
        };
        Ok(json!({
            "timezone": "UTC",
            "serverTime": now_ms(),
            "symbols": [{
                "symbol": symbol,
                "status": "TRADING",
                "baseAsset": base,
                "baseAssetPrecision": 8,
                "quoteAsset": quote,
                "quotePrecision": 8,
                "quoteAssetPrecision": 8,
                "baseCommissionPrecision": 8,
                "quoteCommissionPrecision": 8,
                "orderTypes": ["LIMIT", "MARKET"],
                "icebergAllowed": false,
                "ocoAllowed": false,
                "quoteOrderQtyMarketAllowed": true,
                "allowTrailingStop": false,
                "cancelReplaceAllowed": false,
                "isSpotTradingAllowed": true,
                "isMarginTradingAllowed": false,
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01"},
                    {"filterType": "PERCENT_PRICE_BY_SIDE", "bidMultiplierUp": "5", "bidMultiplierDown": "0.2",
                     "askMultiplierUp": "5", "askMultiplierDown": "0.2", "avgPriceMins": 5},
                    {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000.00000", "stepSize": "0.00001"},
                    {"filterType": "NOTIONAL", "minNotional": "5.00", "applyMinToMarket": true,
                     "maxNotional": "9000000.00", "applyMaxToMarket": false, "avgPriceMins": 5},
                    {"filterType": "ICEBERG_PARTS", "limit": 10},
                    {"filterType": "MARKET_LOT_SIZE", "minQty": "0.00000", "maxQty": "100.00000", "stepSize": "0.00000"},
                    {"filterType": "MAX_NUM_ORDERS", "maxNumOrders": 200},
                    {"filterType": "MAX_NUM_ALGO_ORDERS", "maxNumAlgoOrders": 5}
                ],
                "permissions": ["SPOT"]
            }]
        }))
    }

    async fn fetch_open_orders(&self, _trade_id: &str, symbol: &str) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_open_orders")?;
        let book = self.book.lock();
        Ok(book
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.is_open())
            .map(PaperOrder::to_json)
            .collect())
    }

    async fn fetch_order(&self, _trade_id: &str, symbol: &str, query: OrderQuery) -> AdapterResult<Value> {
        self.begin("fetch_order")?;
        let book = self.book.lock();
        book.orders
            .values()
            .filter(|o| o.symbol == symbol)
            .find(|o| match &query {
                OrderQuery::OrderId(id) => o.order_id == *id,
                OrderQuery::ClientOrderId(cid) => &o.client_order_id == cid,
            })
            .map(PaperOrder::to_json)
            .ok_or_else(order_not_found)
    }

    async fn fetch_order_trade_list(&self, _trade_id: &str, symbol: &str, order_id: i64) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_order_trade_list")?;
        let book = self.book.lock();
        Ok(book
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && t.order_id == order_id)
            .map(PaperTrade::to_json)
            .collect())
    }

    async fn fetch_account_information(&self, _trade_id: &str) -> AdapterResult<Value> {
        self.begin("fetch_account_information")?;
        let book = self.book.lock();
        let balances: Vec<Value> = book
            .balances
            .iter()
            .map(|(asset, (free, locked))| {
                json!({"asset": asset, "free": free.to_string(), "locked": locked.to_string()})
            })
            .collect();
        Ok(json!({
            "canTrade": true,
            "accountType": "SPOT",
            "updateTime": now_ms(),
            "balances": balances,
        }))
    }

    async fn fetch_funding_wallet(
        &self,
        asset: &str,
        need_btc_valuation: bool,
        _receive_window: Option<u32>,
    ) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_funding_wallet")?;
        let book = self.book.lock();
        Ok(book
            .balances
            .iter()
            .filter(|(a, _)| asset.is_empty() || a.as_str() == asset)
            .map(|(a, (free, locked))| {
                json!({
                    "asset": a,
                    "free": free.to_string(),
                    "locked": locked.to_string(),
                    "freeze": "0",
                    "withdrawing": "0",
                    "btcValuation": if need_btc_valuation { "0" } else { "" },
                })
            })
            .collect())
    }

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> AdapterResult<Value> {
        self.begin("fetch_order_book")?;
        let mut book = self.book.lock();
        let price = book.price(symbol);
        let tick = Decimal::new(1, 2);
        book.update_id += 1;
        let bids: Vec<Value> = (1..=limit)
            .map(|i| json!([(price - tick * Decimal::from(i)).to_string(), "1"]))
            .collect();
        let asks: Vec<Value> = (1..=limit)
            .map(|i| json!([(price + tick * Decimal::from(i)).to_string(), "1"]))
            .collect();
        Ok(json!({ "lastUpdateId": book.update_id, "bids": bids, "asks": asks }))
    }

    async fn fetch_symbol_price_ticker(&self, symbol: &str) -> AdapterResult<Value> {
        self.begin("fetch_symbol_price_ticker")?;
        let price = self.book.lock().price(symbol);
        Ok(json!({ "symbol": symbol, "price": price.to_string() }))
    }

    async fn fetch_ticker_price_change_statistics(&self, symbol: &str) -> AdapterResult<Value> {
        self.begin("fetch_ticker_price_change_statistics")?;
        let price = self.book.lock().price(symbol).to_string();
        let now = now_ms();
        Ok(json!({
            "symbol": symbol,
            "priceChange": "0",
            "priceChangePercent": "0",
            "weightedAvgPrice": price,
            "prevClosePrice": price,
            "lastPrice": price,
            "lastQty": "0",
            "bidPrice": price,
            "bidQty": "1",
            "askPrice": price,
            "askQty": "1",
            "openPrice": price,
            "highPrice": price,
            "lowPrice": price,
            "volume": "0",
            "quoteVolume": "0",
            "openTime": now - 86_400_000,
            "closeTime": now,
            "firstId": 0,
            "lastId": 0,
            "count": 0,
        }))
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: Option<u32>) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_klines")?;
        let step = interval_ms(interval).ok_or_else(|| AdapterError::Http {
            status: 400,
            message: "Invalid interval.".to_string(),
        })?;
        let limit = i64::from(limit.unwrap_or(500).min(1000));
        let price = self.book.lock().price(symbol).to_string();
        let now = now_ms();
        let last_open = now - now % step;
        Ok((0..limit)
            .rev()
            .map(|i| {
                let open_time = last_open - i * step;
                json!([open_time, price, price, price, price, "0", open_time + step - 1, "0", 0, "0", "0", "0"])
            })
            .collect())
    }

    async fn fetch_ledgers(&self, symbol: &str) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_ledgers")?;
        let mut book = self.book.lock();
        let (matched, rest): (Vec<Value>, Vec<Value>) = book.ledgers.drain(..).partition(|row| {
            row.get("a")
                .and_then(Value::as_str)
                .map(|asset| symbol.contains(asset))
                .unwrap_or(false)
        });
        book.ledgers = rest.into();
        Ok(matched)
    }

    async fn fetch_account_trade_list(
        &self,
        _trade_id: &str,
        symbol: &str,
        start_time: Option<i64>,
        limit: Option<u32>,
    ) -> AdapterResult<Vec<Value>> {
        self.begin("fetch_account_trade_list")?;
        let book = self.book.lock();
        let limit = limit.unwrap_or(500) as usize;
        Ok(book
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && start_time.map_or(true, |start| t.time >= start))
            .take(limit)
            .map(PaperTrade::to_json)
            .collect())
    }

    async fn create_order(&self, _trade_id: &str, order: NewOrder) -> AdapterResult<Value> {
        self.begin("create_order")?;
        let quantity = decimal(&order.quantity, "quantity")?;
        let price = decimal(&order.price, "price")?;
        if quantity <= Decimal::ZERO {
            return Err(AdapterError::Http {
                status: 400,
                message: "Invalid quantity.".to_string(),
            });
        }

        let (placed, market_fill) = {
            let mut book = self.book.lock();
            let order_id = book.next_order_id;
            book.next_order_id += 1;
            let time = now_ms();
            let market_fill = (order.order_type == OrderType::Market).then(|| book.price(&order.symbol));
            let placed = PaperOrder {
                symbol: order.symbol.clone(),
                order_id,
                client_order_id: order.new_client_order_id.clone(),
                side: order.side,
                order_type: order.order_type,
                time_in_force: format!("{:?}", order.time_in_force).to_uppercase(),
                price: market_fill.unwrap_or(price),
                orig_qty: quantity,
                executed_qty: Decimal::ZERO,
                cumm_quote_qty: Decimal::ZERO,
                status: "NEW",
                time,
                update_time: time,
            };
            book.orders.insert(order_id, placed.clone());
            (placed, market_fill)
        };

        let reply = match market_fill {
            Some(fill_price) => {
                self.fill_order(placed.order_id, &quantity.to_string(), &fill_price.to_string())
                    .await?;
                let book = self.book.lock();
                book.orders
                    .get(&placed.order_id)
                    .map(PaperOrder::to_create_reply)
                    .ok_or_else(order_not_found)?
            }
            None => placed.to_create_reply(),
        };

        if self.empty_create_reply.load(Ordering::SeqCst) {
            return Ok(json!({}));
        }
        Ok(reply)
    }

    async fn cancel_order(&self, _trade_id: &str, symbol: &str, order_id: i64) -> AdapterResult<Value> {
        self.begin("cancel_order")?;
        let mut book = self.book.lock();
        let order = book
            .orders
            .get_mut(&order_id)
            .filter(|o| o.symbol == symbol)
            .ok_or_else(order_not_found)?;
        if !order.is_open() {
            return Err(AdapterError::Http {
                status: 400,
                message: "Unknown order sent.".to_string(),
            });
        }
        order.status = "CANCELED";
        order.update_time = now_ms();
        Ok(order.to_cancel_reply())
    }

    async fn cancel_all_orders(&self, _trade_id: &str, symbol: &str) -> AdapterResult<Value> {
        self.begin("cancel_all_orders")?;
        let mut book = self.book.lock();
        let time = now_ms();
        let canceled: Vec<Value> = book
            .orders
            .values_mut()
            .filter(|o| o.symbol == symbol && o.is_open())
            .map(|o| {
                o.status = "CANCELED";
                o.update_time = time;
                o.to_cancel_reply()
            })
            .collect();
        Ok(Value::Array(canceled))
    }

    async fn transfer_to_master(&self, symbol: &str, quantity: &str) -> AdapterResult<Value> {
        self.begin("transfer_to_master")?;
        if self.master.lock().is_none() {
            return Err(AdapterError::Http {
                status: 400,
                message: format!("{} is not a sub-account", self.account.name),
            });
        }
        let amount = decimal(quantity, "amount")?;
        let mut book = self.book.lock();
        let (free, _) = book.balances.get(symbol).copied().unwrap_or_default();
        if free < amount {
            return Err(AdapterError::Http {
                status: 400,
                message: "Balance is not enough".to_string(),
            });
        }
        book.adjust(symbol, -amount, now_ms());
        let txn_id = book.next_txn_id;
        book.next_txn_id += 1;
        Ok(json!({ "txnId": txn_id }))
    }

    async fn one_click_arrival_deposit(&self, tx_id: &str) -> AdapterResult<Value> {
        self.begin("one_click_arrival_deposit")?;
        Ok(json!({ "txId": tx_id, "status": "SUCCESS" }))
    }

    async fn start_market_events_listener(&self, trade_id: &str) -> AdapterResult<()> {
        self.begin("start_market_events_listener")?;
        self.data_streams.entry(trade_id.to_string()).or_default().push("market");
        self.spawn_keepalive(trade_id, "market");

        if let Some(period) = self.feed_interval {
            let me = self.me.clone();
            let trade_id = trade_id.to_string();
            self.tasks.spawn(format!("{}market-feed", self.task_prefix(&trade_id)), async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let Some(exchange) = me.upgrade() else { break };
                    if exchange.is_closed() {
                        break;
                    }
                    exchange.feed_once(&trade_id).await;
                }
            });
        }
        log::info!("{}: market listener started for {}", self.account.name, trade_id);
        Ok(())
    }

    async fn start_user_events_listener(&self, trade_id: &str, symbol: &str) -> AdapterResult<()> {
        self.begin("start_user_events_listener")?;
        self.data_streams.entry(trade_id.to_string()).or_default().push("user");
        self.spawn_keepalive(trade_id, "user");
        log::info!("{}: user listener started for {}:{}", self.account.name, trade_id, symbol);
        Ok(())
    }

    async fn stop_events_listener(&self, trade_id: &str) -> AdapterResult<()> {
        self.data_streams.remove(trade_id);
        let prefix = self.task_prefix(trade_id);
        let stopped = self.tasks.abort_where(|name| name.starts_with(&prefix));
        log::info!("{}: stopped {} listener task(s) for {}", self.account.name, stopped, trade_id);
        Ok(())
    }

    fn has_data_streams(&self, trade_id: &str) -> bool {
        self.data_streams.get(trade_id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    fn active_order(&self, trade_id: &str, order_id: i64, orig_qty: &str, executed_qty: &str) {
        self.pending
            .entry(trade_id.to_string())
            .or_default()
            .record(order_id, orig_qty, executed_qty);
    }

    fn active_orders_clear(&self, trade_id: &str) {
        if let Some(mut map) = self.pending.get_mut(trade_id) {
            map.clear_stale();
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.data_streams.clear();
        let prefix = format!("{}-", self.account.name);
        self.tasks.abort_where(|name| name.starts_with(&prefix));
        log::info!("{}: paper session closed", self.account.name);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 工厂
// ═══════════════════════════════════════════════════════════════════════════

pub struct PaperFactory {
    tasks: Arc<TaskRegistry>,
    feed_interval: Option<Duration>,
    instances: DashMap<String, Arc<PaperExchange>>,
}

impl PaperFactory {
    pub fn new(tasks: Arc<TaskRegistry>, feed_interval: Option<Duration>) -> Self {
        Self {
            tasks,
            feed_interval,
            instances: DashMap::new(),
        }
    }

    /// 最近为该账户创建的实例
    pub fn instance(&self, account_name: &str) -> Option<Arc<PaperExchange>> {
        self.instances.get(account_name).map(|e| e.value().clone())
    }

    pub fn created(&self) -> usize {
        self.instances.len()
    }
}

impl AdapterFactory for PaperFactory {
    fn create(&self, account: &Account) -> AdapterResult<Arc<dyn ExchangeAdapter>> {
        let exchange = PaperExchange::new(account.clone(), self.tasks.clone(), self.feed_interval);
        self.instances.insert(account.name.clone(), exchange.clone());
        Ok(exchange as Arc<dyn ExchangeAdapter>)
    }
}
