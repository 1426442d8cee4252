//! 适配器 JSON → gRPC 消息
//!
//! 交易所返回的数值字段可能是字符串也可能是数字，这里统一宽松读取：
//! 缺失或类型不符时取默认值。

use super::grpc::proto;
use super::grpc::proto::fetch_exchange_info_symbol_response::filters;
use crate::adapter::events::{BalanceUpdateEvent, KlineEvent, MiniTickerEvent, OrderBookEvent};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════
// 取值
// ═══════════════════════════════════════════════════════════════════════════

pub fn text(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn int(v: &Value, key: &str) -> i64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

pub fn uint(v: &Value, key: &str) -> u32 {
    u32::try_from(int(v, key)).unwrap_or_default()
}

pub fn flag(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

pub fn strings(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn is_nonzero(v: &Value, key: &str) -> bool {
    Decimal::from_str(&text(v, key)).map(|d| !d.is_zero()).unwrap_or(false)
}

/// 数组中每个元素编码为 JSON 字符串
fn json_rows(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|rows| rows.iter().map(Value::to_string).collect())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════
// 订单
// ═══════════════════════════════════════════════════════════════════════════

macro_rules! order_message {
    ($ty:ty, $v:expr) => {{
        let v = $v;
        <$ty>::from_json_fields(v)
    }};
}

trait FromOrderJson: Sized {
    fn from_json_fields(v: &Value) -> Self;
}

macro_rules! impl_order_json {
    ($ty:ty) => {
        impl FromOrderJson for $ty {
            fn from_json_fields(v: &Value) -> Self {
                Self {
                    symbol: text(v, "symbol"),
                    order_id: int(v, "orderId"),
                    order_list_id: int(v, "orderListId"),
                    client_order_id: text(v, "clientOrderId"),
                    price: text(v, "price"),
                    orig_qty: text(v, "origQty"),
                    executed_qty: text(v, "executedQty"),
                    cummulative_quote_qty: text(v, "cummulativeQuoteQty"),
                    status: text(v, "status"),
                    time_in_force: text(v, "timeInForce"),
                    r#type: text(v, "type"),
                    side: text(v, "side"),
                    stop_price: text(v, "stopPrice"),
                    iceberg_qty: text(v, "icebergQty"),
                    time: int(v, "time"),
                    update_time: int(v, "updateTime"),
                    is_working: flag(v, "isWorking"),
                    orig_quote_order_qty: text(v, "origQuoteOrderQty"),
                }
            }
        }
    };
}

impl_order_json!(proto::fetch_open_orders_response::Order);
impl_order_json!(proto::FetchOrderResponse);

pub fn open_order(v: &Value) -> proto::fetch_open_orders_response::Order {
    order_message!(proto::fetch_open_orders_response::Order, v)
}

pub fn order(v: &Value) -> proto::FetchOrderResponse {
    order_message!(proto::FetchOrderResponse, v)
}

pub fn create_order(v: &Value) -> proto::CreateLimitOrderResponse {
    proto::CreateLimitOrderResponse {
        symbol: text(v, "symbol"),
        order_id: int(v, "orderId"),
        order_list_id: int(v, "orderListId"),
        client_order_id: text(v, "clientOrderId"),
        transact_time: int(v, "transactTime"),
        price: text(v, "price"),
        orig_qty: text(v, "origQty"),
        executed_qty: text(v, "executedQty"),
        cummulative_quote_qty: text(v, "cummulativeQuoteQty"),
        status: text(v, "status"),
        time_in_force: text(v, "timeInForce"),
        r#type: text(v, "type"),
        side: text(v, "side"),
    }
}

pub fn cancel_order(v: &Value) -> proto::CancelOrderResponse {
    proto::CancelOrderResponse {
        symbol: text(v, "symbol"),
        orig_client_order_id: text(v, "origClientOrderId"),
        order_id: int(v, "orderId"),
        order_list_id: int(v, "orderListId"),
        client_order_id: text(v, "clientOrderId"),
        price: text(v, "price"),
        orig_qty: text(v, "origQty"),
        executed_qty: text(v, "executedQty"),
        cummulative_quote_qty: text(v, "cummulativeQuoteQty"),
        status: text(v, "status"),
        time_in_force: text(v, "timeInForce"),
        r#type: text(v, "type"),
        side: text(v, "side"),
    }
}

/// 下单应答为空 (`null` / `{}` / `[]`)
pub fn is_empty_reply(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub fn trade(v: &Value) -> proto::account_trade_list_response::Trade {
    proto::account_trade_list_response::Trade {
        symbol: text(v, "symbol"),
        id: int(v, "id"),
        order_id: int(v, "orderId"),
        order_list_id: int(v, "orderListId"),
        price: text(v, "price"),
        qty: text(v, "qty"),
        quote_qty: text(v, "quoteQty"),
        commission: text(v, "commission"),
        commission_asset: text(v, "commissionAsset"),
        time: int(v, "time"),
        is_buyer: flag(v, "isBuyer"),
        is_maker: flag(v, "isMaker"),
        is_best_match: flag(v, "isBestMatch"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 交易规则
// ═══════════════════════════════════════════════════════════════════════════

/// 过滤器列表 → 类型化过滤器集合
///
/// `PERCENT_PRICE_BY_SIDE` 映射为统一的 multiplierUp (= ask) / multiplierDown (= bid)。
pub fn symbol_filters(list: &[Value]) -> proto::fetch_exchange_info_symbol_response::Filters {
    let mut out = proto::fetch_exchange_info_symbol_response::Filters::default();
    for f in list {
        let filter_type = text(f, "filterType");
        match filter_type.as_str() {
            "PRICE_FILTER" => {
                out.price_filter = Some(filters::PriceFilter {
                    filter_type,
                    min_price: text(f, "minPrice"),
                    max_price: text(f, "maxPrice"),
                    tick_size: text(f, "tickSize"),
                })
            }
            "PERCENT_PRICE" => {
                out.percent_price = Some(filters::PercentPrice {
                    filter_type,
                    multiplier_up: text(f, "multiplierUp"),
                    multiplier_down: text(f, "multiplierDown"),
                    avg_price_mins: uint(f, "avgPriceMins"),
                })
            }
            "PERCENT_PRICE_BY_SIDE" => {
                out.percent_price = Some(filters::PercentPrice {
                    filter_type,
                    multiplier_up: text(f, "askMultiplierUp"),
                    multiplier_down: text(f, "bidMultiplierDown"),
                    avg_price_mins: uint(f, "avgPriceMins"),
                })
            }
            "LOT_SIZE" => {
                out.lot_size = Some(filters::LotSize {
                    filter_type,
                    min_qty: text(f, "minQty"),
                    max_qty: text(f, "maxQty"),
                    step_size: text(f, "stepSize"),
                })
            }
            "MIN_NOTIONAL" => {
                out.min_notional = Some(filters::MinNotional {
                    filter_type,
                    min_notional: text(f, "minNotional"),
                    apply_to_market: flag(f, "applyToMarket"),
                    avg_price_mins: uint(f, "avgPriceMins"),
                })
            }
            "NOTIONAL" => {
                out.notional = Some(filters::Notional {
                    filter_type,
                    min_notional: text(f, "minNotional"),
                    apply_min_to_market: flag(f, "applyMinToMarket"),
                    max_notional: text(f, "maxNotional"),
                    apply_max_to_market: flag(f, "applyMaxToMarket"),
                    avg_price_mins: uint(f, "avgPriceMins"),
                })
            }
            "ICEBERG_PARTS" => {
                out.iceberg_parts = Some(filters::IcebergParts {
                    filter_type,
                    limit: uint(f, "limit"),
                })
            }
            "MARKET_LOT_SIZE" => {
                out.market_lot_size = Some(filters::MarketLotSize {
                    filter_type,
                    min_qty: text(f, "minQty"),
                    max_qty: text(f, "maxQty"),
                    step_size: text(f, "stepSize"),
                })
            }
            "MAX_NUM_ORDERS" => {
                out.max_num_orders = Some(filters::MaxNumOrders {
                    filter_type,
                    max_num_orders: uint(f, "maxNumOrders"),
                })
            }
            "MAX_NUM_ICEBERG_ORDERS" => {
                out.max_num_iceberg_orders = Some(filters::MaxNumIcebergOrders {
                    filter_type,
                    max_num_iceberg_orders: uint(f, "maxNumIcebergOrders"),
                })
            }
            "MAX_POSITION" => {
                out.max_position = Some(filters::MaxPosition {
                    filter_type,
                    max_position: text(f, "maxPosition"),
                })
            }
            _ => {}
        }
    }
    out
}

/// exchangeInfo 的第一个交易对；没有交易对时返回 None
pub fn exchange_info_symbol(info: &Value) -> Option<proto::FetchExchangeInfoSymbolResponse> {
    let s = info.get("symbols")?.as_array()?.first()?;
    let filter_list = s.get("filters").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
    Some(proto::FetchExchangeInfoSymbolResponse {
        symbol: text(s, "symbol"),
        status: text(s, "status"),
        base_asset: text(s, "baseAsset"),
        base_asset_precision: uint(s, "baseAssetPrecision"),
        quote_asset: text(s, "quoteAsset"),
        quote_precision: uint(s, "quotePrecision"),
        quote_asset_precision: uint(s, "quoteAssetPrecision"),
        base_commission_precision: uint(s, "baseCommissionPrecision"),
        quote_commission_precision: uint(s, "quoteCommissionPrecision"),
        order_types: strings(s, "orderTypes"),
        iceberg_allowed: flag(s, "icebergAllowed"),
        oco_allowed: flag(s, "ocoAllowed"),
        quote_order_qty_market_allowed: flag(s, "quoteOrderQtyMarketAllowed"),
        allow_trailing_stop: flag(s, "allowTrailingStop"),
        cancel_replace_allowed: flag(s, "cancelReplaceAllowed"),
        is_spot_trading_allowed: flag(s, "isSpotTradingAllowed"),
        is_margin_trading_allowed: flag(s, "isMarginTradingAllowed"),
        filters: Some(symbol_filters(filter_list)),
        permissions: strings(s, "permissions"),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// 账户
// ═══════════════════════════════════════════════════════════════════════════

/// 仅保留 free 或 locked 非零的余额
pub fn account_balances(info: &Value) -> Vec<proto::fetch_account_balance_response::Balances> {
    info.get("balances")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter(|b| is_nonzero(b, "free") || is_nonzero(b, "locked"))
                .map(|b| proto::fetch_account_balance_response::Balances {
                    asset: text(b, "asset"),
                    free: text(b, "free"),
                    locked: text(b, "locked"),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn funding_balance(v: &Value) -> proto::fetch_funding_wallet_response::Balances {
    proto::fetch_funding_wallet_response::Balances {
        asset: text(v, "asset"),
        free: text(v, "free"),
        locked: text(v, "locked"),
        freeze: text(v, "freeze"),
        withdrawing: text(v, "withdrawing"),
        btc_valuation: text(v, "btcValuation"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 行情
// ═══════════════════════════════════════════════════════════════════════════

pub fn order_book(v: &Value) -> proto::FetchOrderBookResponse {
    proto::FetchOrderBookResponse {
        last_update_id: int(v, "lastUpdateId"),
        bids: json_rows(v.get("bids")),
        asks: json_rows(v.get("asks")),
    }
}

pub fn order_book_event(ev: &OrderBookEvent) -> proto::FetchOrderBookResponse {
    let level = |(price, qty): &(String, String)| serde_json::json!([price, qty]).to_string();
    proto::FetchOrderBookResponse {
        last_update_id: ev.last_update_id,
        bids: ev.bids.iter().map(level).collect(),
        asks: ev.asks.iter().map(level).collect(),
    }
}

pub fn price_ticker(v: &Value) -> proto::FetchSymbolPriceTickerResponse {
    proto::FetchSymbolPriceTickerResponse {
        symbol: text(v, "symbol"),
        price: text(v, "price"),
    }
}

pub fn ticker_statistics(v: &Value) -> proto::FetchTickerPriceChangeStatisticsResponse {
    proto::FetchTickerPriceChangeStatisticsResponse {
        symbol: text(v, "symbol"),
        price_change: text(v, "priceChange"),
        price_change_percent: text(v, "priceChangePercent"),
        weighted_avg_price: text(v, "weightedAvgPrice"),
        prev_close_price: text(v, "prevClosePrice"),
        last_price: text(v, "lastPrice"),
        last_qty: text(v, "lastQty"),
        bid_price: text(v, "bidPrice"),
        bid_qty: text(v, "bidQty"),
        ask_price: text(v, "askPrice"),
        ask_qty: text(v, "askQty"),
        open_price: text(v, "openPrice"),
        high_price: text(v, "highPrice"),
        low_price: text(v, "lowPrice"),
        volume: text(v, "volume"),
        quote_volume: text(v, "quoteVolume"),
        open_time: int(v, "openTime"),
        close_time: int(v, "closeTime"),
        first_id: int(v, "firstId"),
        last_id: int(v, "lastId"),
        count: int(v, "count"),
    }
}

pub fn klines(rows: &[Value]) -> Vec<String> {
    rows.iter().map(Value::to_string).collect()
}

pub fn kline_event(ev: &KlineEvent) -> proto::OnKlinesUpdateResponse {
    proto::OnKlinesUpdateResponse {
        symbol: ev.symbol.clone(),
        interval: ev.interval.clone(),
        candle: ev.candle().to_string(),
    }
}

pub fn ticker_event(ev: &MiniTickerEvent) -> proto::OnTickerUpdateResponse {
    proto::OnTickerUpdateResponse {
        symbol: ev.symbol.clone(),
        open_price: ev.open_price.clone(),
        close_price: ev.close_price.clone(),
        event_time: ev.event_time,
    }
}

pub fn balance_event(ev: &BalanceUpdateEvent) -> proto::OnBalanceUpdateResponse {
    let balance = serde_json::json!({
        "event_time": ev.event_time,
        "asset": ev.asset,
        "balance_delta": ev.balance_delta,
        "clear_time": ev.clear_time,
    });
    proto::OnBalanceUpdateResponse {
        balance: balance.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_readers() {
        let v = json!({"a": "12", "b": 7, "c": 1.9, "d": "true", "e": null, "f": ["X", 1]});
        assert_eq!(int(&v, "a"), 12);
        assert_eq!(text(&v, "b"), "7");
        assert_eq!(int(&v, "c"), 1);
        assert!(flag(&v, "d"));
        assert_eq!(text(&v, "e"), "");
        assert_eq!(uint(&json!({"n": -1}), "n"), 0);
        assert_eq!(strings(&v, "f"), vec!["X".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_percent_price_by_side_canonicalized() {
        let filters = symbol_filters(&[
            json!({"filterType": "PERCENT_PRICE_BY_SIDE", "bidMultiplierUp": "5", "bidMultiplierDown": "0.2",
                   "askMultiplierUp": "4", "askMultiplierDown": "0.3", "avgPriceMins": 5}),
            json!({"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "100", "stepSize": "0.001"}),
            json!({"filterType": "TRAILING_DELTA"}),
        ]);
        let pp = filters.percent_price.unwrap();
        assert_eq!(pp.multiplier_up, "4");
        assert_eq!(pp.multiplier_down, "0.2");
        assert_eq!(pp.avg_price_mins, 5);
        assert_eq!(filters.lot_size.unwrap().step_size, "0.001");
        assert!(filters.notional.is_none());
    }

    #[test]
    fn test_exchange_info_without_symbols() {
        assert!(exchange_info_symbol(&json!({"symbols": []})).is_none());
        assert!(exchange_info_symbol(&json!({})).is_none());
    }

    #[test]
    fn test_account_balances_drop_zero() {
        let info = json!({"balances": [
            {"asset": "BTC", "free": "0.00000000", "locked": "0.00000000"},
            {"asset": "ETH", "free": "0", "locked": "1.5"},
            {"asset": "USDT", "free": "10", "locked": "0"}
        ]});
        let assets: Vec<String> = account_balances(&info).into_iter().map(|b| b.asset).collect();
        assert_eq!(assets, vec!["ETH".to_string(), "USDT".to_string()]);
    }

    #[test]
    fn test_order_book_levels_as_json() {
        let book = order_book(&json!({"lastUpdateId": 3, "bids": [["1.0", "2"]], "asks": []}));
        assert_eq!(book.last_update_id, 3);
        assert_eq!(book.bids, vec![r#"["1.0","2"]"#.to_string()]);

        let ev = OrderBookEvent {
            last_update_id: 4,
            bids: vec![("1.0".into(), "2".into())],
            asks: vec![],
        };
        assert_eq!(order_book_event(&ev).bids, book.bids);
    }

    #[test]
    fn test_empty_reply() {
        assert!(is_empty_reply(&json!({})));
        assert!(is_empty_reply(&Value::Null));
        assert!(!is_empty_reply(&json!({"orderId": 1})));
    }
}
