//! 成交补偿
//!
//! 部分交易所不会为手动查询到的成交推送成交事件。FetchOrder/CancelOrder
//! 发现 `executedQty != 0` 时，拉取该订单的成交列表，合并订单字段后
//! 作为 OrderTrades 事件放入 trade_id 的订单更新队列。

use super::queue::SubscriptionQueue;
use super::registry::OpenClient;
use crate::adapter::events::OrderTradesEvent;
use crate::adapter::StreamEvent;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// 订单字段 → 合并到每条成交记录中的键
const ORDER_FIELDS: &[(&str, &str)] = &[
    ("price", "orderPrice"),
    ("origQty", "origQty"),
    ("executedQty", "executedQty"),
    ("cummulativeQuoteQty", "cummulativeQuoteQty"),
    ("status", "status"),
];

/// `executedQty` 非零
pub fn has_executed_qty(order: &Value) -> bool {
    let qty = match order.get("executedQty") {
        Some(Value::String(s)) => Decimal::from_str(s).unwrap_or_default(),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).unwrap_or_default(),
        _ => Decimal::ZERO,
    };
    !qty.is_zero()
}

/// 成交记录 + 订单快照 → OrderTrades 事件
pub fn trade_event(trade: &Value, order: &Value) -> Option<StreamEvent> {
    let mut merged = trade.as_object()?.clone();
    for (from, to) in ORDER_FIELDS {
        if let Some(v) = order.get(*from) {
            merged.insert((*to).to_string(), v.clone());
        }
    }
    // 撤单应答的 clientOrderId 是撤单请求自身的编号
    if let Some(v) = order.get("origClientOrderId").or_else(|| order.get("clientOrderId")) {
        merged.insert("clientOrderId".to_string(), v.clone());
    }
    Some(StreamEvent::OrderTrades(OrderTradesEvent::from_trade(&merged)))
}

/// 拉取订单成交并放入订单更新队列，返回放入的事件数量
///
/// 成交列表拉取失败只记录日志，不影响调用方的应答。
pub async fn create_trade_stream_event(
    client: &OpenClient,
    queue: &SubscriptionQueue,
    trade_id: &str,
    symbol: &str,
    order_id: i64,
    order: &Value,
) -> usize {
    let trades = match client.adapter().fetch_order_trade_list(trade_id, symbol, order_id).await {
        Ok(trades) => trades,
        Err(e) => {
            log::error!("fetch_order_trade_list for {} order {} failed: {}", symbol, order_id, e);
            return 0;
        }
    };

    let mut emitted = 0;
    for trade in &trades {
        let Some(event) = trade_event(trade, order) else {
            log::warn!("fetch_order_trade_list returned malformed trade: {}", trade);
            continue;
        };
        match queue.put(event).await {
            Ok(()) => emitted += 1,
            Err(e) => {
                log::warn!("order update queue for {} unavailable: {}", trade_id, e);
                break;
            }
        }
    }
    log::info!("{}: synthesized {} trade event(s) for order {}", client.name(), emitted, order_id);
    emitted
}

/// FetchOpenOrders 后更新 PendingOrderMap (仅 Bitfinex/Huobi)
pub fn update_pending_orders(client: &OpenClient, trade_id: &str, orders: &[Value]) {
    if !client.exchange().tracks_pending_orders() {
        return;
    }
    let adapter = client.adapter();
    for order in orders {
        let order_id = order.get("orderId").and_then(Value::as_i64).unwrap_or_default();
        let orig_qty = order.get("origQty").and_then(Value::as_str).unwrap_or("0");
        let executed_qty = order.get("executedQty").and_then(Value::as_str).unwrap_or("0");
        adapter.active_order(trade_id, order_id, orig_qty, executed_qty);
    }
    adapter.active_orders_clear(trade_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_has_executed_qty() {
        assert!(has_executed_qty(&json!({"executedQty": "0.5"})));
        assert!(has_executed_qty(&json!({"executedQty": 1})));
        assert!(!has_executed_qty(&json!({"executedQty": "0.00000000"})));
        assert!(!has_executed_qty(&json!({"executedQty": "abc"})));
        assert!(!has_executed_qty(&json!({})));
    }

    #[test]
    fn test_trade_event_merges_order_fields() {
        let trade = json!({
            "symbol": "BTCUSDT", "id": 3, "orderId": 9, "price": "100.5", "qty": "0.2",
            "quoteQty": "20.1", "commission": "0", "commissionAsset": "USDT",
            "time": 1700000000000i64, "isBuyer": false, "isMaker": true
        });
        let order = json!({
            "clientOrderId": "777", "price": "100.0", "origQty": "1.0",
            "executedQty": "0.5", "cummulativeQuoteQty": "50.2", "status": "CANCELED"
        });

        let Some(StreamEvent::OrderTrades(ev)) = trade_event(&trade, &order) else {
            panic!("expected order trades event")
        };
        assert_eq!(ev.client_order_id, "777");
        assert_eq!(ev.order_price, "100.0");
        assert_eq!(ev.last_executed_price, "100.5");
        assert_eq!(ev.cumulative_filled_quantity, "0.5");
        assert_eq!(ev.order_status, "CANCELED");
        assert_eq!(ev.side, "SELL");
        assert_eq!(ev.trade_id, 3);
        assert!(trade_event(&json!("x"), &order).is_none());
    }

    #[test]
    fn test_trade_event_prefers_orig_client_order_id() {
        let trade = json!({"symbol": "BTCUSDT", "id": 4, "orderId": 9, "price": "100", "qty": "0.5"});
        let cancel_reply = json!({
            "origClientOrderId": "777", "clientOrderId": "cancel-777",
            "executedQty": "0.5", "status": "CANCELED"
        });

        let Some(StreamEvent::OrderTrades(ev)) = trade_event(&trade, &cancel_reply) else {
            panic!("expected order trades event")
        };
        assert_eq!(ev.client_order_id, "777");
    }
}
