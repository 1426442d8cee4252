//! PendingOrderMap
//!
//! Bitfinex/Huobi 的挂单视图：每次 FetchOpenOrders 先逐条 `record`，
//! 再 `clear_stale`，只保留本次应答中出现的订单。

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrder {
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
}

#[derive(Debug, Default)]
pub struct PendingOrderMap {
    /// order_id → (订单, 本轮是否出现)
    orders: HashMap<i64, (PendingOrder, bool)>,
}

fn qty(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or_default()
}

impl PendingOrderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, order_id: i64, orig_qty: &str, executed_qty: &str) {
        let order = PendingOrder {
            orig_qty: qty(orig_qty),
            executed_qty: qty(executed_qty),
        };
        self.orders.insert(order_id, (order, true));
    }

    /// 移除本轮未出现的订单，并开始新一轮
    pub fn clear_stale(&mut self) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, (_, seen)| *seen);
        for (_, seen) in self.orders.values_mut() {
            *seen = false;
        }
        before - self.orders.len()
    }

    pub fn get(&self, order_id: i64) -> Option<&PendingOrder> {
        self.orders.get(&order_id).map(|(order, _)| order)
    }

    pub fn order_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.orders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_fetch_replaces_first() {
        let mut map = PendingOrderMap::new();
        map.record(1, "1.0", "0");
        map.record(2, "2.0", "0.5");
        assert_eq!(map.clear_stale(), 0);

        map.record(2, "2.0", "1.0");
        map.record(3, "3.0", "0");
        assert_eq!(map.clear_stale(), 1);

        assert_eq!(map.order_ids(), vec![2, 3]);
        assert_eq!(map.get(2).unwrap().executed_qty, Decimal::from_str("1.0").unwrap());
        assert!(map.get(1).is_none());
    }

    #[test]
    fn test_empty_fetch_clears_all() {
        let mut map = PendingOrderMap::new();
        map.record(1, "1", "0");
        map.clear_stale();
        assert_eq!(map.clear_stale(), 1);
        assert!(map.is_empty());
    }
}
