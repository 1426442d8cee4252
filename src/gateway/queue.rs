//! 订阅队列
//!
//! 每个流式订阅一个有界队列，元素为 `Event | Stop`：
//! - `Fifo`:   按顺序逐个取出
//! - `Latest`: 取出最新一条并丢弃其余 (订单簿快照)
//!
//! `stop()` 之后 `get()` 立即返回 `Stop`，不再交付剩余事件。

use crate::adapter::StreamEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Event(StreamEvent),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Fifo,
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PutError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<StreamEvent>,
    stopped: bool,
    closed: bool,
    unfinished: usize,
}

#[derive(Debug)]
pub struct SubscriptionQueue {
    id: u64,
    mode: QueueMode,
    capacity: usize,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl SubscriptionQueue {
    pub fn new(mode: QueueMode, capacity: usize) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn fifo(capacity: usize) -> Self {
        Self::new(QueueMode::Fifo, capacity)
    }

    pub fn latest(capacity: usize) -> Self {
        Self::new(QueueMode::Latest, capacity)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已入队但尚未 `task_done` 的数量
    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// 非阻塞入队
    pub fn try_put(&self, event: StreamEvent) -> Result<(), PutError> {
        {
            let mut state = self.state.lock();
            if state.closed || state.stopped {
                return Err(PutError::Closed);
            }
            if state.items.len() >= self.capacity {
                return Err(PutError::Full);
            }
            state.items.push_back(event);
            state.unfinished += 1;
        }
        self.readable.notify_one();
        Ok(())
    }

    /// 入队，队列满时等待
    pub async fn put(&self, event: StreamEvent) -> Result<(), PutError> {
        let mut event = Some(event);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ev) = event.take() {
                match self.try_put(ev.clone()) {
                    Err(PutError::Full) => event = Some(ev),
                    other => return other,
                }
            }
            notified.await;
        }
    }

    /// 停止订阅 (放入停止哨兵)
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    /// 消费端已退出，之后的入队被忽略
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.unfinished = state.unfinished.saturating_sub(state.items.len());
        state.items.clear();
        drop(state);
        self.writable.notify_waiters();
    }

    /// 非阻塞出队
    pub fn try_get(&self) -> Option<QueueItem> {
        let item = {
            let mut state = self.state.lock();
            if state.stopped {
                return Some(QueueItem::Stop);
            }
            match self.mode {
                QueueMode::Fifo => state.items.pop_front(),
                QueueMode::Latest => {
                    let latest = state.items.pop_back();
                    let dropped = state.items.len();
                    state.items.clear();
                    state.unfinished = state.unfinished.saturating_sub(dropped);
                    latest
                }
            }
        };
        if item.is_some() {
            self.writable.notify_waiters();
        }
        item.map(QueueItem::Event)
    }

    /// 出队，队列空时等待
    pub async fn get(&self) -> QueueItem {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// 标记一个已取出的事件处理完毕
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::events::BalanceUpdateEvent;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(n: i64) -> StreamEvent {
        StreamEvent::BalanceUpdate(BalanceUpdateEvent {
            event_time: n,
            asset: "BTC".into(),
            balance_delta: n.to_string(),
            clear_time: n,
        })
    }

    #[tokio::test]
    async fn test_fifo_order_and_capacity() {
        let q = SubscriptionQueue::fifo(2);
        q.try_put(event(1)).unwrap();
        q.try_put(event(2)).unwrap();
        assert_eq!(q.try_put(event(3)), Err(PutError::Full));

        assert_eq!(q.get().await, QueueItem::Event(event(1)));
        q.task_done();
        assert_eq!(q.get().await, QueueItem::Event(event(2)));
        q.task_done();
        assert_eq!(q.unfinished(), 0);
    }

    #[tokio::test]
    async fn test_latest_keeps_newest_only() {
        let q = SubscriptionQueue::latest(10);
        for n in 1..=3 {
            q.try_put(event(n)).unwrap();
        }
        assert_eq!(q.get().await, QueueItem::Event(event(3)));
        assert!(q.is_empty());
        q.task_done();
        assert_eq!(q.unfinished(), 0);
    }

    #[tokio::test]
    async fn test_stop_has_priority() {
        let q = SubscriptionQueue::fifo(4);
        q.try_put(event(1)).unwrap();
        q.stop();
        assert_eq!(q.get().await, QueueItem::Stop);
        assert_eq!(q.get().await, QueueItem::Stop);
        assert_eq!(q.try_put(event(2)), Err(PutError::Closed));
    }

    #[tokio::test]
    async fn test_get_wakes_on_put_and_stop() {
        let q = Arc::new(SubscriptionQueue::fifo(4));
        let reader = {
            let q = q.clone();
            tokio::spawn(async move { (q.get().await, q.get().await) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.try_put(event(7)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.stop();

        let (first, second) = reader.await.unwrap();
        assert_eq!(first, QueueItem::Event(event(7)));
        assert_eq!(second, QueueItem::Stop);
    }

    #[test]
    fn test_get_pending_until_put() {
        let q = SubscriptionQueue::fifo(2);
        let mut get = tokio_test::task::spawn(q.get());
        tokio_test::assert_pending!(get.poll());

        q.try_put(event(5)).unwrap();
        assert!(get.is_woken());
        assert_eq!(tokio_test::assert_ready!(get.poll()), QueueItem::Event(event(5)));
    }

    #[tokio::test]
    async fn test_put_waits_for_space() {
        let q = Arc::new(SubscriptionQueue::fifo(1));
        q.try_put(event(1)).unwrap();

        let writer = {
            let q = q.clone();
            tokio::spawn(async move { q.put(event(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        assert_eq!(q.get().await, QueueItem::Event(event(1)));
        writer.await.unwrap().unwrap();
        assert_eq!(q.get().await, QueueItem::Event(event(2)));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let q = SubscriptionQueue::fifo(2);
        q.try_put(event(1)).unwrap();
        q.close();
        assert_eq!(q.try_put(event(2)), Err(PutError::Closed));
        assert_eq!(q.put(event(3)).await, Err(PutError::Closed));
        assert_eq!(q.unfinished(), 0);
    }
}
