//! 事件分发
//!
//! 注册到适配器的处理器是对 (队列, 会话, trade_id, 事件类型) 的闭包：
//! 非阻塞入队；队列满时把该队列移出 `stream_queue[trade_id]`，并在独立任务中
//! 执行 trade_id 的停止流程。

use super::queue::{PutError, SubscriptionQueue};
use super::registry::OpenClient;
use crate::adapter::EventHandler;
use futures::FutureExt;
use std::sync::Arc;

/// 构造订阅处理器
///
/// 处理器只持有会话的弱引用，会话被移除后不再触发停止流程。
pub fn subscription_handler(
    client: &Arc<OpenClient>,
    queue: Arc<SubscriptionQueue>,
    trade_id: &str,
    event_type: &str,
) -> EventHandler {
    let client = Arc::downgrade(client);
    let trade_id = trade_id.to_string();
    let event_type = event_type.to_string();

    Arc::new(move |event| {
        let client = client.clone();
        let queue = queue.clone();
        let trade_id = trade_id.clone();
        let event_type = event_type.clone();
        async move {
            match queue.try_put(event) {
                Ok(()) => {}
                Err(PutError::Closed) => {}
                Err(PutError::Full) => {
                    log::warn!("For {} queue full and would be closed", event_type);
                    if let Some(client) = client.upgrade() {
                        client.discard_queue(&trade_id, &queue);
                        queue.stop();
                        // 投递方可能是该 trade_id 的监听任务，停止监听会取消它
                        tokio::spawn(async move { stop_stream(&client, &trade_id).await });
                    }
                }
            }
        }
        .boxed()
    })
}

/// trade_id 停止流程：
/// 停止监听 → 注销事件 → 向每个队列放入停止哨兵 → 让出一次 → 移除队列
pub async fn stop_stream(client: &OpenClient, trade_id: &str) {
    log::info!("StopStream request for {} on {}", trade_id, client.name());
    if let Err(e) = client.adapter().stop_events_listener(trade_id).await {
        log::warn!("stop_events_listener for {} failed: {}", trade_id, e);
    }
    client.adapter().events().unregister(client.exchange(), trade_id);

    for queue in client.queues(trade_id) {
        queue.stop();
    }
    if let Some(queue) = client.order_update_queue(trade_id) {
        queue.stop();
    }
    tokio::task::yield_now().await;

    client.remove_trade(trade_id);
}
