//! 网关核心
//!
//! 进程内唯一的可变状态都收拢在 `Gateway` 中，由 gRPC 服务持有：
//! 会话注册表、限频控制器、订阅队列容量。

pub mod fanout;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;
pub mod registry;

use crate::adapter::AdapterFactory;
use crate::utils::config::ServerConfig;
use crate::utils::tasks::TaskRegistry;
use crate::{GatewayError, Result};
use rate_limit::{RateLimitController, RateLimitTable};
use registry::{ClientRegistry, OpenClient};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use queue::{QueueItem, QueueMode, SubscriptionQueue};

/// 订单簿队列容量倍数
pub const ORDER_BOOK_QUEUE_FACTOR: usize = 5;

/// 余额流 REST 轮询超时 = 心跳 × 30
pub const BALANCE_POLL_HEARTBEATS: u32 = 30;

pub struct Gateway {
    pub registry: ClientRegistry,
    pub rate_limit: RateLimitController,
    max_queue_size: AtomicUsize,
    heartbeat: Duration,
    tasks: Arc<TaskRegistry>,
}

impl Gateway {
    pub fn new(
        config: &ServerConfig,
        config_path: impl Into<PathBuf>,
        factory: Arc<dyn AdapterFactory>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(config_path, factory),
            rate_limit: RateLimitController::new(
                RateLimitTable::from_config(&config.rate_limit),
                config.server.rate_limit_reset(),
            ),
            max_queue_size: AtomicUsize::new(config.server.max_queue_size.max(1)),
            heartbeat: config.server.heartbeat(),
            tasks,
        }
    }

    pub fn client(&self, client_id: i64) -> Result<Arc<OpenClient>> {
        self.registry.get(client_id).ok_or(GatewayError::ClientNotFound(client_id))
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    // ---- 队列容量 ----

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size.load(Ordering::SeqCst)
    }

    pub fn set_max_queue_size(&self, size: usize) {
        self.max_queue_size.store(size.max(1), Ordering::SeqCst);
    }

    /// 容量上调 10%，返回新值
    pub fn bump_max_queue_size(&self) -> usize {
        let prev = self
            .max_queue_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| Some(size + size / 10))
            .unwrap_or_else(|size| size);
        prev + prev / 10
    }

    pub fn fifo_queue(&self) -> Arc<SubscriptionQueue> {
        Arc::new(SubscriptionQueue::fifo(self.max_queue_size()))
    }

    pub fn order_book_queue(&self) -> Arc<SubscriptionQueue> {
        Arc::new(SubscriptionQueue::latest(self.max_queue_size() * ORDER_BOOK_QUEUE_FACTOR))
    }

    // ---- 关闭 ----

    /// 取消名称同时包含 keepalive 与 heartbeat 的任务
    pub fn stop_keepalive_tasks(&self) -> usize {
        self.tasks
            .abort_where(|name| name.contains("keepalive") && name.contains("heartbeat"))
    }

    /// 结束全部订阅，取消剩余保活任务，关闭全部会话
    pub async fn shutdown(&self) {
        for client in self.registry.clients() {
            for trade_id in client.trade_ids() {
                fanout::stop_stream(&client, &trade_id).await;
            }
        }
        let stopped = self.stop_keepalive_tasks();
        log::info!("Gateway shutdown: cancelled {} keepalive task(s)", stopped);
        self.registry.close_all().await;
    }
}
