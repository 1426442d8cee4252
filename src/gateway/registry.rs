//! 会话注册表
//!
//! 每个账户名最多一个 `OpenClient`；会话持有唯一的适配器、最近一次 REST
//! 调用时间以及按 trade_id 归组的订阅队列。

use super::queue::SubscriptionQueue;
use crate::account::{get_account, Account};
use crate::adapter::{AdapterFactory, ExchangeAdapter, ExchangeId};
use crate::{GatewayError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ═══════════════════════════════════════════════════════════════════════════
// OpenClient
// ═══════════════════════════════════════════════════════════════════════════

pub struct OpenClient {
    id: i64,
    account: Account,
    adapter: Arc<dyn ExchangeAdapter>,
    /// 最近一次 REST 调用 (或已预约的调用) 时间
    last_call: Mutex<Option<Instant>>,
    stream_queue: DashMap<String, Vec<Arc<SubscriptionQueue>>>,
    order_update_queues: DashMap<String, Arc<SubscriptionQueue>>,
}

impl OpenClient {
    pub fn new(id: i64, account: Account, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            id,
            account,
            adapter,
            last_call: Mutex::new(None),
            stream_queue: DashMap::new(),
            order_update_queues: DashMap::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.account.name
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn exchange(&self) -> ExchangeId {
        self.adapter.exchange()
    }

    pub fn adapter(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.adapter
    }

    /// 行情事件类型中的交易对写法
    pub fn stream_symbol(&self, symbol: &str) -> String {
        self.adapter.symbol_to_exchange(symbol)
    }

    // ---- 限频时间戳 ----

    pub fn last_call(&self) -> Option<Instant> {
        *self.last_call.lock()
    }

    /// 预约下一次调用时间：`max(now, last + interval)`，返回需要等待到的时刻
    pub fn reserve_call(&self, interval: Duration) -> Instant {
        self.reserve(interval).1
    }

    /// 同 `reserve_call`，同时返回预约前的时间，用于撤回
    pub fn reserve(&self, interval: Duration) -> (Option<Instant>, Instant) {
        let now = Instant::now();
        let mut last = self.last_call.lock();
        let previous = *last;
        let at = match previous {
            Some(prev) if prev + interval > now => prev + interval,
            _ => now,
        };
        *last = Some(at);
        (previous, at)
    }

    /// 撤回尚未发出的预约；之后已有更晚的预约时保持不变
    pub fn release_call(&self, at: Instant, previous: Option<Instant>) {
        let mut last = self.last_call.lock();
        if *last == Some(at) {
            *last = previous;
        }
    }

    /// 调用完成；已预约的更晚时刻保持不变
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_call.lock();
        if last.map_or(true, |prev| prev < now) {
            *last = Some(now);
        }
    }

    // ---- 订阅队列 ----

    pub fn add_queue(&self, trade_id: &str, queue: Arc<SubscriptionQueue>) {
        self.stream_queue.entry(trade_id.to_string()).or_default().push(queue);
    }

    /// 从 `stream_queue[trade_id]` 移除队列，返回是否存在
    pub fn discard_queue(&self, trade_id: &str, queue: &SubscriptionQueue) -> bool {
        match self.stream_queue.get_mut(trade_id) {
            Some(mut queues) => {
                let before = queues.len();
                queues.retain(|q| q.id() != queue.id());
                before != queues.len()
            }
            None => false,
        }
    }

    pub fn queues(&self, trade_id: &str) -> Vec<Arc<SubscriptionQueue>> {
        self.stream_queue
            .get(trade_id)
            .map(|queues| queues.clone())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, trade_id: &str, queue: &SubscriptionQueue) -> bool {
        self.stream_queue
            .get(trade_id)
            .map(|queues| queues.iter().any(|q| q.id() == queue.id()))
            .unwrap_or(false)
    }

    pub fn set_order_update_queue(&self, trade_id: &str, queue: Arc<SubscriptionQueue>) {
        self.order_update_queues.insert(trade_id.to_string(), queue);
    }

    pub fn order_update_queue(&self, trade_id: &str) -> Option<Arc<SubscriptionQueue>> {
        self.order_update_queues.get(trade_id).map(|q| q.value().clone())
    }

    /// 停止流程最后一步：移除 trade_id 的全部队列
    pub fn remove_trade(&self, trade_id: &str) {
        self.order_update_queues.remove(trade_id);
        self.stream_queue.remove(trade_id);
    }

    /// 当前持有订阅队列的 trade_id
    pub fn trade_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stream_queue.iter().map(|e| e.key().clone()).collect();
        for entry in self.order_update_queues.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids
    }

    /// trade_id 是否有任何订阅、注册或数据流
    pub fn knows_trade(&self, trade_id: &str) -> bool {
        self.stream_queue.contains_key(trade_id)
            || self.order_update_queues.contains_key(trade_id)
            || self.adapter.events().has_registrations(trade_id)
            || self.adapter.has_data_streams(trade_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ClientRegistry
// ═══════════════════════════════════════════════════════════════════════════

pub struct ClientRegistry {
    config_path: PathBuf,
    factory: Arc<dyn AdapterFactory>,
    clients: DashMap<String, Arc<OpenClient>>,
    next_id: AtomicI64,
    /// 串行化创建流程，保证同名账户只有一个会话
    create_lock: tokio::sync::Mutex<()>,
}

impl ClientRegistry {
    pub fn new(config_path: impl Into<PathBuf>, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            config_path: config_path.into(),
            factory,
            clients: DashMap::new(),
            next_id: AtomicI64::new(1),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 按账户名获取或创建会话，并执行 `load(symbol)`
    pub async fn get_or_create(&self, account_name: &str, symbol: &str) -> Result<Arc<OpenClient>> {
        let _guard = self.create_lock.lock().await;

        let client = match self.get_by_name(account_name) {
            Some(client) => {
                client.adapter().set_rate_limit_reached(false);
                client
            }
            None => {
                let account = get_account(&self.config_path, account_name)?.ok_or_else(|| {
                    GatewayError::AccountNotRegistered(
                        account_name.to_string(),
                        self.config_path.display().to_string(),
                    )
                })?;
                let adapter = self
                    .factory
                    .create(&account)
                    .map_err(|source| GatewayError::AdapterUnavailable {
                        account: account_name.to_string(),
                        source,
                    })?;
                if account.has_master() {
                    self.attach_master(&account, adapter.as_ref(), symbol).await?;
                }
                let client = Arc::new(OpenClient::new(
                    self.next_id.fetch_add(1, Ordering::SeqCst),
                    account,
                    adapter,
                ));
                self.clients.insert(account_name.to_string(), client.clone());
                log::info!(
                    "OpenClient: created session {} for {} on {}",
                    client.id(),
                    account_name,
                    client.exchange()
                );
                client
            }
        };

        if let Err(source) = client.adapter().load(symbol).await {
            log::error!("OpenClientConnection for '{}' exception: {}", account_name, source);
            self.remove(account_name).await;
            return Err(GatewayError::SessionLoad {
                account: account_name.to_string(),
                source,
            });
        }
        Ok(client)
    }

    /// 临时创建主账户适配器取 UID/account-id，随后关闭
    async fn attach_master(&self, account: &Account, adapter: &dyn ExchangeAdapter, symbol: &str) -> Result<()> {
        let Some(master_name) = account.master_name.as_deref() else {
            return Ok(());
        };
        let Some(master) = get_account(&self.config_path, master_name)? else {
            log::warn!("OpenClient: master account '{}' for '{}' not found", master_name, account.name);
            return Ok(());
        };

        let master_adapter = self.factory.create(&master)?;
        match master_adapter.fetch_exchange_info(symbol).await {
            Ok(_) => match master_adapter.account_ids() {
                Some((uid, account_id)) => {
                    log::info!("OpenClient: {} master uid {} account_id {}", account.name, uid, account_id);
                    adapter.set_master_account(uid, account_id);
                }
                None => log::warn!("OpenClient: master '{}' returned no account ids", master_name),
            },
            Err(e) => log::warn!("OpenClient: master '{}' lookup failed: {}", master_name, e),
        }
        master_adapter.close().await;
        Ok(())
    }

    pub fn get(&self, client_id: i64) -> Option<Arc<OpenClient>> {
        self.clients
            .iter()
            .find(|entry| entry.value().id() == client_id)
            .map(|entry| entry.value().clone())
    }

    pub fn clients(&self) -> Vec<Arc<OpenClient>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_by_name(&self, account_name: &str) -> Option<Arc<OpenClient>> {
        self.clients.get(account_name).map(|c| c.value().clone())
    }

    /// 移除并关闭会话
    pub async fn remove(&self, account_name: &str) -> bool {
        match self.clients.remove(account_name) {
            Some((_, client)) => {
                client.adapter().close().await;
                log::info!("OpenClient: removed session {} ({})", client.id(), account_name);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// 关闭全部会话
    pub async fn close_all(&self) {
        let names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::paper::PaperFactory;
    use crate::adapter::AdapterError;
    use crate::utils::tasks::TaskRegistry;
    use std::io::Write;

    const CONFIG: &str = r#"
[[accounts]]
exchange = "huobi"
name = "Sub"
api_key = "k"
api_secret = "s"
master_name = "Master"

[[accounts]]
exchange = "huobi"
name = "Master"
api_key = "mk"
api_secret = "ms"

[endpoint.huobi]
api_public = "https://api.huobi.pro"
api_auth = "https://api.huobi.pro"
ws_public = "wss://api.huobi.pro/ws"
ws_auth = "wss://api.huobi.pro/ws/v2"
"#;

    fn setup() -> (tempfile::NamedTempFile, Arc<PaperFactory>, ClientRegistry) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let factory = Arc::new(PaperFactory::new(Arc::new(TaskRegistry::new()), None));
        let registry = ClientRegistry::new(file.path(), factory.clone());
        (file, factory, registry)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let (_file, factory, registry) = setup();
        let first = registry.get_or_create("Master", "BTCUSDT").await.unwrap();
        factory.instance("Master").unwrap().set_rate_limit_reached(true);

        let second = registry.get_or_create("Master", "BTCUSDT").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert!(!second.adapter().rate_limit_reached());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first.id()).unwrap().name(), "Master");
    }

    #[tokio::test]
    async fn test_sub_account_gets_master_ids() {
        let (_file, factory, registry) = setup();
        registry.get_or_create("Sub", "BTCUSDT").await.unwrap();

        let sub = factory.instance("Sub").unwrap();
        assert_eq!(
            sub.master_account(),
            Some(("paper-uid-Master".to_string(), "paper-Master".to_string()))
        );
        assert!(factory.instance("Master").unwrap().is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (_file, _factory, registry) = setup();
        let err = registry.get_or_create("Nobody", "BTCUSDT").await.err().unwrap();
        assert!(matches!(err, GatewayError::AccountNotRegistered(..)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_removes_session() {
        let (_file, factory, registry) = setup();
        let client = registry.get_or_create("Master", "BTCUSDT").await.unwrap();
        factory
            .instance("Master")
            .unwrap()
            .fail_next(AdapterError::Http { status: 401, message: "bad key".into() });

        let err = registry.get_or_create("Master", "BTCUSDT").await.err().unwrap();
        assert!(matches!(err, GatewayError::SessionLoad { .. }));
        assert!(registry.get(client.id()).is_none());
        assert!(factory.instance("Master").unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_call_spaces_calls() {
        let (_file, _factory, registry) = setup();
        let client = registry.get_or_create("Master", "BTCUSDT").await.unwrap();
        let interval = Duration::from_secs(1);

        let t0 = Instant::now();
        assert_eq!(client.reserve_call(interval), t0);
        assert_eq!(client.reserve_call(interval), t0 + interval);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(client.reserve_call(interval), Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_call_restores_previous() {
        let (_file, _factory, registry) = setup();
        let client = registry.get_or_create("Master", "BTCUSDT").await.unwrap();
        let interval = Duration::from_secs(1);

        let t0 = client.reserve_call(interval);
        let at = client.reserve_call(interval);
        client.release_call(at, Some(t0));
        assert_eq!(client.last_call(), Some(t0));

        // 之后已有更晚的预约
        let at = client.reserve_call(interval);
        let later = client.reserve_call(interval);
        client.release_call(at, Some(t0));
        assert_eq!(client.last_call(), Some(later));
    }
}
