//! Martin gRPC 服务
//!
//! 一元调用：按 client_id 取会话 → 限频等待 → 调用适配器 → 转换应答。
//! 流式订阅：创建队列并注册事件处理器，派生任务把队列中的事件转发到
//! 应答通道，直到收到停止信号或客户端断开。

use crate::adapter::{NewOrder, OrderQuery, OrderType, Side, StreamEvent, TimeInForce};
use crate::gateway::fanout::{stop_stream, subscription_handler};
use crate::gateway::rate_limit::CallClass;
use crate::gateway::reconcile::{create_trade_stream_event, has_executed_qty, update_pending_orders};
use crate::gateway::registry::OpenClient;
use crate::gateway::{Gateway, QueueItem, SubscriptionQueue, BALANCE_POLL_HEARTBEATS};
use crate::service::convert;
use crate::{AdapterError, GatewayError, SRV_VERSION};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

// ═══════════════════════════════════════════════════════════════════════════
// Proto 生成模块 (tonic 自动生成)
// ═══════════════════════════════════════════════════════════════════════════

pub mod proto {
    tonic::include_proto!("martin");
}

pub use proto::martin_server::{Martin, MartinServer};
use proto::*;

type RpcStream<T> = ReceiverStream<Result<T, Status>>;

// ═══════════════════════════════════════════════════════════════════════════
// 服务实现
// ═══════════════════════════════════════════════════════════════════════════

pub struct MartinServiceImpl {
    gateway: Arc<Gateway>,
}

impl MartinServiceImpl {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn into_server(self) -> MartinServer<Self> {
        MartinServer::new(self)
    }

    fn client(&self, rpc: &str, client_id: i64) -> Result<Arc<OpenClient>, Status> {
        self.gateway.client(client_id).map_err(|e| {
            log::warn!("{}: {}", rpc, e);
            Status::from(e)
        })
    }

    /// 限频等待 → 调用 → 记录调用时间
    async fn rest<T>(
        &self,
        client: &OpenClient,
        class: CallClass,
        call: impl Future<Output = Result<T, AdapterError>>,
    ) -> crate::Result<T> {
        self.gateway.rate_limit.wait(client, class).await;
        let res = call.await?;
        client.touch();
        Ok(res)
    }

    /// 错误分类：记录日志，限频错误置位全局锁存
    fn failure(&self, rpc: &str, client: &OpenClient, symbol: &str, err: GatewayError) -> Status {
        if err.is_rate_limit() {
            self.gateway.rate_limit.arm();
            log::warn!("{} for {}:{} exception: {}", rpc, client.name(), symbol, err);
        } else if err.is_cancelled() {
            // 任务取消不是错误
        } else if matches!(err, GatewayError::Adapter(AdapterError::Http { .. })) {
            log::error!("{} for {}:{} exception: {}", rpc, client.name(), symbol, err);
        } else {
            log::error!("{} for {}:{} exception: {}", rpc, client.name(), symbol, err);
            log::debug!("{} for {}:{} error: {:?}", rpc, client.name(), symbol, err);
        }
        err.into()
    }

    /// 订阅队列登记到 `stream_queue[trade_id]`，并注册行情事件
    fn subscribe_market(
        &self,
        client: &Arc<OpenClient>,
        queue: &Arc<SubscriptionQueue>,
        trade_id: &str,
        event_type: &str,
    ) {
        let handler = subscription_handler(client, queue.clone(), trade_id, event_type);
        client
            .adapter()
            .events()
            .register_event(handler, event_type, client.exchange(), trade_id);
    }

    fn subscribe_user(&self, client: &Arc<OpenClient>, queue: &Arc<SubscriptionQueue>, trade_id: &str, event_type: &str) {
        let handler = subscription_handler(client, queue.clone(), trade_id, event_type);
        client.adapter().events().register_user_event(handler, event_type, trade_id);
    }
}

/// 流式订阅循环
///
/// `transform` 返回 None 的事件不会发送，但仍计入 `task_done`。
fn spawn_stream_loop<T, F>(
    label: &'static str,
    client: Arc<OpenClient>,
    queue: Arc<SubscriptionQueue>,
    trade_id: String,
    mut transform: F,
) -> RpcStream<T>
where
    T: Send + 'static,
    F: FnMut(StreamEvent) -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                item = queue.get() => Some(item),
                _ = tx.closed() => None,
            };
            match item {
                Some(QueueItem::Stop) => {
                    client.discard_queue(&trade_id, &queue);
                    log::info!("{}: Stop loop for {}:{}", label, client.name(), trade_id);
                    break;
                }
                Some(QueueItem::Event(event)) => {
                    if let Some(response) = transform(event) {
                        if tx.send(Ok(response)).await.is_err() {
                            client_gone(label, &client, &queue, &trade_id);
                            break;
                        }
                    }
                    queue.task_done();
                }
                None => {
                    client_gone(label, &client, &queue, &trade_id);
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

/// 客户端断开：关闭并移除队列，不触发 trade_id 的停止流程
fn client_gone(label: &str, client: &OpenClient, queue: &Arc<SubscriptionQueue>, trade_id: &str) {
    log::info!("{}: client gone for {}:{}", label, client.name(), trade_id);
    queue.close();
    client.discard_queue(trade_id, queue);
}

#[tonic::async_trait]
impl Martin for MartinServiceImpl {
    // ---- 会话 ----

    async fn open_client_connection(
        &self,
        request: Request<OpenClientConnectionRequest>,
    ) -> Result<Response<OpenClientConnectionId>, Status> {
        let req = request.into_inner();
        log::info!("OpenClientConnection start trade: {}:{}", req.account_name, req.trade_id);

        let client = self
            .gateway
            .registry
            .get_or_create(&req.account_name, &req.symbol)
            .await
            .map_err(|e| {
                log::warn!("OpenClientConnection for '{}' exception: {}", req.account_name, e);
                log::debug!("OpenClientConnection for '{}' error: {:?}", req.account_name, e);
                Status::from(e)
            })?;

        let rate_limiter = self.gateway.rate_limit.observe_rate_limiter(req.rate_limiter);
        Ok(Response::new(OpenClientConnectionId {
            client_id: client.id(),
            trade_id: req.trade_id,
            srv_version: SRV_VERSION.to_string(),
            exchange: client.exchange().to_string(),
            rate_limiter,
        }))
    }

    async fn reset_rate_limit(
        &self,
        request: Request<OpenClientConnectionId>,
    ) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        self.gateway.rate_limit.observe_rate_limiter(req.rate_limiter);
        let client = self.client("ResetRateLimit", req.client_id)?;
        let success = self.gateway.rate_limit.reset(&client);
        Ok(Response::new(SimpleResponse {
            success,
            result: String::new(),
        }))
    }

    async fn fetch_server_time(
        &self,
        request: Request<OpenClientConnectionId>,
    ) -> Result<Response<FetchServerTimeResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchServerTime", req.client_id)?;
        let res = self
            .rest(&client, CallClass::Default, client.adapter().fetch_server_time())
            .await
            .map_err(|e| self.failure("FetchServerTime", &client, "", e))?;
        Ok(Response::new(FetchServerTimeResponse {
            server_time: convert::int(&res, "serverTime"),
        }))
    }

    async fn one_click_arrival_deposit(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("OneClickArrivalDeposit", req.client_id)?;
        // symbol 字段携带 tx_id
        let res = self
            .rest(&client, CallClass::Default, client.adapter().one_click_arrival_deposit(&req.symbol))
            .await
            .map_err(|e| self.failure("OneClickArrivalDeposit", &client, &req.symbol, e))?;
        Ok(Response::new(SimpleResponse {
            success: true,
            result: res.to_string(),
        }))
    }

    // ---- 订单 ----

    async fn fetch_open_orders(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<FetchOpenOrdersResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchOpenOrders", req.client_id)?;
        let orders = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_open_orders(&req.trade_id, &req.symbol),
            )
            .await
            .map_err(|e| self.failure("FetchOpenOrders", &client, &req.symbol, e))?;

        update_pending_orders(&client, &req.trade_id, &orders);
        Ok(Response::new(FetchOpenOrdersResponse {
            items: orders.iter().map(convert::open_order).collect(),
            rate_limiter: self.gateway.rate_limit.rate_limiter(),
        }))
    }

    async fn fetch_order(&self, request: Request<FetchOrderRequest>) -> Result<Response<FetchOrderResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchOrder", req.client_id)?;
        let query = if req.order_id != 0 {
            OrderQuery::OrderId(req.order_id)
        } else {
            OrderQuery::ClientOrderId(req.client_order_id.clone())
        };
        let res = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_order(&req.trade_id, &req.symbol, query),
            )
            .await
            .map_err(|e| {
                let label = format!("{}:{}({})", req.symbol, req.order_id, req.client_order_id);
                self.failure("FetchOrder", &client, &label, e)
            })?;

        if req.filled_update_call && has_executed_qty(&res) {
            match client.order_update_queue(&req.trade_id) {
                Some(queue) => {
                    let order_id = convert::int(&res, "orderId");
                    create_trade_stream_event(&client, &queue, &req.trade_id, &req.symbol, order_id, &res).await;
                }
                None => log::debug!("FetchOrder: no order update stream for {}", req.trade_id),
            }
        }
        Ok(Response::new(convert::order(&res)))
    }

    async fn cancel_all_orders(&self, request: Request<MarketRequest>) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("CancelAllOrders", req.client_id)?;
        let res = self
            .rest(
                &client,
                CallClass::CancelOrder,
                client.adapter().cancel_all_orders(&req.trade_id, &req.symbol),
            )
            .await
            .map_err(|e| self.failure("CancelAllOrders", &client, &req.symbol, e))?;
        Ok(Response::new(SimpleResponse {
            success: true,
            result: res.to_string(),
        }))
    }

    async fn create_limit_order(
        &self,
        request: Request<CreateLimitOrderRequest>,
    ) -> Result<Response<CreateLimitOrderResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("CreateLimitOrder", req.client_id)?;
        let client_order_id = req.new_client_order_id.to_string();
        let order = NewOrder {
            symbol: req.symbol.clone(),
            side: if req.buy_side { Side::Buy } else { Side::Sell },
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            quantity: req.quantity.clone(),
            price: req.price.clone(),
            new_client_order_id: client_order_id.clone(),
        };
        let label = format!("{}:{}", req.symbol, client_order_id);

        let mut res = self
            .rest(
                &client,
                CallClass::CreateOrder,
                client.adapter().create_order(&req.trade_id, order),
            )
            .await
            .map_err(|e| self.failure("CreateLimitOrder", &client, &label, e))?;

        if convert::is_empty_reply(&res) && client.exchange().refetches_empty_order_reply() {
            log::debug!("CreateLimitOrder: empty reply for {}, fetching order", label);
            res = self
                .rest(
                    &client,
                    CallClass::Default,
                    client.adapter().fetch_order(
                        &req.trade_id,
                        &req.symbol,
                        OrderQuery::ClientOrderId(client_order_id),
                    ),
                )
                .await
                .map_err(|e| self.failure("CreateLimitOrder", &client, &label, e))?;
        }
        log::debug!(
            "CreateLimitOrder: for {}:{}: created: {}",
            client.name(),
            req.symbol,
            convert::int(&res, "orderId")
        );
        Ok(Response::new(convert::create_order(&res)))
    }

    async fn cancel_order(&self, request: Request<CancelOrderRequest>) -> Result<Response<CancelOrderResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("CancelOrder", req.client_id)?;
        let res = self
            .rest(
                &client,
                CallClass::CancelOrder,
                client.adapter().cancel_order(&req.trade_id, &req.symbol, req.order_id),
            )
            .await
            .map_err(|e| self.failure("CancelOrder", &client, &req.symbol, e))?;

        if has_executed_qty(&res) {
            match client.order_update_queue(&req.trade_id) {
                Some(queue) => {
                    create_trade_stream_event(&client, &queue, &req.trade_id, &req.symbol, req.order_id, &res).await;
                }
                None => log::debug!("CancelOrder: no order update stream for {}", req.trade_id),
            }
        }
        Ok(Response::new(convert::cancel_order(&res)))
    }

    async fn transfer_to_master(&self, request: Request<MarketRequest>) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("TransferToMaster", req.client_id)?;
        let res = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().transfer_to_master(&req.symbol, &req.amount),
            )
            .await
            .map_err(|e| match e {
                GatewayError::Adapter(AdapterError::Http { .. }) => {
                    log::error!("TransferToMaster for {}: {} exception: {}", client.name(), req.symbol, e);
                    Status::resource_exhausted(e.to_string())
                }
                other => self.failure("TransferToMaster", &client, &req.symbol, other),
            })?;

        let success = res.get("txnId").map_or(false, |id| !id.is_null());
        Ok(Response::new(SimpleResponse {
            success,
            result: res.to_string(),
        }))
    }

    // ---- 账户与行情 ----

    async fn fetch_exchange_info_symbol(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<FetchExchangeInfoSymbolResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchExchangeInfoSymbol", req.client_id)?;
        let info = self
            .rest(&client, CallClass::Default, client.adapter().fetch_exchange_info(&req.symbol))
            .await
            .map_err(|e| self.failure("FetchExchangeInfoSymbol", &client, &req.symbol, e))?;

        convert::exchange_info_symbol(&info)
            .map(Response::new)
            .ok_or_else(|| {
                self.failure(
                    "FetchExchangeInfoSymbol",
                    &client,
                    &req.symbol,
                    GatewayError::SymbolNotFound(req.symbol.clone()),
                )
            })
    }

    async fn fetch_account_information(
        &self,
        request: Request<OpenClientConnectionId>,
    ) -> Result<Response<FetchAccountBalanceResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchAccountInformation", req.client_id)?;
        let info = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_account_information(&req.trade_id),
            )
            .await
            .map_err(|e| self.failure("FetchAccountInformation", &client, "", e))?;
        Ok(Response::new(FetchAccountBalanceResponse {
            balances: convert::account_balances(&info),
        }))
    }

    async fn fetch_funding_wallet(
        &self,
        request: Request<FetchFundingWalletRequest>,
    ) -> Result<Response<FetchFundingWalletResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchFundingWallet", req.client_id)?;
        if !client.exchange().has_funding_wallet(client.account().test_net) {
            return Ok(Response::new(FetchFundingWalletResponse::default()));
        }
        let receive_window = (req.receive_window > 0).then_some(req.receive_window);
        let rows = self
            .rest(
                &client,
                CallClass::Default,
                client
                    .adapter()
                    .fetch_funding_wallet(&req.asset, req.need_btc_valuation, receive_window),
            )
            .await
            .map_err(|e| self.failure("FetchFundingWallet", &client, &req.asset, e))?;
        Ok(Response::new(FetchFundingWalletResponse {
            balances: rows.iter().map(convert::funding_balance).collect(),
        }))
    }

    async fn fetch_order_book(&self, request: Request<MarketRequest>) -> Result<Response<FetchOrderBookResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchOrderBook", req.client_id)?;
        let limit = client.exchange().order_book_depth();
        let book = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_order_book(&req.symbol, limit),
            )
            .await
            .map_err(|e| self.failure("FetchOrderBook", &client, &req.symbol, e))?;
        Ok(Response::new(convert::order_book(&book)))
    }

    async fn fetch_symbol_price_ticker(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<FetchSymbolPriceTickerResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchSymbolPriceTicker", req.client_id)?;
        let ticker = self
            .rest(&client, CallClass::Default, client.adapter().fetch_symbol_price_ticker(&req.symbol))
            .await
            .map_err(|e| self.failure("FetchSymbolPriceTicker", &client, &req.symbol, e))?;
        Ok(Response::new(convert::price_ticker(&ticker)))
    }

    async fn fetch_ticker_price_change_statistics(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<FetchTickerPriceChangeStatisticsResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchTickerPriceChangeStatistics", req.client_id)?;
        let stats = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_ticker_price_change_statistics(&req.symbol),
            )
            .await
            .map_err(|e| self.failure("FetchTickerPriceChangeStatistics", &client, &req.symbol, e))?;
        Ok(Response::new(convert::ticker_statistics(&stats)))
    }

    async fn fetch_klines(&self, request: Request<FetchKlinesRequest>) -> Result<Response<FetchKlinesResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchKlines", req.client_id)?;
        let limit = u32::try_from(req.limit).ok().filter(|l| *l > 0);
        let rows = self
            .rest(
                &client,
                CallClass::Default,
                client.adapter().fetch_klines(&req.symbol, &req.interval, limit),
            )
            .await
            .map_err(|e| self.failure("FetchKlines", &client, &req.symbol, e))?;
        Ok(Response::new(FetchKlinesResponse {
            klines: convert::klines(&rows),
        }))
    }

    async fn fetch_account_trade_list(
        &self,
        request: Request<AccountTradeListRequest>,
    ) -> Result<Response<AccountTradeListResponse>, Status> {
        let req = request.into_inner();
        let client = self.client("FetchAccountTradeList", req.client_id)?;
        let start_time = (req.start_time > 0).then_some(req.start_time);
        let limit = u32::try_from(req.limit).ok().filter(|l| *l > 0);
        let trades = self
            .rest(
                &client,
                CallClass::Default,
                client
                    .adapter()
                    .fetch_account_trade_list(&req.trade_id, &req.symbol, start_time, limit),
            )
            .await
            .map_err(|e| self.failure("FetchAccountTradeList", &client, &req.symbol, e))?;
        Ok(Response::new(AccountTradeListResponse {
            items: trades.iter().map(convert::trade).collect(),
        }))
    }

    // ---- 流式订阅 ----

    type OnKlinesUpdateStream = RpcStream<OnKlinesUpdateResponse>;

    async fn on_klines_update(
        &self,
        request: Request<FetchKlinesRequest>,
    ) -> Result<Response<Self::OnKlinesUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnKlinesUpdate", req.client_id)?;
        let intervals: Vec<String> = serde_json::from_str(&req.interval).map_err(|e| {
            Status::from(GatewayError::InvalidParameter(format!(
                "interval must be a JSON list, got '{}': {}",
                req.interval, e
            )))
        })?;

        let queue = self.gateway.fifo_queue();
        client.add_queue(&req.trade_id, queue.clone());
        let symbol = client.stream_symbol(&req.symbol);
        for interval in &intervals {
            let event_type = format!("{}@kline_{}", symbol, interval);
            self.subscribe_market(&client, &queue, &req.trade_id, &event_type);
        }

        let stream = spawn_stream_loop("OnKlinesUpdate", client, queue, req.trade_id, |event| match event {
            StreamEvent::Kline(kline) => Some(convert::kline_event(&kline)),
            _ => None,
        });
        Ok(Response::new(stream))
    }

    type OnTickerUpdateStream = RpcStream<OnTickerUpdateResponse>;

    async fn on_ticker_update(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<Self::OnTickerUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnTickerUpdate", req.client_id)?;
        let queue = self.gateway.fifo_queue();
        client.add_queue(&req.trade_id, queue.clone());
        let event_type = format!("{}@miniTicker", client.stream_symbol(&req.symbol));
        self.subscribe_market(&client, &queue, &req.trade_id, &event_type);

        let stream = spawn_stream_loop("OnTickerUpdate", client, queue, req.trade_id, |event| match event {
            StreamEvent::MiniTicker(ticker) => Some(convert::ticker_event(&ticker)),
            _ => None,
        });
        Ok(Response::new(stream))
    }

    type OnOrderBookUpdateStream = RpcStream<FetchOrderBookResponse>;

    async fn on_order_book_update(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<Self::OnOrderBookUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnOrderBookUpdate", req.client_id)?;
        let queue = self.gateway.order_book_queue();
        client.add_queue(&req.trade_id, queue.clone());
        let event_type = format!("{}@depth5", client.stream_symbol(&req.symbol));
        self.subscribe_market(&client, &queue, &req.trade_id, &event_type);

        let stream = spawn_stream_loop("OnOrderBookUpdate", client, queue, req.trade_id, |event| match event {
            StreamEvent::OrderBook(book) => Some(convert::order_book_event(&book)),
            _ => None,
        });
        Ok(Response::new(stream))
    }

    type OnFundsUpdateStream = RpcStream<OnFundsUpdateResponse>;

    async fn on_funds_update(
        &self,
        request: Request<OnFundsUpdateRequest>,
    ) -> Result<Response<Self::OnFundsUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnFundsUpdate", req.client_id)?;
        let queue = self.gateway.fifo_queue();
        client.add_queue(&req.trade_id, queue.clone());
        self.subscribe_user(&client, &queue, &req.trade_id, "outboundAccountPosition");

        let stream = spawn_stream_loop("OnFundsUpdate", client, queue, req.trade_id, |event| match event {
            StreamEvent::AccountPosition(position) => match serde_json::to_string(&position.balances) {
                Ok(funds) => Some(OnFundsUpdateResponse { funds }),
                Err(e) => {
                    log::error!("OnFundsUpdate: cannot encode balances: {}", e);
                    None
                }
            },
            _ => None,
        });
        Ok(Response::new(stream))
    }

    type OnBalanceUpdateStream = RpcStream<OnBalanceUpdateResponse>;

    async fn on_balance_update(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<Self::OnBalanceUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnBalanceUpdate", req.client_id)?;
        let queue = self.gateway.fifo_queue();
        client.add_queue(&req.trade_id, queue.clone());
        if client.exchange().pushes_balance_updates() {
            self.subscribe_user(&client, &queue, &req.trade_id, "balanceUpdate");
        }

        let gateway = self.gateway.clone();
        let poll = gateway.heartbeat() * BALANCE_POLL_HEARTBEATS;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let MarketRequest { trade_id, symbol, .. } = req;
            loop {
                let next = tokio::select! {
                    next = tokio::time::timeout(poll, queue.get()) => next,
                    _ = tx.closed() => {
                        client_gone("OnBalanceUpdate", &client, &queue, &trade_id);
                        break;
                    }
                };
                let (events, dequeued) = match next {
                    Ok(QueueItem::Stop) => {
                        client.discard_queue(&trade_id, &queue);
                        log::info!("OnBalanceUpdate: Stop user stream for {}:{}", client.name(), symbol);
                        break;
                    }
                    Ok(QueueItem::Event(event)) => (vec![event], true),
                    Err(_) if client.exchange().polls_ledgers() => {
                        let ledgers = async {
                            gateway.rate_limit.wait(&client, CallClass::FetchLedgers).await;
                            let rows = client.adapter().fetch_ledgers(&symbol).await?;
                            client.touch();
                            rows.iter()
                                .map(|row| client.adapter().events().wrap_event(row))
                                .collect::<Result<Vec<_>, AdapterError>>()
                        };
                        match ledgers.await {
                            Ok(events) => (events, false),
                            Err(e) => {
                                if e.is_rate_limit() {
                                    gateway.rate_limit.arm();
                                }
                                log::warn!("OnBalanceUpdate: for {}:{}: {}", client.name(), symbol, e);
                                (Vec::new(), false)
                            }
                        }
                    }
                    Err(_) => (Vec::new(), false),
                };

                for event in events {
                    let StreamEvent::BalanceUpdate(balance) = event else {
                        continue;
                    };
                    if !symbol.contains(balance.asset.as_str()) {
                        continue;
                    }
                    let response = convert::balance_event(&balance);
                    log::debug!("OnBalanceUpdate: {}:{}: {}", client.name(), symbol, response.balance);
                    if tx.send(Ok(response)).await.is_err() {
                        client_gone("OnBalanceUpdate", &client, &queue, &trade_id);
                        return;
                    }
                }
                if dequeued {
                    queue.task_done();
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type OnOrderUpdateStream = RpcStream<SimpleResponse>;

    async fn on_order_update(
        &self,
        request: Request<MarketRequest>,
    ) -> Result<Response<Self::OnOrderUpdateStream>, Status> {
        let req = request.into_inner();
        let client = self.client("OnOrderUpdate", req.client_id)?;
        let queue = self.gateway.fifo_queue();
        client.set_order_update_queue(&req.trade_id, queue.clone());
        client.add_queue(&req.trade_id, queue.clone());
        self.subscribe_user(&client, &queue, &req.trade_id, "executionReport");

        let name = client.name().to_string();
        let stream = spawn_stream_loop("OnOrderUpdate", client, queue, req.trade_id, move |event| {
            match serde_json::to_string(&event) {
                Ok(result) => {
                    log::debug!("OnOrderUpdate: {}: {}", name, result);
                    Some(SimpleResponse { success: true, result })
                }
                Err(e) => {
                    log::error!("OnOrderUpdate: {}: cannot encode event: {}", name, e);
                    None
                }
            }
        });
        Ok(Response::new(stream))
    }

    // ---- 流控制 ----

    async fn start_stream(&self, request: Request<StartStreamRequest>) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        if req.update_max_queue_size {
            let size = self.gateway.bump_max_queue_size();
            log::info!("MAX_QUEUE_SIZE was updated: new value is {}", size);
        }
        let client = self.client("StartStream", req.client_id)?;

        let expected = usize::try_from(req.market_stream_count).unwrap_or(0);
        while client.adapter().events().registered_stream_count(&req.trade_id) < expected {
            tokio::time::sleep(self.gateway.heartbeat()).await;
        }

        log::info!("Start WS streams for {}", client.name());
        let adapter = client.adapter();
        if let Err(e) = adapter.start_market_events_listener(&req.trade_id).await {
            return Err(self.failure("StartStream", &client, &req.symbol, e.into()));
        }
        if let Err(e) = adapter.start_user_events_listener(&req.trade_id, &req.symbol).await {
            return Err(self.failure("StartStream", &client, &req.symbol, e.into()));
        }
        Ok(Response::new(SimpleResponse {
            success: true,
            result: String::new(),
        }))
    }

    async fn stop_stream(&self, request: Request<MarketRequest>) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        let success = match self.gateway.registry.get(req.client_id) {
            Some(client) if client.knows_trade(&req.trade_id) => {
                log::info!("StopStream request for {} on {}", req.symbol, client.exchange());
                stop_stream(&client, &req.trade_id).await;
                true
            }
            Some(client) => {
                log::info!("StopStream: nothing registered for {} on {}", req.trade_id, client.name());
                false
            }
            None => false,
        };
        Ok(Response::new(SimpleResponse {
            success,
            result: String::new(),
        }))
    }

    async fn check_stream(&self, request: Request<MarketRequest>) -> Result<Response<SimpleResponse>, Status> {
        let req = request.into_inner();
        let success = self
            .gateway
            .registry
            .get(req.client_id)
            .map(|client| client.adapter().has_data_streams(&req.trade_id))
            .unwrap_or(false);
        if !success {
            log::warn!("CheckStream request failed for {}", req.symbol);
        }
        Ok(Response::new(SimpleResponse {
            success,
            result: String::new(),
        }))
    }
}
