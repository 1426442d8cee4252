// 流式订阅场景测试
//
// 订单簿只推最新快照、队列满关闭订阅、StopStream 结束循环、
// 撤单成交补偿、余额流推送与 REST 轮询、服务优雅关闭
//
// 运行：cargo test --test stream_scenario_test

mod common;

use common::*;
use exchanges_wrapper::server;
use exchanges_wrapper::service::grpc::proto::martin_client::MartinClient;
use exchanges_wrapper::service::grpc::proto::*;
use exchanges_wrapper::service::grpc::Martin;
use exchanges_wrapper::ExchangeAdapter;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tonic::Request;

fn klines_request(client_id: i64, trade_id: &str, intervals: &str) -> Request<FetchKlinesRequest> {
    Request::new(FetchKlinesRequest {
        client_id,
        trade_id: trade_id.to_string(),
        symbol: SYMBOL.to_string(),
        interval: intervals.to_string(),
        limit: 0,
    })
}

fn start_request(client_id: i64, market_stream_count: i32, update_max_queue_size: bool) -> Request<StartStreamRequest> {
    Request::new(StartStreamRequest {
        client_id,
        trade_id: "t1".to_string(),
        symbol: SYMBOL.to_string(),
        market_stream_count,
        update_max_queue_size,
    })
}

fn kline(close: &str) -> Value {
    json!({
        "e": "kline", "E": 1700000060000i64, "s": SYMBOL,
        "k": {
            "t": 1700000000000i64, "T": 1700000059999i64, "s": SYMBOL, "i": "1m",
            "o": "100", "c": close, "h": "101", "l": "99", "v": "10",
            "n": 3, "x": false, "q": "1000", "V": "5", "Q": "500"
        }
    })
}

fn mini_ticker(close: &str) -> Value {
    json!({
        "e": "24hrMiniTicker", "E": 1700000000000i64, "s": SYMBOL,
        "c": close, "o": "100", "h": "101", "l": "99", "v": "10", "q": "1000"
    })
}

async fn place_order(h: &Harness, client_id: i64, client_order_id: i64) -> i64 {
    h.service
        .create_limit_order(Request::new(CreateLimitOrderRequest {
            client_id,
            trade_id: "t1".to_string(),
            symbol: SYMBOL.to_string(),
            buy_side: true,
            quantity: "1.0".to_string(),
            price: "100".to_string(),
            new_client_order_id: client_order_id,
        }))
        .await
        .unwrap()
        .into_inner()
        .order_id
}

// ============================================================================
// 行情流
// ============================================================================

#[tokio::test]
async fn test_order_book_stream_delivers_latest_snapshot() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut stream = h.service.on_order_book_update(market(id, "t1")).await.unwrap().into_inner();

    // 消费循环尚未运行，三个快照都在队列里
    for update_id in 1..=3 {
        let delivered = paper
            .emit(
                "btcusdt@depth5",
                json!({"lastUpdateId": update_id, "bids": [["99.5", "2"]], "asks": [["100.5", "1"]]}),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    let book = stream.next().await.unwrap().unwrap();
    assert_eq!(book.last_update_id, 3);
    assert_eq!(book.bids, vec![r#"["99.5","2"]"#]);
    assert_eq!(book.asks, vec![r#"["100.5","1"]"#]);
    assert!(h.client(id).queues("t1")[0].is_empty());
}

#[tokio::test]
async fn test_klines_stream() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut stream = h.service.on_klines_update(klines_request(id, "t1", r#"["1m", "5m"]"#)).await.unwrap().into_inner();
    assert_eq!(
        paper.events().market_streams("t1"),
        vec!["btcusdt@kline_1m", "btcusdt@kline_5m"]
    );

    paper.emit("btcusdt@kline_1m", kline("100.7")).await.unwrap();
    let update = stream.next().await.unwrap().unwrap();
    assert_eq!(update.symbol, SYMBOL);
    assert_eq!(update.interval, "1m");
    let candle: Value = serde_json::from_str(&update.candle).unwrap();
    assert_eq!(candle[0], 1700000000000i64);
    assert_eq!(candle[4], "100.7");
    assert_eq!(candle[6], 1700000059999i64);
}

#[tokio::test]
async fn test_klines_stream_rejects_bad_interval() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;

    let status = h.service.on_klines_update(klines_request(id, "t1", "1m")).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(!h.client(id).knows_trade("t1"));
}

#[tokio::test]
async fn test_queue_overflow_closes_subscription() {
    let h = Harness::with_server(&SERVER.replace("max_queue_size = 10", "max_queue_size = 2"));
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut stream = h.service.on_klines_update(klines_request(id, "t1", r#"["1m"]"#)).await.unwrap().into_inner();
    let started = h.service.start_stream(start_request(id, 1, false)).await.unwrap().into_inner();
    assert!(started.success);
    assert!(h.service.check_stream(market(id, "t1")).await.unwrap().into_inner().success);

    // 第三条事件溢出 → 关闭订阅并执行停止流程
    for close in ["100.1", "100.2", "100.3"] {
        paper.emit("btcusdt@kline_1m", kline(close)).await.unwrap();
    }

    assert!(stream.next().await.is_none());
    let client = h.client(id);
    tokio::time::timeout(Duration::from_secs(1), async {
        while client.knows_trade("t1") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    assert!(!h.service.check_stream(market(id, "t1")).await.unwrap().into_inner().success);
    assert!(h.client(id).queues("t1").is_empty());
    assert!(!paper.events().has_registrations("t1"));
    assert!(!h.tasks.running().iter().any(|name| name.contains("-t1-")));
}

#[tokio::test]
async fn test_stop_stream_ends_only_its_trade() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut ticker_t1 = h.service.on_ticker_update(market(id, "t1")).await.unwrap().into_inner();
    let mut klines_t1 = h.service.on_klines_update(klines_request(id, "t1", r#"["1m"]"#)).await.unwrap().into_inner();
    let mut ticker_t2 = h.service.on_ticker_update(market(id, "t2")).await.unwrap().into_inner();

    let stopped = h.service.stop_stream(market(id, "t1")).await.unwrap().into_inner();
    assert!(stopped.success);
    assert!(ticker_t1.next().await.is_none());
    assert!(klines_t1.next().await.is_none());

    // t2 仍在推送
    let delivered = paper.emit("btcusdt@miniTicker", mini_ticker("100.9")).await.unwrap();
    assert_eq!(delivered, 1);
    let update = ticker_t2.next().await.unwrap().unwrap();
    assert_eq!(update.symbol, SYMBOL);
    assert_eq!(update.open_price, "100");
    assert_eq!(update.close_price, "100.9");

    // 重复停止
    let again = h.service.stop_stream(market(id, "t1")).await.unwrap().into_inner();
    assert!(!again.success);
}

#[tokio::test(start_paused = true)]
async fn test_start_stream_waits_for_registrations() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;

    let subscribe = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ticker = h.service.on_ticker_update(market(id, "t1")).await.unwrap().into_inner();
        let book = h.service.on_order_book_update(market(id, "t1")).await.unwrap().into_inner();
        (ticker, book)
    };
    let started_at = tokio::time::Instant::now();
    let (started, _streams) = tokio::join!(h.service.start_stream(start_request(id, 2, true)), subscribe);

    assert!(started.unwrap().into_inner().success);
    assert!(started_at.elapsed() >= Duration::from_millis(50));
    assert_eq!(h.gateway().max_queue_size(), 11);
    assert!(h.service.check_stream(market(id, "t1")).await.unwrap().into_inner().success);

    let running = h.tasks.running();
    assert!(running.contains(&format!("{}-t1-market-keepalive-heartbeat", BINANCE)));
    assert!(running.contains(&format!("{}-t1-user-keepalive-heartbeat", BINANCE)));
}

// ============================================================================
// 用户流
// ============================================================================

#[tokio::test]
async fn test_cancel_partially_filled_order_emits_trades() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let order_id = place_order(&h, id, 777).await;
    // 订阅之前的成交不会推送 executionReport
    paper.fill_order(order_id, "0.5", "100").await.unwrap();

    let mut updates = h.service.on_order_update(market(id, "t1")).await.unwrap().into_inner();
    let canceled = h
        .service
        .cancel_order(Request::new(CancelOrderRequest {
            client_id: id,
            trade_id: "t1".to_string(),
            symbol: SYMBOL.to_string(),
            order_id,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(canceled.status, "CANCELED");
    assert_eq!(canceled.executed_qty, "0.5");
    assert_eq!(canceled.orig_client_order_id, "777");

    let update = updates.next().await.unwrap().unwrap();
    assert!(update.success);
    let event: Value = serde_json::from_str(&update.result).unwrap();
    assert_eq!(event["event_type"], "executionReport");
    assert_eq!(event["order_id"], order_id);
    assert_eq!(event["order_status"], "CANCELED");
    assert_eq!(event["client_order_id"], "777");
    assert_eq!(event["last_executed_quantity"], "0.5");
    assert_eq!(event["cumulative_filled_quantity"], "0.5");
}

#[tokio::test]
async fn test_order_update_stream_forwards_execution_reports() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut updates = h.service.on_order_update(market(id, "t1")).await.unwrap().into_inner();
    let order_id = place_order(&h, id, 778).await;
    paper.fill_order(order_id, "0.25", "99").await.unwrap();

    let update = updates.next().await.unwrap().unwrap();
    let event: Value = serde_json::from_str(&update.result).unwrap();
    assert_eq!(event["event_type"], "executionReport");
    assert_eq!(event["x"], "TRADE");
    assert_eq!(event["X"], "PARTIALLY_FILLED");
    assert_eq!(event["i"], order_id);
    assert_eq!(event["c"], "778");
    assert_eq!(event["l"], "0.25");
}

#[tokio::test]
async fn test_funds_stream() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut funds = h
        .service
        .on_funds_update(Request::new(OnFundsUpdateRequest {
            client_id: id,
            trade_id: "t1".to_string(),
            symbol: SYMBOL.to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    let order_id = place_order(&h, id, 779).await;
    paper.fill_order(order_id, "0.5", "100").await.unwrap();

    let update = funds.next().await.unwrap().unwrap();
    let balances: Value = serde_json::from_str(&update.funds).unwrap();
    assert_eq!(balances["BTC"]["free"], "10.5");
    assert_eq!(balances["BTC"]["locked"], "0");
    assert!(balances.get("USDT").is_some());
}

#[tokio::test]
async fn test_balance_stream_filters_by_symbol() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);

    let mut balances = h.service.on_balance_update(market(id, "t1")).await.unwrap().into_inner();
    paper
        .emit_user("balanceUpdate", json!({"e": "balanceUpdate", "E": 1, "a": "XRP", "d": "5", "T": 1}))
        .await
        .unwrap();
    paper
        .emit_user("balanceUpdate", json!({"e": "balanceUpdate", "E": 2, "a": "BTC", "d": "0.1", "T": 2}))
        .await
        .unwrap();

    let update = balances.next().await.unwrap().unwrap();
    let balance: Value = serde_json::from_str(&update.balance).unwrap();
    assert_eq!(balance["asset"], "BTC");
    assert_eq!(balance["balance_delta"], "0.1");
    assert_eq!(balance["event_time"], 2);
    assert!(!paper.calls().iter().any(|c| c == "fetch_ledgers"));
}

#[tokio::test(start_paused = true)]
async fn test_balance_stream_polls_ledgers() {
    let h = Harness::new();
    let id = h.open(HUOBI, "t1").await;
    let paper = h.paper(HUOBI);
    paper.push_ledger(json!({"e": "balanceUpdate", "E": 5, "a": "XRP", "d": "7", "T": 5}));
    paper.push_ledger(json!({"e": "balanceUpdate", "E": 6, "a": "BTC", "d": "-0.2", "T": 6}));

    let started_at = tokio::time::Instant::now();
    let mut balances = h.service.on_balance_update(market(id, "t1")).await.unwrap().into_inner();
    let update = balances.next().await.unwrap().unwrap();

    // 30 个心跳没有推送后轮询
    assert!(started_at.elapsed() >= Duration::from_millis(250));
    let balance: Value = serde_json::from_str(&update.balance).unwrap();
    assert_eq!(balance["asset"], "BTC");
    assert_eq!(balance["balance_delta"], "-0.2");
    assert!(paper.calls().iter().any(|c| c == "fetch_ledgers"));
}

#[tokio::test]
async fn test_dropped_idle_stream_releases_queue() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;

    let ticker = h.service.on_ticker_update(market(id, "t1")).await.unwrap().into_inner();
    let balance = h.service.on_balance_update(market(id, "t1")).await.unwrap().into_inner();
    assert_eq!(h.client(id).queues("t1").len(), 2);

    // 没有任何事件到达，断开也要被发现
    drop(ticker);
    drop(balance);
    let client = h.client(id);
    tokio::time::timeout(Duration::from_secs(1), async {
        while !client.queues("t1").is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// 服务关闭
// ============================================================================

#[tokio::test]
async fn test_gateway_shutdown_order() {
    let h = Harness::new();
    let id = h.open(BINANCE, "t1").await;
    let paper = h.paper(BINANCE);
    h.tasks.spawn("session-keepalive-heartbeat", std::future::pending());

    let mut ticker = h.service.on_ticker_update(market(id, "t1")).await.unwrap().into_inner();
    assert!(h.service.start_stream(start_request(id, 1, false)).await.unwrap().into_inner().success);

    h.gateway().shutdown().await;

    // 订阅先经停止流程结束，剩余保活任务随后取消
    assert!(ticker.next().await.is_none());
    assert!(!paper.has_data_streams("t1"));
    assert!(!paper.events().has_registrations("t1"));
    assert!(h.tasks.running().is_empty());
    assert!(h.gateway().registry.is_empty());
    assert!(paper.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_shutdown_ends_streams() {
    let h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server::serve_with_listener(h.gateway().clone(), listener, async move {
        let _ = stop_rx.await;
    }));

    let mut client = MartinClient::connect(format!("http://{}", addr)).await.unwrap();
    let opened = client
        .open_client_connection(OpenClientConnectionRequest {
            trade_id: "t1".to_string(),
            account_name: BINANCE.to_string(),
            symbol: SYMBOL.to_string(),
            rate_limiter: 0,
        })
        .await
        .unwrap()
        .into_inner();
    let mut ticker = client
        .on_ticker_update(MarketRequest {
            client_id: opened.client_id,
            trade_id: "t1".to_string(),
            symbol: SYMBOL.to_string(),
            amount: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    client
        .start_stream(StartStreamRequest {
            client_id: opened.client_id,
            trade_id: "t1".to_string(),
            symbol: SYMBOL.to_string(),
            market_stream_count: 1,
            update_max_queue_size: false,
        })
        .await
        .unwrap();
    assert!(h.tasks.running().iter().any(|name| name.contains("keepalive-heartbeat")));

    stop_tx.send(()).unwrap();

    let end = tokio::time::timeout(Duration::from_secs(5), ticker.message()).await.unwrap();
    assert!(matches!(end, Ok(None)));
    drop(ticker);
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!h.tasks.running().iter().any(|name| name.contains("keepalive")));
    assert!(h.gateway().registry.is_empty());
    assert!(h.paper(BINANCE).is_closed());
}
