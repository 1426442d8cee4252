// 集成测试公共设施
//
// 临时 TOML (服务参数 + 账户 + 端点) → Gateway (模拟盘工厂) → MartinServiceImpl，
// 测试直接调用 Martin trait 方法，并通过 PaperFactory 取回适配器实例注入事件。

#![allow(dead_code)]

use exchanges_wrapper::adapter::paper::{PaperExchange, PaperFactory};
use exchanges_wrapper::gateway::registry::OpenClient;
use exchanges_wrapper::service::grpc::proto::{MarketRequest, OpenClientConnectionRequest};
use exchanges_wrapper::service::grpc::Martin;
use exchanges_wrapper::utils::config::ServerConfig;
use exchanges_wrapper::utils::tasks::TaskRegistry;
use exchanges_wrapper::{Gateway, MartinServiceImpl};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tonic::Request;

pub const BINANCE: &str = "Test - Binance";
pub const BITFINEX: &str = "Test - Bitfinex";
pub const HUOBI: &str = "Test - Huobi";
pub const HUOBI_SUB: &str = "Test - Huobi Sub";
pub const BYBIT: &str = "Test - Bybit";

pub const SYMBOL: &str = "BTCUSDT";

/// 心跳 10ms，队列容量 10
pub const SERVER: &str = r#"
[server]
host = "127.0.0.1"
port = 0
log_file = "log/test.log"
heartbeat_secs = 0.01
max_queue_size = 10
rate_limit_reset_secs = 30
paper_trading = true
"#;

const RATE_LIMITS: &str = r#"
[rate_limit.bitfinex]
default = 1.0
create_order = 0.5
cancel_order = 0.5
"#;

const ACCOUNTS: &str = r#"
[[accounts]]
exchange = "binance"
name = "Test - Binance"
api_key = "key"
api_secret = "secret"

[[accounts]]
exchange = "bitfinex"
name = "Test - Bitfinex"
api_key = "key"
api_secret = "secret"

[[accounts]]
exchange = "huobi"
name = "Test - Huobi"
api_key = "key"
api_secret = "secret"

[[accounts]]
exchange = "huobi"
name = "Test - Huobi Sub"
api_key = "key"
api_secret = "secret"
master_name = "Test - Huobi"

[[accounts]]
exchange = "bybit"
name = "Test - Bybit"
api_key = "key"
api_secret = "secret"

[endpoint.binance]
api_public = "https://api.binance.com"
api_auth = "https://api.binance.com"
ws_public = "wss://stream.binance.com:9443"
ws_auth = "wss://stream.binance.com:9443"

[endpoint.bitfinex]
api_public = "https://api-pub.bitfinex.com"
api_auth = "https://api.bitfinex.com"
ws_public = "wss://api-pub.bitfinex.com/ws/2"
ws_auth = "wss://api.bitfinex.com/ws/2"

[endpoint.huobi]
api_public = "https://api.huobi.pro"
api_auth = "https://api.huobi.pro"
ws_public = "wss://api.huobi.pro/ws"
ws_auth = "wss://api.huobi.pro/ws/v2"
ws_public_mbr = "wss://api.huobi.pro/feed"

[endpoint.bybit]
api_public = "https://api.bybit.com"
api_auth = "https://api.bybit.com"
ws_public = "wss://stream.bybit.com/v5/public/spot"
ws_auth = "wss://stream.bybit.com/v5/private"
"#;

pub struct Harness {
    pub service: MartinServiceImpl,
    pub factory: Arc<PaperFactory>,
    pub tasks: Arc<TaskRegistry>,
    _config: NamedTempFile,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_server(SERVER)
    }

    /// 自定义 `[server]` 段
    pub fn with_server(server: &str) -> Self {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}{}{}", server, RATE_LIMITS, ACCOUNTS).unwrap();
        file.flush().unwrap();

        let config = ServerConfig::load_from_file(file.path()).unwrap();
        let tasks = Arc::new(TaskRegistry::new());
        let factory = Arc::new(PaperFactory::new(tasks.clone(), None));
        let gateway = Gateway::new(&config, file.path(), factory.clone(), tasks.clone());

        Self {
            service: MartinServiceImpl::new(Arc::new(gateway)),
            factory,
            tasks,
            _config: file,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        self.service.gateway()
    }

    /// OpenClientConnection，返回 client_id
    pub async fn open(&self, account: &str, trade_id: &str) -> i64 {
        self.service
            .open_client_connection(Request::new(OpenClientConnectionRequest {
                trade_id: trade_id.to_string(),
                account_name: account.to_string(),
                symbol: SYMBOL.to_string(),
                rate_limiter: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .client_id
    }

    pub fn paper(&self, account: &str) -> Arc<PaperExchange> {
        self.factory.instance(account).unwrap()
    }

    pub fn client(&self, client_id: i64) -> Arc<OpenClient> {
        self.gateway().client(client_id).unwrap()
    }
}

pub fn market(client_id: i64, trade_id: &str) -> Request<MarketRequest> {
    Request::new(MarketRequest {
        client_id,
        trade_id: trade_id.to_string(),
        symbol: SYMBOL.to_string(),
        amount: String::new(),
    })
}
