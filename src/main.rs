//! exch-srv: 多交易所 gRPC 网关服务
//!
//! 运行: cargo run --bin exch-srv -- --config config/exch_srv_cfg.toml

use anyhow::Context;
use exchanges_wrapper::adapter::paper::PaperFactory;
use exchanges_wrapper::adapter::{AdapterRegistry, ExchangeId};
use exchanges_wrapper::server;
use exchanges_wrapper::utils::config::ServerConfig;
use exchanges_wrapper::utils::logging;
use exchanges_wrapper::utils::tasks::TaskRegistry;
use std::path::PathBuf;
use std::sync::Arc;

const EXCHANGES: [ExchangeId; 5] = [
    ExchangeId::Binance,
    ExchangeId::Bitfinex,
    ExchangeId::Huobi,
    ExchangeId::Okx,
    ExchangeId::Bybit,
];

fn config_arg() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = None;
    for i in 0..args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    cli = Some(PathBuf::from(&args[i + 1]));
                }
            }
            arg => {
                if let Some(path) = arg.strip_prefix("--config=") {
                    cli = Some(PathBuf::from(path));
                }
            }
        }
    }
    cli
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 配置
    let config_path = ServerConfig::resolve_path(config_arg());
    let (config, config_error) = match ServerConfig::load_from_file(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (ServerConfig::default(), Some(e)),
    };

    // 2. 日志
    logging::init(&config.server.log_file)
        .with_context(|| format!("cannot open log file {}", config.server.log_file.display()))?;
    if let Some(e) = config_error {
        log::warn!("{} ({}), using defaults", e, config_path.display());
    }
    log::info!("exch-srv {} starting", exchanges_wrapper::SRV_VERSION);
    log::info!("  Listen: {}", config.server.listen_address());
    log::info!("  Heartbeat: {:?}", config.server.heartbeat());
    log::info!("  Max queue size: {}", config.server.max_queue_size);

    // 3. 适配器
    let tasks = Arc::new(TaskRegistry::new());
    let adapters = AdapterRegistry::new();
    if config.server.paper_trading {
        let paper = Arc::new(PaperFactory::new(tasks.clone(), Some(config.server.heartbeat())));
        for exchange in EXCHANGES {
            adapters.register(exchange, paper.clone());
        }
        log::info!("Paper trading adapters registered for all exchanges");
    } else {
        log::warn!("paper_trading disabled and no live adapters registered: sessions will be refused");
    }

    // 4. 服务
    server::run(&config, config_path, Arc::new(adapters), tasks)
        .await
        .context("gRPC server failed")?;
    log::info!("exch-srv stopped");
    Ok(())
}
