//! 服务生命周期
//!
//! 启动前检查端口占用，注册 Martin 服务并监听；收到关闭信号后结束全部订阅、
//! 取消保活任务、关闭会话，再等待 tonic 完成优雅关闭。

use crate::adapter::AdapterFactory;
use crate::gateway::Gateway;
use crate::service::grpc::MartinServiceImpl;
use crate::utils::config::ServerConfig;
use crate::utils::tasks::TaskRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("gRPC server port {0} already used")]
    PortInUse(u16),

    #[error("Cannot resolve listen address {0}")]
    Resolve(String),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 端口上已有监听者
pub async fn is_port_in_use(host: &str, port: u16) -> bool {
    TcpStream::connect((host, port)).await.is_ok()
}

async fn resolve(address: &str) -> Result<SocketAddr, ServerError> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ServerError::Resolve(address.to_string()))
}

fn router(gateway: Arc<Gateway>) -> Router {
    Server::builder().add_service(MartinServiceImpl::new(gateway).into_server())
}

/// 监听 `addr` 直到 `signal` 完成，随后关闭网关
pub async fn serve_with_shutdown<F>(gateway: Arc<Gateway>, addr: SocketAddr, signal: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    log::info!("Starting gRPC server at {}", addr);
    let shutdown_gateway = gateway.clone();
    router(gateway)
        .serve_with_shutdown(addr, async move {
            signal.await;
            shutdown_gateway.shutdown().await;
        })
        .await?;
    log::info!("gRPC server stopped");
    Ok(())
}

/// 在已绑定的监听器上服务 (端口 0 测试用)
pub async fn serve_with_listener<F>(gateway: Arc<Gateway>, listener: TcpListener, signal: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    log::info!("Starting gRPC server at {}", listener.local_addr()?);
    let shutdown_gateway = gateway.clone();
    router(gateway)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.await;
            shutdown_gateway.shutdown().await;
        })
        .await?;
    log::info!("gRPC server stopped");
    Ok(())
}

/// 进程入口：端口检查 → 服务 → Ctrl-C 关闭
pub async fn run(
    config: &ServerConfig,
    config_path: PathBuf,
    factory: Arc<dyn AdapterFactory>,
    tasks: Arc<TaskRegistry>,
) -> Result<(), ServerError> {
    let port = config.server.port;
    if is_port_in_use(&config.server.host, port).await {
        return Err(ServerError::PortInUse(port));
    }
    let addr = resolve(&config.server.listen_address()).await?;

    log::info!("Accounts config: {}", config_path.display());
    let gateway = Arc::new(Gateway::new(config, config_path, factory, tasks));
    serve_with_shutdown(gateway, addr, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received SIGINT, shutting down"),
            Err(e) => {
                log::error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    })
    .await
}
