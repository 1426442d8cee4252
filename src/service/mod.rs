//! 服务层
//!
//! - `grpc`: Martin gRPC 服务 (一元调用 + 流式订阅)
//! - `convert`: 适配器 JSON → gRPC 消息

pub mod convert;
pub mod grpc;
