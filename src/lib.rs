//! gRPC 服务注册与发现客户端

pub mod config;
pub mod error;
pub mod services;

pub use config::ClientConfig;
pub use error::{DiscoveryError, Result};
pub use services::{ClientState, DiscoveryClient, InstanceDescriptor, InstanceStatus};
