//! Registry transport module
//!
//! - `types`: 注册表数据结构（实例集合、全量快照、增量）
//! - `transport`: 注册中心传输接口与错误类型
//! - `grpc_impl`: 基于 tonic 的 gRPC 传输实现
//! - `memory`: 单节点内存注册中心

pub mod grpc_impl;
pub mod memory;
pub mod proto;
pub mod transport;
pub mod types;

pub use grpc_impl::{GrpcRegistryTransport, GrpcTransportConfig};
pub use memory::{InMemoryRegistry, InMemoryRegistryConfig};
pub use transport::{RegistryTransport, TransportError};
pub use types::{FetchDelta, RegistryEntry, RegistrySnapshot};
