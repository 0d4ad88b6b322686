use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tonic_prost::ProstCodec;

use super::proto;
use super::transport::{RegistryTransport, TransportError};
use super::types::{FetchDelta, RegistrySnapshot};
use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};

/// gRPC 注册中心连接配置
#[derive(Debug, Clone)]
pub struct GrpcTransportConfig {
    /// 注册中心地址
    pub registry_address: String,
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 单次请求超时时间
    pub request_timeout: Duration,
}

impl Default for GrpcTransportConfig {
    fn default() -> Self {
        Self {
            registry_address: "http://localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// 基于 tonic 的注册中心传输实现，对应 `discovery.Registry` 服务
#[derive(Debug, Clone)]
pub struct GrpcRegistryTransport {
    client: Grpc<Channel>,
}

impl GrpcRegistryTransport {
    /// 惰性连接，首次调用时才建立连接；注册中心暂时不可用时也能创建客户端
    pub fn connect_lazy(config: &GrpcTransportConfig) -> Result<Self, TransportError> {
        Ok(Self::from_channel(Self::endpoint(config)?.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: Grpc::new(channel),
        }
    }

    fn endpoint(config: &GrpcTransportConfig) -> Result<Endpoint, TransportError> {
        let endpoint = Endpoint::from_shared(config.registry_address.clone())
            .map_err(|e| TransportError::Rejected(format!("invalid registry address: {e}")))?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);
        Ok(endpoint)
    }

    async fn unary<Req, Resp>(&self, method: &'static str, request: Req) -> Result<Resp, TransportError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut client = self.client.clone();
        client
            .ready()
            .await
            .map_err(|e| TransportError::Unavailable(format!("Service was not ready: {e}")))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let path = PathAndQuery::from_static(method);
        let response = client
            .unary(Request::new(request), path, codec)
            .await
            .map_err(map_status)?;
        Ok(response.into_inner())
    }
}

fn map_status(status: Status) -> TransportError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unavailable | Code::Aborted | Code::ResourceExhausted => {
            TransportError::Unavailable(message)
        }
        Code::DeadlineExceeded => TransportError::Timeout(Duration::ZERO),
        Code::NotFound => TransportError::NotFound(message),
        // 注册中心用 OUT_OF_RANGE 表示增量版本断层
        Code::OutOfRange => TransportError::VersionGap {
            requested: 0,
            current: 0,
        },
        _ => TransportError::Rejected(format!("{:?}: {message}", status.code())),
    }
}

#[async_trait]
impl RegistryTransport for GrpcRegistryTransport {
    async fn register_instance(&self, instance: &InstanceDescriptor) -> Result<(), TransportError> {
        let request = proto::RegisterRequest {
            instance: Some(proto::Instance::from(instance)),
        };
        let _: proto::Ack = self.unary("/discovery.Registry/Register", request).await?;
        Ok(())
    }

    async fn renew_lease(&self, key: &InstanceKey) -> Result<(), TransportError> {
        let _: proto::Ack = self
            .unary("/discovery.Registry/Renew", proto::InstanceRef::from(key))
            .await?;
        Ok(())
    }

    async fn deregister_instance(&self, key: &InstanceKey) -> Result<(), TransportError> {
        let result: Result<proto::Ack, _> = self
            .unary("/discovery.Registry/Deregister", proto::InstanceRef::from(key))
            .await;
        match result {
            // 已经不存在的实例视为注销成功
            Ok(_) | Err(TransportError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update_status(
        &self,
        key: &InstanceKey,
        status: InstanceStatus,
    ) -> Result<(), TransportError> {
        let request = proto::StatusUpdateRequest {
            instance: Some(proto::InstanceRef::from(key)),
            status: proto::Status::from(status) as i32,
        };
        let _: proto::Ack = self.unary("/discovery.Registry/UpdateStatus", request).await?;
        Ok(())
    }

    async fn current_version(&self) -> Result<u64, TransportError> {
        let response: proto::VersionResponse = self
            .unary("/discovery.Registry/CurrentVersion", proto::VersionRequest {})
            .await?;
        Ok(response.version)
    }

    async fn fetch_full_registry(&self) -> Result<RegistrySnapshot, TransportError> {
        let response: proto::FetchRegistryResponse = self
            .unary("/discovery.Registry/FetchRegistry", proto::FetchRegistryRequest {})
            .await?;
        Ok(response.into())
    }

    async fn fetch_delta(&self, since_version: u64) -> Result<FetchDelta, TransportError> {
        let response: Result<proto::FetchDeltaResponse, _> = self
            .unary(
                "/discovery.Registry/FetchDelta",
                proto::FetchDeltaRequest { since_version },
            )
            .await;
        match response {
            Ok(delta) => Ok(delta.into()),
            Err(TransportError::VersionGap { .. }) => Err(TransportError::VersionGap {
                requested: since_version,
                current: 0,
            }),
            Err(e) => Err(e),
        }
    }
}
