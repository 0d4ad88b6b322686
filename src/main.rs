use std::sync::Arc;
use std::time::Duration;

use grpc_discovery::config::ClientConfig;
use grpc_discovery::services::registry::{
    GrpcRegistryTransport, InMemoryRegistry, InMemoryRegistryConfig, RegistryTransport,
};
use grpc_discovery::services::{DiscoveryClient, InstanceStatus};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const MAX_STARTUP_ATTEMPTS: u32 = 5;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::load()?;
    let descriptor = config.instance_descriptor()?;
    let shutdown = CancellationToken::new();

    let transport: Arc<dyn RegistryTransport> = if config.is_in_memory() {
        tracing::info!("Using in-process registry");
        let registry = InMemoryRegistry::new(InMemoryRegistryConfig {
            lease_duration: config.lease_duration(),
            ..InMemoryRegistryConfig::default()
        });
        registry.spawn_eviction_task(Duration::from_secs(30), shutdown.clone());
        Arc::new(registry)
    } else {
        tracing::info!(address = %config.registry.address, "Connecting to registry");
        Arc::new(GrpcRegistryTransport::connect_lazy(&config.transport_config())?)
    };

    // 未指定查询目标时查询自己所在的服务
    let target = std::env::var("DISCOVERY_LOOKUP_TARGET").ok().or_else(|| {
        descriptor
            .as_ref()
            .map(|descriptor| descriptor.service_name().to_string())
    });
    let instance_id = descriptor
        .as_ref()
        .map(|descriptor| descriptor.instance_id().to_string());
    let lookup_interval = config.fetch_interval();
    let backoff = config.backoff_policy();

    let client = DiscoveryClient::new(config, transport);
    // 注册中心暂时不可用时按退避策略重试启动
    let mut attempt = 0;
    loop {
        match client.start(descriptor.clone()).await {
            Ok(()) => break,
            Err(e) if e.is_transient() && attempt < MAX_STARTUP_ATTEMPTS => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Discovery client startup failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Discovery client startup failed");
                client.shutdown().await;
                shutdown.cancel();
                return Err(e.into());
            }
        }
    }

    if let Some(instance_id) = &instance_id {
        client.update_status(instance_id, InstanceStatus::Up).await?;
    }

    let mut ticker = tokio::time::interval(lookup_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                let Some(target) = &target else { continue };
                match client.next_up_instance(target) {
                    Ok(Some(instance)) => {
                        tracing::info!(
                            service_name = %target,
                            instance_id = %instance.instance_id(),
                            address = %instance.address(),
                            "Selected instance"
                        );
                    }
                    Ok(None) => tracing::info!(service_name = %target, "No UP instance available"),
                    Err(e) => tracing::warn!(service_name = %target, error = %e, "Lookup failed"),
                }
            }
        }
    }

    client.shutdown().await;
    shutdown.cancel();
    Ok(())
}
