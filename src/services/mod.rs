pub mod cache;
pub mod discovery_client;
pub mod event;
pub mod fetcher;
pub mod heartbeat;
pub mod instance;
pub mod registration;
pub mod registry;

pub use cache::LocalDiscoveryCache;
pub use discovery_client::{ClientState, DiscoveryClient};
pub use event::{ClientEvent, ClientEventKind, EventBus};
pub use fetcher::RegistryFetcher;
pub use heartbeat::HeartbeatSender;
pub use instance::{InstanceDescriptor, InstanceKey, InstanceStatus};
pub use registration::RegistrationManager;
pub use registry::{
    GrpcRegistryTransport, InMemoryRegistry, RegistryEntry, RegistryTransport, TransportError,
};
