pub mod event_bus;
pub mod types;

pub use event_bus::EventBus;
pub use types::{ClientEvent, ClientEventKind, EventConfig, EventStats};
