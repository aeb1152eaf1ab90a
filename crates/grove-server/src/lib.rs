pub mod broadcast;
pub mod channel;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use registry::{Channel, ChannelRegistry, ChannelState, DeliveryError};
pub use server::{start, AppState, ServerConfig, ServerHandle, DEFAULT_CORS_ORIGINS};
