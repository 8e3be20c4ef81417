//! Websocket client for the templink cache.
//!
//! Provides the production [`Connection`](templink_cache::Connection)
//! implementation, the reconnecting session manager, device id persistence
//! and the configuration used by the `templink` binary.

pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod realtime;
pub mod telemetry;
pub mod ws;

pub use config::{ClientConfig, ConfigError, ReconnectConfig, WatchConfig};
pub use device::{DeviceIdError, DeviceIdStore};
pub use error::{ClientError, WsError};
pub use realtime::{spawn_session_manager, SessionSettings};
pub use ws::WsConnection;
