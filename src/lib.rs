//! # Tuyalan
//!
//! Asynchronous Tuya LAN protocol client for local control and monitoring
//! of Tuya-compatible devices without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalan::DeviceBuilder;
//!
//! #[tokio::main]
//! async fn main() -> tuyalan::Result<()> {
//!     let device = DeviceBuilder::new("DEVICE_ID", "DEVICE_ADDRESS", "DEVICE_KEY")
//!         .build();
//!     device.connect().await?;
//!     device.set_value(1, true).await?;
//!     Ok(())
//! }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod bytes;
pub mod connection;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod scanner;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use crypto::TuyaCipher;
pub use device::{Device, DeviceBuilder, DpsStatus};
pub use error::{Result, TuyaError};
pub use protocol::{CommandType, MessageCodec, TuyaMessage, Version};
pub use retry::RetryPolicy;
pub use scanner::{DiscoveredDevice, Scanner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[must_use]
pub fn version() -> &'static str {
    VERSION
}
