//! Call named functions inside a separately launched plugin process.
//!
//! ```no_run
//! use plugin_bridge::{args, PluginHandle, PluginOptions};
//!
//! # async fn run() -> plugin_bridge::Result<()> {
//! let plugin = PluginHandle::init("./debugtalk", PluginOptions::default()).await?;
//! if plugin.has("sum_ints").await {
//!     let total = plugin.call("sum_ints", &args![1, 2, 3, 4]).await?;
//!     println!("{total}");
//! }
//! plugin.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod value;

pub use error::{BridgeError, CodecError, ConfigError, Result, TransportError};
pub use plugin::{HandleState, LanguageKind, PluginHandle, PluginOptions};
pub use server::{serve, FunctionError, FunctionRegistry};
pub use transport::TransportStyle;
pub use value::Value;
