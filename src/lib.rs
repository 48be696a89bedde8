// A SIP user agent core in Rust

pub mod config;
pub mod dialog;
pub mod error;
pub mod media;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;
pub mod useragent;

pub use config::UserAgentConfig;
pub use error::Error;
pub use transaction::EndpointBuilder;
pub use useragent::{CallHandle, UserAgent, UserAgentBuilder, UserAgentEvent};
pub type Result<T> = std::result::Result<T, Error>;

pub const VERSION: &str = concat!("rsipua/", env!("CARGO_PKG_VERSION"));
