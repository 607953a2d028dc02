//! Single-host anycast BGP speaker.
//!
//! Advertises a service address as a /32 to a set of upstream peers,
//! gated on a local health check, and installs the default route learned
//! from those peers into the kernel forwarding table.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod netlink;
pub mod speaker;

pub use config::Config;
pub use error::Error;
