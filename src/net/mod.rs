//! Networking layer.
//!
//! - `tls` - rustls client configuration for the claim credential

pub mod tls;

pub use tls::*;
