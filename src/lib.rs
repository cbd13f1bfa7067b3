#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: provisioning types repeat their module name
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
// Documentation style
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: buffer lengths and CBOR sizes
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::ref_option_ref)]
// Error handling style
#![allow(clippy::result_large_err)]
#![allow(clippy::large_futures)]
// Async trait methods that may not await
#![allow(clippy::unused_async)]

//! fleetprov - claim-based fleet provisioning client over MQTT.
//!
//! A device holding a shared, low-privilege claim certificate uses this crate
//! to obtain a unique certificate and register itself as a thing.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Clock abstraction
//!
//! ## Provisioning
//! - `provisioning::backoff` - Jittered exponential backoff
//! - `provisioning::session` - Per-attempt state and response classification
//! - `provisioning::correlator` - Bounded wait for a packet category
//! - `provisioning::step` - Single request/response exchange
//! - `provisioning::orchestrator` - CSR then RegisterThing state machine
//! - `provisioning::codec` - CBOR/JSON payloads
//!
//! ## Transport
//! - `transport` - Pub/sub engine traits
//! - `transport::mqtt` - rumqttc engine
//! - `net::tls` - rustls client configuration
//!
//! ## Credentials
//! - `keystore` - Key generation and credential storage
//!
//! ## Operations
//! - `ops::telemetry` - Structured logging

// Core infrastructure
pub mod core;

// Provisioning protocol
pub mod provisioning;

// Transport
pub mod net;
pub mod transport;

// Credentials
pub mod keystore;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, time};
pub use net::tls;
pub use ops::telemetry;
pub use provisioning::{Provisioner, ProvisioningError, ProvisioningState, ThingIdentity};
