// moriod - Control plane for Morio deployments
//
// Licensed under the European Union Public Licence v1.2

//! moriod resolves operator settings into immutable, versioned
//! configurations, runs the internal Certificate Authority, drives the
//! containers of managed services towards their desired state and keeps
//! the resolved configuration consistent across the nodes of a cluster.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Certificate Authority
pub mod ca;

/// Cluster coordination
pub mod cluster;

/// Presets and operator settings
pub mod config;

/// Container lifecycle
pub mod container;

/// Configuration resolution
pub mod resolver;

/// Retry with backoff
pub mod retry;

/// Service interface
pub mod service;

/// Status aggregation
pub mod status;

/// Config stores
pub mod store;

// Re-export common types
pub use config::{Presets, RawSettings};
pub use resolver::model::ResolvedConfig;
pub use service::Service;
