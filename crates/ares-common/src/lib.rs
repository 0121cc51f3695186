//! Ares Common Types and Transport
//!
//! This crate provides the protocol definitions, the framed TCP transport and
//! the configuration shared by every Ares component.
//!
//! # Overview
//!
//! Ares is a service-discovery based RPC framework: providers publish
//! services into a registry, consumers discover them, pick a replica and call
//! it over pooled TCP channels. This crate contains the pieces both sides
//! agree on:
//!
//! - **Protocol Layer**: service descriptors, call request/response, errors
//! - **Transport Layer**: length-prefixed frames with JSON serialization
//! - **Configuration**: TOML file plus `ARES_*` environment overrides
//!
//! # Example
//!
//! ```
//! use ares_common::{CallRequest, CallResponse, ServiceDescriptor};
//! use serde_json::json;
//!
//! let service = ServiceDescriptor::new("ares.demo.HelloService", "127.0.0.1", 8081)
//!     .with_timeout(500);
//! let request = CallRequest::new(service, "sayHello", vec![json!("ares")]);
//!
//! let response = CallResponse::success(request.id.clone(), request.timeout_ms, json!("hi"));
//! assert_eq!(response.id, request.id);
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::AresConfig;
pub use protocol::*;
