//! Local-network client for Vaonis smart telescopes
//!
//! This library talks to a telescope over the access point it publishes: it
//! signs the authorization challenge the instrument hands out, drives the
//! HTTP API by operation id, and keeps a live command channel open for
//! control commands and pushed status.
//!
//! # Modules
//!
//! - [`auth`] - Challenge signing and the `Authorization` header
//! - [`channel`] - Socket.IO command channel
//! - [`client`] - Unified HTTP client
//! - [`config`] - Configuration file handling
//! - [`discovery`] - Base URL detection across firmware path prefixes
//! - [`error`] - Error types for the library
//! - [`keys`] - Locating and loading the Ed25519 key material
//! - [`routes`] - Operation id to route catalog
//!
//! # Example Usage
//!
//! ```no_run
//! use vaonis_link::{
//!     build_authorization_header, config::HttpConfig, keys, AuthContext, RouteCatalog,
//!     UnifiedHttpClient,
//! };
//!
//! # async fn run() -> vaonis_link::Result<()> {
//! let client = UnifiedHttpClient::new(&HttpConfig::default(), RouteCatalog::builtin()?)?;
//!
//! // Read the challenge from the status snapshot and sign it
//! let status = client.get_status().await?;
//! let context = AuthContext::from_status(&status)?;
//! let key = keys::resolve(&keys::KeyOptions::default())?;
//! let header = build_authorization_header(&context, &key)?;
//! println!("Authorization: {}", header);
//! # Ok(())
//! # }
//! ```

/// Challenge payload construction and Ed25519 signing.
pub mod auth;

/// Persistent Socket.IO connection for commands and pushed events.
pub mod channel;

/// HTTP client resolving operations through the route catalog.
pub mod client;

/// Configuration module. Reads and writes the TOML config file.
pub mod config;

/// Base URL detection across firmware path prefixes.
pub mod discovery;

/// Error module defining custom error types for the library.
/// Uses `thiserror` for ergonomic error handling.
pub mod error;

/// Magic-byte image detection for tolerant downloads.
pub mod image;

/// Key material discovery and loading.
pub mod keys;

/// Engine.IO and Socket.IO text packet codec.
pub mod packet;

/// Decoded response bodies and log formatting.
pub mod payload;

/// Operation id to route catalog.
pub mod routes;

/// Pluggable HTTP transport used by the client.
pub mod transport;

// Re-export the signing entry points
pub use auth::{AuthContext, build_authorization_header};

pub use channel::{ChannelConfig, CommandAck, CommandChannel};

pub use client::{RequestOptions, UnifiedHttpClient};

// Re-export the main error type for library users
pub use error::{ErrorKind, Result, VaonisError};

pub use keys::KeyMaterial;

pub use payload::Payload;

pub use routes::{RouteCatalog, RouteDefinition};
