//! duet-core - client side of the duet end-to-end encrypted chat.
//!
//! This crate implements:
//! - the device Identity KeyStore (file and in-memory backends)
//! - an explicit client `Session` built from the login credential
//! - the relay seams (`RelayApi`, `LiveChannel`) with HTTP and WebSocket
//!   implementations
//! - identity bootstrap (load-or-generate, then publish)
//! - the per-conversation Delivery Orchestrator
//! - a loopback relay for tests

#![forbid(unsafe_code)]

pub mod api;
pub mod bootstrap;
pub mod errors;
pub mod harness;
pub mod http_relay;
pub mod keystore;
pub mod orchestrator;
pub mod session;
pub mod ws_channel;

pub use api::{LiveChannel, RelayApi};
pub use bootstrap::bootstrap_identity;
pub use errors::CoreError;
pub use http_relay::HttpRelayClient;
pub use keystore::{FileKeyStore, IdentityStore, KeyStore, MemoryKeyStore};
pub use orchestrator::{DeliveryOrchestrator, DisplayMessage, MessageBody, Phase, Progress, SendPath};
pub use session::{Session, SessionCredential};
pub use ws_channel::WsChannel;
