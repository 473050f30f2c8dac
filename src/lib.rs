//! # wirepush
//!
//! Real-time push layer for the messenger: a WebSocket server implemented
//! directly over raw TCP sockets, no protocol library.
//!
//! WHY FROM SCRATCH:
//! - RFC 6455 hasn't changed since 2011. Won't change.
//! - A few hundred readable lines vs an external library's thousands
//! - No dependency that can break or change
//!
//! ## Architecture
//!
//! ```text
//! Clients (browsers, apps)
//!        │
//!   TCP accept ── handshake ── register ──┐
//!        │                                │
//!   read loop ── FrameParser ── Envelope  │
//!        │                                ▼
//!   on_message hook ──────────────► Registry ── broadcast /
//!   (external router)                   │       send_to_client
//!                                  writer threads
//! ```
//!
//! The core decodes inbound frames into JSON envelopes and hands them to
//! an injected `on_message` hook; outbound, it exposes `broadcast` and
//! `send_to_client` on the [`registry::Registry`]. What an envelope means
//! is the router's business, not ours.

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod server;

pub use connection::MessageHandler;
pub use protocol::Envelope;
pub use registry::Registry;
pub use server::PushServer;
