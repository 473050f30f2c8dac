//! # wirepush server binary
//!
//! Stands the push layer up on its own. The real messenger injects its
//! message router through the `on_message` hook; this binary wires in a
//! pass-through router that fans every inbound envelope out to all other
//! peers, which is exactly what the messenger does for `new_message`,
//! `user_online` and friends.

use std::sync::Arc;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use wirepush::{MessageHandler, PushServer};

/// Default bind address. Override with the PUSH_ADDR env var.
const DEFAULT_ADDR: &str = "0.0.0.0:3001";

fn bind_addr() -> String {
    std::env::var("PUSH_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = bind_addr();
    let server = match PushServer::bind(&addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Pass-through router: relay every envelope to everyone but its sender.
    let registry = server.registry();
    let router: MessageHandler = Arc::new(move |sender_id, envelope| {
        debug!(sender = sender_id, msg_type = %envelope.msg_type, "relaying envelope");
        registry.broadcast(&envelope.msg_type, &envelope.data, Some(sender_id));
    });

    server.run(router);
}
