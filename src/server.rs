//! # Push Server
//!
//! The accept loop. One OS thread per connection, a shared [`Registry`],
//! and an injected message handler that stands in for the messenger's
//! router. The server performs no authentication and no envelope
//! validation; that belongs to the router behind the handler.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

use tracing::{error, info};

use crate::connection::{handle_connection, MessageHandler};
use crate::registry::Registry;

pub struct PushServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl PushServer {
    /// Bind the listener. Pass port 0 to let the OS pick one.
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            registry: Arc::new(Registry::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The registry shared with every connection. The router uses this
    /// handle for `broadcast`/`send_to_client`.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections forever, spawning a thread per connection.
    pub fn run(self, on_message: MessageHandler) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "push server listening"),
            Err(_) => info!("push server listening"),
        }
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let registry = Arc::clone(&self.registry);
                    let handler = Arc::clone(&on_message);
                    thread::spawn(move || handle_connection(stream, registry, handler));
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }

    /// Run the accept loop on a background thread. Used by tests and by
    /// hosts that embed the push layer next to other servers.
    pub fn spawn(self, on_message: MessageHandler) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(on_message))
    }
}
