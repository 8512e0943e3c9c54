//! Chatline core library: the reconnecting chat session core (transport, auth, store,
//! realtime subscription, controller) plus the dev relay used by the CLI.

pub mod auth;
pub mod backend;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod init;
pub mod outbox;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod testing;
