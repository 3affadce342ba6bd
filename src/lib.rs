//! Line-oriented multi-user chat relay.
//!
//! Clients connect over TCP, pick a unique display name and then every line
//! they send is relayed to all connected clients. Membership changes are
//! pushed to everyone as `!users: ` presence lines.

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::ServerConfig;
pub use error::{Error, NameError, Result};
pub use server::Server;
