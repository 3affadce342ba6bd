//! Presence announcements
//!
//! After every membership change the connected clients get a fresh
//! `!users: ` line. The line is built by the dispatcher at delivery time, so
//! it always matches the registry at the moment it goes out and is ordered
//! with the chat traffic around it.

use std::sync::Arc;

use super::dispatcher::{Command, Dispatcher};
use super::registry::Registry;
use crate::protocol;

/// Queue a presence announcement. Must not be called with the registry lock
/// held.
pub async fn announce(dispatcher: &Dispatcher) {
    dispatcher.send(Command::Presence).await;
}

/// Presence line for the sessions currently in `registry`.
pub fn snapshot_line(registry: &Registry) -> Arc<str> {
    protocol::presence_line(&registry.snapshot_names()).into()
}
