//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler and connection.

use crate::chat::{ChannelDispatcher, ConnectionHub};
use research_assistant_core::ports::{DatabaseService, IdentityService};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub identity: Arc<dyn IdentityService>,
    pub dispatcher: Arc<ChannelDispatcher>,
}

impl AppState {
    /// The registry of live push connections, shared with the dispatcher.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        self.dispatcher.hub()
    }
}
