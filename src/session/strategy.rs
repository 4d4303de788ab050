//! Search strategy interface
//!
//! The server consults a strategy whenever a session's variables or
//! performance change. Optimisers plug in here; the crate only ships
//! [`HoldStrategy`].

use crate::protocol::VarDef;

use super::ClientId;

/// Decides which values a session should try next
pub trait SearchStrategy: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// A client declared a new variable
    fn variable_registered(&mut self, _client: ClientId, _var: &VarDef) {}

    /// A client reported performance for the point it is currently running
    fn performance_reported(&mut self, _client: ClientId, _point: &[VarDef], _performance: i32) {}

    /// Values the client should switch to; an empty list keeps the current point
    fn next_values(&mut self, _client: ClientId, _current: &[VarDef]) -> Vec<VarDef> {
        Vec::new()
    }

    /// The client's session ended and anything held for it can be released
    fn client_revoked(&mut self, _client: ClientId) {}
}

/// Keeps whatever values the session already holds
#[derive(Debug, Default, Clone, Copy)]
pub struct HoldStrategy;

impl SearchStrategy for HoldStrategy {
    fn name(&self) -> &str {
        "hold"
    }
}

/// Look up a shipped strategy by the name it reports
pub fn strategy_by_name(name: &str) -> Option<Box<dyn SearchStrategy>> {
    match name {
        "hold" => Some(Box::new(HoldStrategy)),
        _ => None,
    }
}
