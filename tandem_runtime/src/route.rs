//! Outbound link abstraction.
//!
//! Cores and brokers hold their peers by [`RouteId`] mapped to a boxed
//! [`RouteSender`]; transports implement the trait for their connection
//! types, and an in-process peer is just the peer's mailbox.

use std::sync::Arc;

use crate::{ActionMessage, Mailbox};

/// The error type for sending on a route.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("route is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// One-way sender half of a link to another node.
pub trait RouteSender: Send {
    fn send(&self, msg: ActionMessage) -> Result<(), RouteError>;
}

/// In-process route: push straight into the peer's mailbox, using the
/// priority channel for priority actions.
impl RouteSender for Arc<Mailbox<ActionMessage>> {
    fn send(&self, msg: ActionMessage) -> Result<(), RouteError> {
        if msg.is_priority() {
            self.push_priority(msg);
        } else {
            self.push(msg);
        }
        Ok(())
    }
}

/// Resolves the name presented in a connection envelope to a send route.
/// Each transport supplies its own resolver to the broker.
pub trait RouteResolver: Send {
    fn resolve(&self, name: &str) -> Option<Box<dyn RouteSender>>;
}
