//! In-process transport: a process-wide registry of named node mailboxes.
//!
//! A node "listens" by registering its mailbox under a name; a peer
//! "connects" by resolving that name to a direct route. Cross-thread
//! delivery is just a mailbox push, so ordering per route is trivially the
//! push order. [`InprocConnection`] wraps the registry in the uniform
//! [`Transport`] contract.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use tandem_runtime::{
    route::{RouteResolver, RouteSender},
    ActionMessage, Mailbox,
};

use crate::{Transport, TransportError};

const RECV_SLICE: Duration = Duration::from_millis(10);

type Registry = Mutex<HashMap<String, Arc<Mailbox<ActionMessage>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Register a node's mailbox under `name`. Re-registering a name replaces
/// the previous entry.
pub fn register(name: &str, mailbox: Arc<Mailbox<ActionMessage>>) {
    registry()
        .lock()
        .unwrap()
        .insert(name.to_owned(), mailbox);
}

/// Remove a node from the registry.
pub fn unregister(name: &str) {
    registry().lock().unwrap().remove(name);
}

/// Resolve a route to the named node.
pub fn connect(name: &str) -> Result<Box<dyn RouteSender>, TransportError> {
    registry()
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .map(|mailbox| Box::new(mailbox) as Box<dyn RouteSender>)
        .ok_or_else(|| TransportError::UnknownEndpoint(name.to_owned()))
}

/// Route resolver over the in-process registry, handed to brokers.
#[derive(Debug, Default)]
pub struct InprocResolver {}

impl RouteResolver for InprocResolver {
    fn resolve(&self, name: &str) -> Option<Box<dyn RouteSender>> {
        connect(name).ok()
    }
}

/// Config for an in-process connection: this node's name, the peer to reach,
/// and the mailbox inbound envelopes land in.
pub struct InprocConfig {
    pub name: String,
    pub peer: String,
    pub sink: Arc<Mailbox<ActionMessage>>,
}

/// An open in-process link to one named peer.
pub struct InprocConnection {
    name: String,
    peer: Box<dyn RouteSender>,
    sink: Arc<Mailbox<ActionMessage>>,
    closed: bool,
}

impl Transport for InprocConnection {
    type Config = InprocConfig;

    fn open(config: InprocConfig) -> Result<Self, TransportError> {
        // Publish our own mailbox first so the peer can answer.
        register(&config.name, config.sink.clone());
        let peer = connect(&config.peer)?;
        Ok(Self {
            name: config.name,
            peer,
            sink: config.sink,
            closed: false,
        })
    }

    fn send(&self, frame: ActionMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.peer.send(frame)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<ActionMessage, TransportError> {
        loop {
            if self.closed {
                return Err(TransportError::Closed);
            }
            if let Some(frame) = self.sink.pop_timeout(RECV_SLICE) {
                return Ok(frame);
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            unregister(&self.name);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for InprocConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_runtime::Action;

    #[test]
    fn register_connect_unregister() {
        let mailbox = Arc::new(Mailbox::new());
        register("inproc_test_node", mailbox.clone());

        let route = connect("inproc_test_node").unwrap();
        route.send(ActionMessage::new(Action::Ping)).unwrap();
        assert_eq!(mailbox.try_pop().unwrap().action, Action::Ping);

        // Priority envelopes use the priority channel.
        mailbox.push(ActionMessage::new(Action::Publish));
        route.send(ActionMessage::new(Action::Error)).unwrap();
        assert_eq!(mailbox.try_pop().unwrap().action, Action::Error);

        unregister("inproc_test_node");
        assert!(connect("inproc_test_node").is_err());
    }

    #[test]
    fn connection_round_trip() {
        let peer_sink = Arc::new(Mailbox::new());
        register("inproc_conn_peer", peer_sink.clone());

        let mut a = InprocConnection::open(InprocConfig {
            name: "inproc_conn_a".to_owned(),
            peer: "inproc_conn_peer".to_owned(),
            sink: Arc::new(Mailbox::new()),
        })
        .unwrap();
        let mut b = InprocConnection::open(InprocConfig {
            name: "inproc_conn_b".to_owned(),
            peer: "inproc_conn_a".to_owned(),
            sink: peer_sink,
        })
        .unwrap();

        let mut msg = ActionMessage::new(Action::Publish);
        msg.payload = b"over the registry".to_vec();
        a.send(msg.clone()).unwrap();
        assert_eq!(b.recv().unwrap(), msg);

        b.send(ActionMessage::new(Action::Ack)).unwrap();
        assert_eq!(a.recv().unwrap().action, Action::Ack);

        a.close().unwrap();
        assert!(matches!(
            a.send(ActionMessage::new(Action::Ping)),
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv(), Err(TransportError::Closed)));
        b.close().unwrap();
        unregister("inproc_conn_peer");
    }
}
