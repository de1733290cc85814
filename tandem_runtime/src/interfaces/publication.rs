//! Bookkeeping for a publication: metadata plus the set of subscribers.

use tandem_core::GlobalHandle;

/// State for a publication.
#[derive(Debug)]
pub struct PublicationInfo {
    pub id: GlobalHandle,
    pub key: String,
    pub type_name: String,
    pub units: String,
    /// Global handles of every subscribing input.
    subscribers: Vec<GlobalHandle>,
    /// The most recent published payload, re-sent to late subscribers at
    /// initialization.
    pub data: Option<Vec<u8>>,
}

impl PublicationInfo {
    pub fn new(id: GlobalHandle, key: &str, type_name: &str, units: &str) -> Self {
        Self {
            id,
            key: key.to_owned(),
            type_name: type_name.to_owned(),
            units: units.to_owned(),
            subscribers: Vec::new(),
            data: None,
        }
    }

    pub fn add_subscriber(&mut self, subscriber: GlobalHandle) {
        if !self.subscribers.contains(&subscriber) {
            self.subscribers.push(subscriber);
        }
    }

    pub fn remove_subscriber(&mut self, subscriber: GlobalHandle) {
        self.subscribers.retain(|s| *s != subscriber);
    }

    pub fn subscribers(&self) -> &[GlobalHandle] {
        &self.subscribers
    }
}
