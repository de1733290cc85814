//! Bookkeeping for an endpoint: a priority queue of received messages
//! ordered by `(time, original_source)`.

use tandem_core::{GlobalHandle, Time};

/// One discrete message held by an endpoint queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointMessage {
    pub time: Time,
    /// The endpoint that first emitted the message, surviving filter hops.
    pub original_source: String,
    /// The immediate sender handle.
    pub source: GlobalHandle,
    /// The destination endpoint key.
    pub dest: String,
    pub data: Vec<u8>,
}

/// State for an endpoint and its received-message queue.
#[derive(Debug)]
pub struct EndpointInfo {
    pub id: GlobalHandle,
    pub key: String,
    pub type_name: String,
    /// Ordered by `(time, original_source)`; inserts at identical keys
    /// preserve FIFO.
    queue: Vec<EndpointMessage>,
}

impl EndpointInfo {
    pub fn new(id: GlobalHandle, key: &str, type_name: &str) -> Self {
        Self {
            id,
            key: key.to_owned(),
            type_name: type_name.to_owned(),
            queue: Vec::new(),
        }
    }

    pub fn add_message(&mut self, message: EndpointMessage) {
        let key = (message.time, message.original_source.clone());
        let at = self
            .queue
            .partition_point(|m| (m.time, m.original_source.clone()) <= key);
        self.queue.insert(at, message);
    }

    /// The time of the earliest queued message, [`Time::MAX`] when empty.
    pub fn first_message_time(&self) -> Time {
        self.queue.first().map_or(Time::MAX, |m| m.time)
    }

    /// Dequeue the earliest message whose time is at or before `max_time`.
    /// Later messages remain queued.
    pub fn get_message(&mut self, max_time: Time) -> Option<EndpointMessage> {
        match self.queue.first() {
            Some(m) if m.time <= max_time => Some(self.queue.remove(0)),
            _ => None,
        }
    }

    pub fn has_message(&self, max_time: Time) -> bool {
        self.queue.first().map_or(false, |m| m.time <= max_time)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{GlobalFederateId, InterfaceHandle};

    fn message(time: f64, original_source: &str, data: &[u8]) -> EndpointMessage {
        EndpointMessage {
            time: Time::from_seconds(time),
            original_source: original_source.to_owned(),
            source: GlobalHandle::new(GlobalFederateId::new(131_073), InterfaceHandle::new(1)),
            dest: "dest".to_owned(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn ordering_and_bounded_retrieval() {
        let id = GlobalHandle::new(GlobalFederateId::new(5), InterfaceHandle::new(13));
        let mut endpoint = EndpointInfo::new(id, "name", "type");

        assert_eq!(endpoint.first_message_time(), Time::MAX);
        assert!(endpoint.get_message(Time::MAX).is_none());

        endpoint.add_message(message(10.0, "late", b"late"));
        endpoint.add_message(message(0.0, "zero", b"zero"));
        endpoint.add_message(message(-5.0, "early", b"early"));
        assert_eq!(endpoint.first_message_time(), Time::from_seconds(-5.0));

        // Bounded by max_time: nothing before -5 is available at -6.
        assert!(endpoint.get_message(Time::from_seconds(-6.0)).is_none());

        let m = endpoint.get_message(Time::from_seconds(-5.0)).unwrap();
        assert_eq!(m.data, b"early");
        assert_eq!(endpoint.first_message_time(), Time::from_seconds(0.0));

        let m = endpoint.get_message(Time::from_seconds(0.0)).unwrap();
        assert_eq!(m.data, b"zero");
        assert!(endpoint.get_message(Time::from_seconds(0.0)).is_none());
        assert_eq!(endpoint.first_message_time(), Time::from_seconds(10.0));
    }

    #[test]
    fn equal_time_orders_by_source_then_fifo() {
        let id = GlobalHandle::new(GlobalFederateId::new(5), InterfaceHandle::new(13));
        let mut endpoint = EndpointInfo::new(id, "name", "type");

        endpoint.add_message(message(1.0, "bbb", b"b1"));
        endpoint.add_message(message(1.0, "aaa", b"a1"));
        endpoint.add_message(message(1.0, "bbb", b"b2"));
        endpoint.add_message(message(1.0, "aaa", b"a2"));

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| endpoint.get_message(Time::MAX))
            .map(|m| m.data)
            .collect();
        assert_eq!(
            order,
            vec![
                b"a1".to_vec(),
                b"a2".to_vec(),
                b"b1".to_vec(),
                b"b2".to_vec()
            ]
        );
    }
}
