//! Bookkeeping for an in-path message filter.

use tandem_core::{GlobalHandle, Time};

use super::EndpointMessage;

/// A message transformer installed between endpoints. Operators run on the
/// core hosting the filter's federate; each returned message is re-routed as
/// if freshly sent and must not precede its input in time.
pub trait FilterOperator: Send {
    /// Transform one message into zero, one, or many outbound messages.
    /// Clones are deep copies; the input is owned.
    fn process(&mut self, message: EndpointMessage) -> Vec<EndpointMessage>;
}

/// A pass-through operator that optionally delays messages.
pub struct DelayFilter {
    pub delay: Time,
}

impl FilterOperator for DelayFilter {
    fn process(&mut self, mut message: EndpointMessage) -> Vec<EndpointMessage> {
        message.time += self.delay;
        vec![message]
    }
}

/// State for a registered filter.
#[derive(Debug)]
pub struct FilterInfo {
    pub id: GlobalHandle,
    pub key: String,
    pub input_type: String,
    pub output_type: String,
    /// True if the filter intercepts messages at their destination, false
    /// if at the source.
    pub dest_filter: bool,
    /// Endpoint handles this filter is attached to.
    targets: Vec<GlobalHandle>,
    /// Endpoint keys this filter is attached to (pre-resolution form).
    target_keys: Vec<String>,
}

impl FilterInfo {
    pub fn new(
        id: GlobalHandle,
        key: &str,
        input_type: &str,
        output_type: &str,
        dest_filter: bool,
    ) -> Self {
        Self {
            id,
            key: key.to_owned(),
            input_type: input_type.to_owned(),
            output_type: output_type.to_owned(),
            dest_filter,
            targets: Vec::new(),
            target_keys: Vec::new(),
        }
    }

    pub fn add_target(&mut self, target: GlobalHandle, key: &str) {
        if !self.targets.contains(&target) {
            self.targets.push(target);
            self.target_keys.push(key.to_owned());
        }
    }

    pub fn targets(&self) -> &[GlobalHandle] {
        &self.targets
    }

    pub fn target_keys(&self) -> &[String] {
        &self.target_keys
    }
}
