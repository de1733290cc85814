//! The federate-facing API surface.
//!
//! A [`Federate`] is a thin handle around the federate state machine wired
//! to its owning [`Core`]. The calling thread is the federate's worker: the
//! blocking calls here drive the envelope loop directly, so no background
//! task is needed per federate.

use std::{sync::Arc, time::Duration};

use tandem_core::{GlobalHandle, InterfaceHandle, IterationRequest, IterationTime, Time};

use crate::{
    fedstate::{FederateError, FederatePhase, FederateState},
    interfaces::{EndpointMessage, FilterOperator},
    Core, Mailbox,
};

/// Time-behavior properties settable before or between grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeProperty {
    Period,
    Offset,
    TimeDelta,
    InputDelay,
    OutputDelay,
}

/// A simulator participating in a federation.
pub struct Federate {
    core: Arc<Core>,
    state: FederateState,
}

impl Federate {
    /// Create and register a federate on `core`, blocking until the root
    /// broker assigns its global id.
    pub fn new(core: &Arc<Core>, name: &str) -> Result<Self, FederateError> {
        let mailbox = Arc::new(Mailbox::new());
        core.attach_federate(name, mailbox.clone());
        let mut state = FederateState::new(name, mailbox, core.mailbox());
        state.register()?;
        Ok(Self {
            core: core.clone(),
            state,
        })
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn id(&self) -> tandem_core::GlobalFederateId {
        self.state.id()
    }

    pub fn phase(&self) -> FederatePhase {
        self.state.phase()
    }

    pub fn granted_time(&self) -> Time {
        self.state.granted_time()
    }

    pub fn set_time_property(&mut self, property: TimeProperty, value: Time) {
        let props = self.state.time_properties_mut();
        match property {
            TimeProperty::Period => props.period = value,
            TimeProperty::Offset => props.offset = value,
            TimeProperty::TimeDelta => props.time_delta = value,
            TimeProperty::InputDelay => props.input_delay = value,
            TimeProperty::OutputDelay => props.output_delay = value,
        }
    }

    pub fn set_max_iterations(&mut self, max_iterations: i32) {
        self.state.time_properties_mut().max_iterations = max_iterations;
    }

    /// Wall-clock bound applied to each `request_time`; expiry is an error,
    /// not a silent resumption.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.state.set_request_timeout(timeout);
    }

    pub fn enable_profiler(&mut self, path: impl AsRef<std::path::Path>, append: bool) {
        self.state.enable_profiler(path, append);
    }

    pub fn register_publication(
        &mut self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, FederateError> {
        self.state.register_publication(key, type_name, units)
    }

    /// Subscribe to the publication named `target_key`.
    pub fn register_input(
        &mut self,
        target_key: &str,
        type_name: &str,
        units: &str,
        required: bool,
    ) -> Result<InterfaceHandle, FederateError> {
        self.state.register_input(target_key, type_name, units, required)
    }

    pub fn register_endpoint(
        &mut self,
        key: &str,
        type_name: &str,
    ) -> Result<InterfaceHandle, FederateError> {
        self.state.register_endpoint(key, type_name)
    }

    pub fn register_filter(
        &mut self,
        key: &str,
        input_type: &str,
        output_type: &str,
        dest_filter: bool,
    ) -> Result<InterfaceHandle, FederateError> {
        self.state
            .register_filter(key, input_type, output_type, dest_filter)
    }

    pub fn add_filter_target(
        &mut self,
        filter: InterfaceHandle,
        endpoint_key: &str,
    ) -> Result<(), FederateError> {
        self.state.add_filter_target(filter, endpoint_key)
    }

    /// Install the transformation executed for one of this federate's
    /// filters. Operators run on the hosting core's worker.
    pub fn set_filter_operator(
        &mut self,
        filter: InterfaceHandle,
        operator: Box<dyn FilterOperator>,
    ) {
        self.core
            .set_filter_operator(GlobalHandle::new(self.id(), filter), operator);
    }

    pub fn set_only_update_on_change(
        &mut self,
        input: InterfaceHandle,
        value: bool,
    ) -> Result<(), FederateError> {
        self.state.set_only_update_on_change(input, value)
    }

    pub fn enter_initializing_mode(&mut self) -> Result<(), FederateError> {
        self.state.enter_initializing_mode()
    }

    pub fn enter_executing_mode(&mut self) -> Result<(), FederateError> {
        self.state.enter_executing_mode()
    }

    pub fn request_time(
        &mut self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<IterationTime, FederateError> {
        self.state.request_time(time, iterate)
    }

    pub fn publish(
        &mut self,
        publication: InterfaceHandle,
        data: &[u8],
    ) -> Result<(), FederateError> {
        self.state.publish(publication, data)
    }

    pub fn get_value(&self, input: InterfaceHandle) -> Option<Vec<u8>> {
        self.state.get_value(input)
    }

    pub fn is_updated(&self, input: InterfaceHandle) -> bool {
        self.state.is_updated(input)
    }

    pub fn any_updated(&self) -> bool {
        self.state.any_updated()
    }

    pub fn send_message(
        &mut self,
        endpoint: InterfaceHandle,
        dest_key: &str,
        data: &[u8],
    ) -> Result<(), FederateError> {
        self.state.send_message(endpoint, dest_key, data)
    }

    pub fn has_message(&self, endpoint: InterfaceHandle) -> bool {
        self.state.has_message(endpoint)
    }

    pub fn get_message(&mut self, endpoint: InterfaceHandle) -> Option<EndpointMessage> {
        self.state.get_message(endpoint)
    }

    pub fn query(&mut self, target: &str, query: &str) -> Result<String, FederateError> {
        self.state.query(target, query)
    }

    pub fn finalize(&mut self) -> Result<(), FederateError> {
        self.state.finalize()
    }
}
