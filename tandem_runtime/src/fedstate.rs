//! Per-federate lifecycle state machine and envelope processing.
//!
//! The federate's own API thread is its worker: every blocking operation
//! (registration, the init/exec barriers, `request_time`) drains the
//! federate's mailbox and feeds envelopes through [`FederateState::process`]
//! until its completion condition holds. The owning core only ever pushes
//! into the mailbox, so all state mutation is confined to this thread.
//!
//! Envelope field conventions used by the registration traffic: the payload
//! carries the interface key, `extra.source_name` the declared type, and
//! `extra.target_name` the units (output type for filters, whose input type
//! rides in `source_name`).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tandem_core::{
    GlobalFederateId, GlobalHandle, InterfaceHandle, IterationRequest, IterationResult,
    IterationTime, Time,
};

use crate::{
    coordinator::{TimeCoordinator, TimeError, TimeProperties},
    interfaces::{EndpointInfo, EndpointMessage, FilterInfo, InputInfo, InterfaceInfo, PublicationInfo},
    Action, ActionMessage, Flags, Mailbox, ProfilerBuffer,
};

/// Default bound on blocking barrier and registration waits.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Mailbox poll slice inside blocking loops.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Lifecycle states of a federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederatePhase {
    Created,
    HasDependencies,
    Initializing,
    Executing,
    Finalizing,
    Error,
}

impl std::fmt::Display for FederatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The error type for federate operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FederateError {
    #[error("federate is in the error state: {0}")]
    InErrorState(String),

    #[error("operation {op} is not valid in the {phase} state")]
    InvalidPhase {
        op: &'static str,
        phase: FederatePhase,
    },

    #[error("the federation has halted")]
    Halted,

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unknown interface handle {0}")]
    UnknownHandle(InterfaceHandle),

    #[error("an interface named {0:?} already exists on this federate")]
    DuplicateName(String),
}

/// One federate's complete runtime state.
pub struct FederateState {
    name: String,
    id: GlobalFederateId,
    phase: FederatePhase,
    pub coordinator: TimeCoordinator,
    /// Inbound envelopes from the owning core.
    mailbox: Arc<Mailbox<ActionMessage>>,
    /// The owning core's mailbox.
    parent: Arc<Mailbox<ActionMessage>>,
    interfaces: HashMap<InterfaceHandle, InterfaceInfo>,
    next_handle: i32,
    /// Inputs that changed at the most recent grant.
    updated: HashSet<InterfaceHandle>,
    init_granted: bool,
    exec_granted: bool,
    disconnect_acked: bool,
    halted: bool,
    error_text: Option<String>,
    query_reply: Option<String>,
    /// Optional wall-clock bound on `request_time`.
    request_timeout: Option<Duration>,
    profiler: Option<ProfilerBuffer>,
}

impl FederateState {
    pub fn new(
        name: &str,
        mailbox: Arc<Mailbox<ActionMessage>>,
        parent: Arc<Mailbox<ActionMessage>>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            id: GlobalFederateId::INVALID,
            phase: FederatePhase::Created,
            coordinator: TimeCoordinator::new(GlobalFederateId::INVALID),
            mailbox,
            parent,
            interfaces: HashMap::new(),
            next_handle: 1,
            updated: HashSet::new(),
            init_granted: false,
            exec_granted: false,
            disconnect_acked: false,
            halted: false,
            error_text: None,
            query_reply: None,
            request_timeout: None,
            profiler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> GlobalFederateId {
        self.id
    }

    pub fn phase(&self) -> FederatePhase {
        self.phase
    }

    pub fn granted_time(&self) -> Time {
        self.coordinator.granted_time()
    }

    pub fn time_properties_mut(&mut self) -> &mut TimeProperties {
        &mut self.coordinator.props
    }

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    pub fn enable_profiler(&mut self, path: impl AsRef<std::path::Path>, append: bool) {
        let mut profiler = ProfilerBuffer::new();
        profiler.set_output_file(path, append);
        self.profiler = Some(profiler);
    }

    fn send_to_core(&self, msg: ActionMessage) {
        if msg.is_priority() {
            self.parent.push_priority(msg);
        } else {
            self.parent.push(msg);
        }
    }

    /// Register with the core and block until the root broker assigns an id.
    pub fn register(&mut self) -> Result<GlobalFederateId, FederateError> {
        let mut msg = ActionMessage::new(Action::RegisterFederate);
        msg.set_name(&self.name);
        self.send_to_core(msg);
        self.wait_until("federate registration", |state| state.id.is_valid())?;
        Ok(self.id)
    }

    fn allocate_handle(&mut self) -> InterfaceHandle {
        let handle = InterfaceHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn check_registration(&self, op: &'static str, key: &str) -> Result<(), FederateError> {
        match self.phase {
            FederatePhase::Created | FederatePhase::HasDependencies | FederatePhase::Initializing => {}
            phase => return Err(FederateError::InvalidPhase { op, phase }),
        }
        if self.interfaces.values().any(|i| i.key() == key) {
            return Err(FederateError::DuplicateName(key.to_owned()));
        }
        Ok(())
    }

    fn register_interface(
        &mut self,
        action: Action,
        key: &str,
        type_name: &str,
        units_or_out: &str,
        flags: Flags,
    ) -> ActionMessage {
        let mut msg = ActionMessage::new(action);
        msg.source_id = self.id;
        msg.flags = flags;
        msg.set_name(key);
        let extra = msg.extra_mut();
        extra.source_name = type_name.to_owned();
        extra.target_name = units_or_out.to_owned();
        msg
    }

    pub fn register_publication(
        &mut self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<InterfaceHandle, FederateError> {
        self.check_registration("register_publication", key)?;
        let handle = self.allocate_handle();
        let global = GlobalHandle::new(self.id, handle);
        self.interfaces.insert(
            handle,
            InterfaceInfo::Publication(PublicationInfo::new(global, key, type_name, units)),
        );
        let mut msg =
            self.register_interface(Action::RegisterPublication, key, type_name, units, Flags::empty());
        msg.source_handle = handle;
        self.send_to_core(msg);
        Ok(handle)
    }

    /// Register an input subscribing to the publication named `target_key`.
    pub fn register_input(
        &mut self,
        target_key: &str,
        type_name: &str,
        units: &str,
        required: bool,
    ) -> Result<InterfaceHandle, FederateError> {
        self.check_registration("register_input", target_key)?;
        let handle = self.allocate_handle();
        let global = GlobalHandle::new(self.id, handle);
        let mut info = InputInfo::new(global, target_key, type_name, units);
        info.required = required;
        self.interfaces.insert(handle, InterfaceInfo::Input(info));
        let flags = if required {
            Flags::REQUIRED
        } else {
            Flags::OPTIONAL
        };
        let mut msg =
            self.register_interface(Action::RegisterInput, target_key, type_name, units, flags);
        msg.source_handle = handle;
        self.send_to_core(msg);
        Ok(handle)
    }

    pub fn register_endpoint(
        &mut self,
        key: &str,
        type_name: &str,
    ) -> Result<InterfaceHandle, FederateError> {
        self.check_registration("register_endpoint", key)?;
        let handle = self.allocate_handle();
        let global = GlobalHandle::new(self.id, handle);
        self.interfaces
            .insert(handle, InterfaceInfo::Endpoint(EndpointInfo::new(global, key, type_name)));
        let mut msg =
            self.register_interface(Action::RegisterEndpoint, key, type_name, "", Flags::empty());
        msg.source_handle = handle;
        self.send_to_core(msg);
        Ok(handle)
    }

    pub fn register_filter(
        &mut self,
        key: &str,
        input_type: &str,
        output_type: &str,
        dest_filter: bool,
    ) -> Result<InterfaceHandle, FederateError> {
        self.check_registration("register_filter", key)?;
        let handle = self.allocate_handle();
        let global = GlobalHandle::new(self.id, handle);
        self.interfaces.insert(
            handle,
            InterfaceInfo::Filter(FilterInfo::new(global, key, input_type, output_type, dest_filter)),
        );
        let flags = if dest_filter {
            Flags::DEST_FILTER
        } else {
            Flags::empty()
        };
        let mut msg =
            self.register_interface(Action::RegisterFilter, key, input_type, output_type, flags);
        msg.source_handle = handle;
        self.send_to_core(msg);
        Ok(handle)
    }

    /// Attach a registered filter to the endpoint named `endpoint_key`.
    pub fn add_filter_target(
        &mut self,
        filter: InterfaceHandle,
        endpoint_key: &str,
    ) -> Result<(), FederateError> {
        let dest_filter = match self.interfaces.get_mut(&filter) {
            Some(InterfaceInfo::Filter(info)) => {
                info.add_target(GlobalHandle::INVALID, endpoint_key);
                info.dest_filter
            }
            _ => return Err(FederateError::UnknownHandle(filter)),
        };
        let mut msg = ActionMessage::new(Action::AddFilterTarget);
        msg.source_id = self.id;
        msg.source_handle = filter;
        msg.set_name(endpoint_key);
        if dest_filter {
            msg.flags.set(Flags::DEST_FILTER);
        }
        self.send_to_core(msg);
        Ok(())
    }

    pub fn set_only_update_on_change(
        &mut self,
        input: InterfaceHandle,
        value: bool,
    ) -> Result<(), FederateError> {
        match self.interfaces.get_mut(&input) {
            Some(InterfaceInfo::Input(info)) => {
                info.only_update_on_change = value;
                Ok(())
            }
            _ => Err(FederateError::UnknownHandle(input)),
        }
    }

    /// Request entry to the initializing state; blocks until every federate
    /// in the tree has requested entry.
    pub fn enter_initializing_mode(&mut self) -> Result<(), FederateError> {
        match self.phase {
            FederatePhase::Created | FederatePhase::HasDependencies => {}
            FederatePhase::Initializing => return Ok(()),
            phase => {
                return Err(FederateError::InvalidPhase {
                    op: "enter_initializing_mode",
                    phase,
                })
            }
        }
        let mut msg = ActionMessage::new(Action::InitRequest);
        msg.source_id = self.id;
        self.send_to_core(msg);
        self.wait_until("initialization barrier", |state| state.init_granted)?;
        self.phase = FederatePhase::Initializing;
        tracing::debug!(federate = %self.name, "entered initializing mode");
        Ok(())
    }

    /// Request entry to the executing state; blocks on the execution
    /// barrier. Values published during initialization surface at time zero.
    pub fn enter_executing_mode(&mut self) -> Result<(), FederateError> {
        match self.phase {
            FederatePhase::Initializing => {}
            FederatePhase::Executing => return Ok(()),
            phase => {
                return Err(FederateError::InvalidPhase {
                    op: "enter_executing_mode",
                    phase,
                })
            }
        }
        let mut msg = ActionMessage::new(Action::ExecRequest);
        msg.source_id = self.id;
        self.send_to_core(msg);
        self.wait_until("execution barrier", |state| state.exec_granted)?;
        self.coordinator.enter_executing();
        self.phase = FederatePhase::Executing;

        self.apply_grant_updates(IterationResult::NextStep, Time::ZERO);
        self.broadcast_time_factors();
        tracing::debug!(federate = %self.name, "entered executing mode");
        Ok(())
    }

    /// Request time `time` under the given iteration policy, blocking until
    /// the coordinator can grant safely.
    pub fn request_time(
        &mut self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<IterationTime, FederateError> {
        match self.phase {
            FederatePhase::Error => {
                return Err(FederateError::InErrorState(
                    self.error_text.clone().unwrap_or_default(),
                ))
            }
            FederatePhase::Executing => {}
            phase => {
                return Err(FederateError::InvalidPhase {
                    op: "request_time",
                    phase,
                })
            }
        }
        // Apply everything that arrived since the last call before deciding;
        // a late data envelope must fault here rather than after a grant.
        while let Some(msg) = self.mailbox.try_pop() {
            self.process(msg);
        }
        if self.phase == FederatePhase::Error {
            return Err(FederateError::InErrorState(
                self.error_text.clone().unwrap_or_default(),
            ));
        }
        if self.halted {
            return Ok(IterationTime::new(self.granted_time(), IterationResult::Halted));
        }

        self.sync_event_time();
        self.coordinator.request(time, iterate);
        self.broadcast_time_factors();

        let deadline = self.request_timeout.map(|d| Instant::now() + d);
        loop {
            match self.coordinator.check_grant() {
                Err(err) => {
                    self.raise_error(err.to_string());
                    return Err(err.into());
                }
                Ok(Some(grant)) => {
                    self.apply_grant_updates(grant.state, grant.granted_time);
                    self.broadcast_time_factors();
                    if let Some(profiler) = &mut self.profiler {
                        profiler.add_entry(format!(
                            "{}|grant|{}|{}",
                            self.name,
                            grant.granted_time,
                            self.coordinator.iteration()
                        ));
                    }
                    tracing::trace!(federate = %self.name, time = %grant.granted_time, state = ?grant.state, "granted");
                    return Ok(grant);
                }
                Ok(None) => {}
            }
            if self.phase == FederatePhase::Error {
                return Err(FederateError::InErrorState(
                    self.error_text.clone().unwrap_or_default(),
                ));
            }
            if self.halted {
                return Ok(IterationTime::new(self.granted_time(), IterationResult::Halted));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.raise_error("time request exceeded its wall-clock timeout".to_owned());
                    return Err(FederateError::Timeout("time grant"));
                }
            }
            if let Some(msg) = self.mailbox.pop_timeout(POLL_SLICE) {
                self.process(msg);
                self.sync_event_time();
                self.broadcast_time_factors();
            }
        }
    }

    /// Publish a value on one of this federate's publications. During
    /// initialization the value is stamped at time zero.
    pub fn publish(&mut self, publication: InterfaceHandle, data: &[u8]) -> Result<(), FederateError> {
        let time = match self.phase {
            FederatePhase::Initializing => Time::ZERO,
            FederatePhase::Executing => self.granted_time(),
            FederatePhase::Error => {
                return Err(FederateError::InErrorState(
                    self.error_text.clone().unwrap_or_default(),
                ))
            }
            phase => return Err(FederateError::InvalidPhase { op: "publish", phase }),
        };
        let iteration = self.coordinator.iteration();
        match self.interfaces.get_mut(&publication) {
            Some(InterfaceInfo::Publication(info)) => {
                info.data = Some(data.to_vec());
            }
            _ => return Err(FederateError::UnknownHandle(publication)),
        }
        let mut msg = ActionMessage::new(Action::Publish);
        msg.source_id = self.id;
        msg.source_handle = publication;
        msg.action_time = time;
        msg.iteration = iteration;
        msg.payload = data.to_vec();
        self.send_to_core(msg);
        Ok(())
    }

    /// Send a message from one of this federate's endpoints to the endpoint
    /// named `dest_key`, stamped at the current granted time.
    pub fn send_message(
        &mut self,
        endpoint: InterfaceHandle,
        dest_key: &str,
        data: &[u8],
    ) -> Result<(), FederateError> {
        if self.phase != FederatePhase::Executing {
            return Err(FederateError::InvalidPhase {
                op: "send_message",
                phase: self.phase,
            });
        }
        let key = match self.interfaces.get(&endpoint) {
            Some(InterfaceInfo::Endpoint(info)) => info.key.clone(),
            _ => return Err(FederateError::UnknownHandle(endpoint)),
        };
        let mut msg = ActionMessage::new(Action::SendMessage);
        msg.source_id = self.id;
        msg.source_handle = endpoint;
        msg.action_time = self.granted_time();
        msg.payload = data.to_vec();
        let extra = msg.extra_mut();
        extra.source_name = key.clone();
        extra.original_source = key;
        extra.target_name = dest_key.to_owned();
        self.send_to_core(msg);
        Ok(())
    }

    /// The current value of an input, if any has arrived.
    pub fn get_value(&self, input: InterfaceHandle) -> Option<Vec<u8>> {
        match self.interfaces.get(&input) {
            Some(InterfaceInfo::Input(info)) => info.value().map(|r| r.data.clone()),
            _ => None,
        }
    }

    /// True if the input changed at the most recent grant.
    pub fn is_updated(&self, input: InterfaceHandle) -> bool {
        self.updated.contains(&input)
    }

    /// True if any input changed at the most recent grant.
    pub fn any_updated(&self) -> bool {
        !self.updated.is_empty()
    }

    pub fn has_message(&self, endpoint: InterfaceHandle) -> bool {
        match self.interfaces.get(&endpoint) {
            Some(InterfaceInfo::Endpoint(info)) => info.has_message(self.granted_time()),
            _ => false,
        }
    }

    /// The earliest received message at or before the granted time.
    pub fn get_message(&mut self, endpoint: InterfaceHandle) -> Option<EndpointMessage> {
        let granted = self.granted_time();
        match self.interfaces.get_mut(&endpoint) {
            Some(InterfaceInfo::Endpoint(info)) => info.get_message(granted),
            _ => None,
        }
    }

    /// Issue a query against a named target and wait for the reply.
    pub fn query(&mut self, target: &str, query: &str) -> Result<String, FederateError> {
        if self.phase == FederatePhase::Error {
            return Err(FederateError::InErrorState(
                self.error_text.clone().unwrap_or_default(),
            ));
        }
        self.query_reply = None;
        let mut msg = ActionMessage::new(Action::Query);
        msg.source_id = self.id;
        msg.payload = query.as_bytes().to_vec();
        msg.extra_mut().target_name = target.to_owned();
        self.send_to_core(msg);
        self.wait_until("query reply", |state| state.query_reply.is_some())?;
        Ok(self.query_reply.take().unwrap_or_default())
    }

    /// Finalize this federate. Valid in every state, including error.
    pub fn finalize(&mut self) -> Result<(), FederateError> {
        if self.phase == FederatePhase::Finalizing {
            return Ok(());
        }
        let mut msg = ActionMessage::new(Action::Finalize);
        msg.source_id = self.id;
        self.send_to_core(msg);
        // Best effort: the ack may never come if the broker is already gone.
        let _ = self.wait_until("disconnect ack", |state| state.disconnect_acked);
        self.phase = FederatePhase::Finalizing;
        if let Some(profiler) = &mut self.profiler {
            let _ = profiler.write_file();
        }
        tracing::debug!(federate = %self.name, "finalized");
        Ok(())
    }

    /// Drain the mailbox through `process` until `done` holds.
    fn wait_until(
        &mut self,
        what: &'static str,
        done: impl Fn(&Self) -> bool,
    ) -> Result<(), FederateError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if done(self) {
                return Ok(());
            }
            if self.phase == FederatePhase::Error {
                return Err(FederateError::InErrorState(
                    self.error_text.clone().unwrap_or_default(),
                ));
            }
            if self.halted {
                return Err(FederateError::Halted);
            }
            if Instant::now() >= deadline {
                return Err(FederateError::Timeout(what));
            }
            if let Some(msg) = self.mailbox.pop_timeout(POLL_SLICE) {
                self.process(msg);
            }
        }
    }

    /// Apply one inbound envelope to the federate state.
    pub(crate) fn process(&mut self, msg: ActionMessage) {
        match msg.action {
            Action::FederateAck => {
                if msg.is_error() {
                    self.enter_error_state(msg.name().to_owned());
                } else {
                    self.id = msg.dest_id;
                    self.coordinator.set_id(self.id);
                    tracing::debug!(federate = %self.name, id = %self.id, "registered");
                }
            }
            Action::InitGrant => self.init_granted = true,
            Action::ExecGrant => self.exec_granted = true,
            Action::AddDependency
            | Action::RemoveDependency
            | Action::AddDependent
            | Action::RemoveDependent => {
                self.coordinator.process_dependency_update(&msg);
                if self.phase == FederatePhase::Created {
                    self.phase = FederatePhase::HasDependencies;
                }
            }
            Action::TimeReport | Action::TimeRequest => {
                self.coordinator.process_time_message(&msg);
            }
            Action::AddPublisher => self.handle_add_publisher(&msg),
            Action::AddSubscriber => {
                if let Some(info) = self
                    .interfaces
                    .get_mut(&msg.dest_handle)
                    .and_then(InterfaceInfo::as_publication_mut)
                {
                    info.add_subscriber(GlobalHandle::new(msg.source_id, msg.source_handle));
                }
            }
            Action::Publish => self.deliver_value(msg),
            Action::SendMessage => self.deliver_message(msg),
            Action::DisconnectFederate => {
                self.coordinator.mark_disconnected(msg.source_id);
            }
            Action::DisconnectAck => self.disconnect_acked = true,
            Action::Disconnect | Action::Terminate => {
                self.halted = true;
            }
            Action::Error | Action::GlobalError => {
                self.enter_error_state(String::from_utf8_lossy(&msg.payload).into_owned());
            }
            Action::Warning => {
                tracing::warn!(federate = %self.name, "{}", msg.name());
            }
            Action::QueryReply => {
                self.query_reply = Some(String::from_utf8_lossy(&msg.payload).into_owned());
            }
            Action::Query => self.answer_query(&msg),
            Action::Unknown => {
                tracing::warn!(federate = %self.name, "dropping envelope with unknown action tag");
            }
            Action::Ignore | Action::NullMessage => {}
            other => {
                tracing::debug!(federate = %self.name, action = %other, "unhandled envelope");
            }
        }
    }

    fn handle_add_publisher(&mut self, msg: &ActionMessage) {
        let source = GlobalHandle::new(msg.source_id, msg.source_handle);
        let (type_name, units) = msg
            .extra
            .as_ref()
            .map(|e| (e.source_name.clone(), e.target_name.clone()))
            .unwrap_or_default();
        if let Some(info) = self
            .interfaces
            .get_mut(&msg.dest_handle)
            .and_then(InterfaceInfo::as_input_mut)
        {
            info.add_source(source, &type_name, &units);
        }
    }

    fn deliver_value(&mut self, msg: ActionMessage) {
        if let Err(err) = self.coordinator.check_message_time(msg.action_time) {
            self.raise_error(err.to_string());
            return;
        }
        let source = GlobalHandle::new(msg.source_id, msg.source_handle);
        if let Some(info) = self
            .interfaces
            .get_mut(&msg.dest_handle)
            .and_then(InterfaceInfo::as_input_mut)
        {
            info.add_data(source, msg.action_time, msg.iteration, msg.payload);
        } else {
            tracing::warn!(federate = %self.name, handle = %msg.dest_handle, "publish for unknown input");
        }
    }

    fn deliver_message(&mut self, msg: ActionMessage) {
        if let Err(err) = self.coordinator.check_message_time(msg.action_time) {
            self.raise_error(err.to_string());
            return;
        }
        let source = GlobalHandle::new(msg.source_id, msg.source_handle);
        let (original_source, dest) = msg
            .extra
            .as_ref()
            .map(|e| (e.original_source.clone(), e.target_name.clone()))
            .unwrap_or_default();
        if let Some(info) = self
            .interfaces
            .get_mut(&msg.dest_handle)
            .and_then(InterfaceInfo::as_endpoint_mut)
        {
            info.add_message(EndpointMessage {
                time: msg.action_time,
                original_source,
                source,
                dest,
                data: msg.payload,
            });
        } else {
            tracing::warn!(federate = %self.name, handle = %msg.dest_handle, "message for unknown endpoint");
        }
    }

    fn answer_query(&mut self, msg: &ActionMessage) {
        let question = msg.name().to_owned();
        let answer = match question.as_str() {
            "name" => self.name.clone(),
            "state" => self.phase.to_string(),
            "current_time" => self.granted_time().to_string(),
            "publications" | "inputs" | "endpoints" => {
                let want = match question.as_str() {
                    "publications" => |i: &InterfaceInfo| matches!(i, InterfaceInfo::Publication(_)),
                    "inputs" => |i: &InterfaceInfo| matches!(i, InterfaceInfo::Input(_)),
                    _ => |i: &InterfaceInfo| matches!(i, InterfaceInfo::Endpoint(_)),
                };
                let mut keys: Vec<&str> = self
                    .interfaces
                    .values()
                    .filter(|i| want(i))
                    .map(InterfaceInfo::key)
                    .collect();
                keys.sort_unstable();
                keys.join(";")
            }
            _ => String::from("#invalid"),
        };
        let mut reply = ActionMessage::new(Action::QueryReply);
        reply.source_id = self.id;
        reply.dest_id = msg.source_id;
        reply.payload = answer.into_bytes();
        self.send_to_core(reply);
    }

    /// Consume queued input records according to the grant kind and rebuild
    /// the updated set.
    fn apply_grant_updates(&mut self, state: IterationResult, granted: Time) {
        self.updated.clear();
        for (handle, info) in &mut self.interfaces {
            if let InterfaceInfo::Input(input) = info {
                let changed = match state {
                    IterationResult::Iterating => input.update_time_next_iteration(granted),
                    _ => input.update_time_inclusive(granted),
                };
                if changed {
                    self.updated.insert(*handle);
                }
            }
        }
        self.sync_event_time();
    }

    /// Feed the coordinator the earliest locally queued event.
    fn sync_event_time(&mut self) {
        let granted = self.granted_time();
        let mut event = Time::MAX;
        let mut pending_at_granted = false;
        for info in self.interfaces.values() {
            match info {
                InterfaceInfo::Input(input) => {
                    event = event.min(input.next_value_time());
                    if input.has_pending(granted) {
                        pending_at_granted = true;
                    }
                }
                InterfaceInfo::Endpoint(endpoint) => {
                    event = event.min(endpoint.first_message_time());
                }
                _ => {}
            }
        }
        self.coordinator.set_event_time(event, pending_at_granted);
    }

    /// Resend the coordinator report to every dependent if it changed.
    fn broadcast_time_factors(&mut self) {
        if !self.coordinator.update_time_factors() {
            return;
        }
        for dependent in self.coordinator.dependents().to_vec() {
            self.send_to_core(self.coordinator.make_report(dependent));
        }
    }

    fn enter_error_state(&mut self, text: String) {
        tracing::error!(federate = %self.name, "entering error state: {text}");
        self.phase = FederatePhase::Error;
        self.error_text = Some(text);
    }

    /// Record a locally discovered error and report it to the core.
    fn raise_error(&mut self, text: String) {
        let mut msg = ActionMessage::new(Action::Error);
        msg.source_id = self.id;
        msg.flags.set(Flags::ERROR);
        msg.set_name(&text);
        self.send_to_core(msg);
        self.enter_error_state(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FED_A: GlobalFederateId = GlobalFederateId::new(131_072);
    const FED_B: GlobalFederateId = GlobalFederateId::new(131_073);

    struct Harness {
        fed: FederateState,
        mailbox: Arc<Mailbox<ActionMessage>>,
        core: Arc<Mailbox<ActionMessage>>,
    }

    /// A registered federate with one input bound to a source on FED_B,
    /// already executing, with a dependency on FED_B.
    fn executing_federate() -> (Harness, InterfaceHandle) {
        let mailbox = Arc::new(Mailbox::new());
        let core = Arc::new(Mailbox::new());
        let mut fed = FederateState::new("fed_a", mailbox.clone(), core.clone());

        let mut ack = ActionMessage::new(Action::FederateAck);
        ack.dest_id = FED_A;
        mailbox.push_priority(ack);
        fed.register().unwrap();

        let input = fed.register_input("source_value", "double", "", false).unwrap();

        let mut add_pub = ActionMessage::new(Action::AddPublisher);
        add_pub.source_id = FED_B;
        add_pub.source_handle = InterfaceHandle::new(1);
        add_pub.dest_id = FED_A;
        add_pub.dest_handle = input;
        add_pub.extra_mut().source_name = "double".to_owned();
        fed.process(add_pub);

        let mut add_dep = ActionMessage::new(Action::AddDependency);
        add_dep.source_id = FED_B;
        add_dep.dest_id = FED_A;
        fed.process(add_dep);

        mailbox.push_priority(ActionMessage::new(Action::InitGrant));
        fed.enter_initializing_mode().unwrap();
        mailbox.push_priority(ActionMessage::new(Action::ExecGrant));
        fed.enter_executing_mode().unwrap();

        (
            Harness {
                fed,
                mailbox,
                core,
            },
            input,
        )
    }

    fn report(from: GlobalFederateId, t: Time) -> ActionMessage {
        let mut msg = ActionMessage::new(Action::TimeReport);
        msg.source_id = from;
        msg.source_handle = InterfaceHandle::new(from.base_value());
        msg.action_time = t;
        let extra = msg.extra_mut();
        extra.te = t;
        extra.tdemin = t;
        msg
    }

    #[test_log::test]
    fn lifecycle_reaches_executing() {
        let (h, _input) = executing_federate();
        assert_eq!(h.fed.phase(), FederatePhase::Executing);
        assert_eq!(h.fed.id(), FED_A);
        assert_eq!(h.fed.granted_time(), Time::ZERO);
    }

    #[test_log::test]
    fn value_delivered_at_grant() {
        let (mut h, input) = executing_federate();

        let mut publish = ActionMessage::new(Action::Publish);
        publish.source_id = FED_B;
        publish.source_handle = InterfaceHandle::new(1);
        publish.dest_id = FED_A;
        publish.dest_handle = input;
        publish.action_time = Time::from_seconds(1.0);
        publish.payload = b"3.25".to_vec();
        h.mailbox.push(publish);

        h.mailbox.push(report(FED_B, Time::from_seconds(5.0)));

        let grant = h
            .fed
            .request_time(Time::from_seconds(2.0), IterationRequest::NoIterations)
            .unwrap();
        assert_eq!(grant.granted_time, Time::from_seconds(2.0));
        assert!(h.fed.is_updated(input));
        assert_eq!(h.fed.get_value(input).unwrap(), b"3.25");
    }

    #[test_log::test]
    fn late_publish_is_fatal_and_requests_fail_fast() {
        let (mut h, input) = executing_federate();

        // Grant up to t=5 first.
        h.mailbox.push(report(FED_B, Time::from_seconds(10.0)));
        let grant = h
            .fed
            .request_time(Time::from_seconds(5.0), IterationRequest::NoIterations)
            .unwrap();
        assert_eq!(grant.granted_time, Time::from_seconds(5.0));

        // A publish stamped t=4 arrives behind the granted time.
        let mut late = ActionMessage::new(Action::Publish);
        late.source_id = FED_B;
        late.source_handle = InterfaceHandle::new(1);
        late.dest_id = FED_A;
        late.dest_handle = input;
        late.action_time = Time::from_seconds(4.0);
        late.payload = b"stale".to_vec();
        h.mailbox.push(late);

        let err = h
            .fed
            .request_time(Time::from_seconds(6.0), IterationRequest::NoIterations)
            .unwrap_err();
        assert!(matches!(err, FederateError::InErrorState(_)));
        assert_eq!(h.fed.phase(), FederatePhase::Error);

        // The error was reported upward.
        let reported = std::iter::from_fn(|| h.core.try_pop())
            .any(|m: ActionMessage| m.action == Action::Error);
        assert!(reported);

        // A subsequent request errors immediately instead of blocking.
        let start = Instant::now();
        let err = h
            .fed
            .request_time(Time::from_seconds(7.0), IterationRequest::NoIterations)
            .unwrap_err();
        assert!(matches!(err, FederateError::InErrorState(_)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test_log::test]
    fn halt_breaks_pending_request() {
        let (mut h, _input) = executing_federate();
        // The dependency never advances; a Disconnect halts the wait.
        h.mailbox.push_priority(ActionMessage::new(Action::Disconnect));
        let grant = h
            .fed
            .request_time(Time::from_seconds(1.0), IterationRequest::NoIterations)
            .unwrap();
        assert_eq!(grant.state, IterationResult::Halted);
    }

    #[test_log::test]
    fn wall_clock_timeout_produces_error() {
        let (mut h, _input) = executing_federate();
        h.fed.set_request_timeout(Some(Duration::from_millis(60)));
        let err = h
            .fed
            .request_time(Time::from_seconds(1.0), IterationRequest::NoIterations)
            .unwrap_err();
        assert!(matches!(err, FederateError::Timeout(_)));
        assert_eq!(h.fed.phase(), FederatePhase::Error);
    }

    #[test_log::test]
    fn queries_answered_from_state() {
        let (mut h, _input) = executing_federate();
        let mut query = ActionMessage::new(Action::Query);
        query.source_id = FED_B;
        query.dest_id = FED_A;
        query.set_name("inputs");
        h.fed.process(query);
        let reply = std::iter::from_fn(|| h.core.try_pop())
            .find(|m| m.action == Action::QueryReply)
            .expect("reply queued");
        assert_eq!(reply.payload, b"source_value");
    }
}
