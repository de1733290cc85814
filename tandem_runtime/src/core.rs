//! The core node: a federate multiplexer.
//!
//! A core owns the federate table for its process, hosts local filter
//! execution, and talks one transport to its broker. All inbound traffic
//! lands in the core's mailbox; a dedicated worker thread demultiplexes it
//! to per-federate mailboxes or forwards it on the parent route. All
//! outgoing traffic is serialized through a single route-out worker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use tandem_core::{GlobalFederateId, GlobalHandle};

use crate::{
    interfaces::{EndpointMessage, FilterOperator},
    route::RouteSender,
    Action, ActionMessage, Flags, Mailbox,
};

const POLL_SLICE: Duration = Duration::from_millis(20);

/// Control requests from the public API into the worker.
enum CoreControl {
    AttachFederate {
        name: String,
        mailbox: Arc<Mailbox<ActionMessage>>,
    },
    SetFilterOperator {
        filter: GlobalHandle,
        operator: Box<dyn FilterOperator>,
    },
}

/// Handle to a running core worker.
pub struct Core {
    name: String,
    mailbox: Arc<Mailbox<ActionMessage>>,
    control: crossbeam_channel::Sender<CoreControl>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Start a core connected to its broker over `parent`. The core
    /// immediately announces itself with a `RegisterCore` envelope carrying
    /// `name`, which the broker's route resolver maps back to a route.
    pub fn start(name: &str, parent: Box<dyn RouteSender>) -> Arc<Core> {
        Self::start_with_mailbox(name, parent, Arc::new(Mailbox::new()))
    }

    /// Start a core reading from a caller-provided mailbox. Launchers use
    /// this to wire the mailbox into a transport (or name registry) before
    /// the core announces itself.
    pub fn start_with_mailbox(
        name: &str,
        parent: Box<dyn RouteSender>,
        mailbox: Arc<Mailbox<ActionMessage>>,
    ) -> Arc<Core> {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (out_tx, out_rx) = crossbeam_channel::unbounded::<ActionMessage>();

        // Route-out worker: the single writer on the parent link.
        let route_out = std::thread::Builder::new()
            .name(format!("{name}-route-out"))
            .spawn(move || {
                for msg in out_rx {
                    if let Err(err) = parent.send(msg) {
                        tracing::error!("core route-out failed: {err}");
                        break;
                    }
                }
            })
            .expect("spawn route-out worker");

        let state = CoreState {
            name: name.to_owned(),
            id: GlobalFederateId::INVALID,
            mailbox: mailbox.clone(),
            outbound: out_tx,
            control: control_rx,
            stalled: Vec::new(),
            feds: HashMap::new(),
            fed_names: HashMap::new(),
            pending_feds: HashMap::new(),
            subscribers: HashMap::new(),
            local_endpoints: HashMap::new(),
            src_filters: HashMap::new(),
            dst_filters: HashMap::new(),
            filter_ops: HashMap::new(),
            route_out: Some(route_out),
            terminated: false,
        };
        let worker = std::thread::Builder::new()
            .name(format!("core-{name}"))
            .spawn(move || state.run())
            .expect("spawn core worker");

        Arc::new(Core {
            name: name.to_owned(),
            mailbox,
            control: control_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The core's inbound mailbox; transports and local federates push here.
    pub fn mailbox(&self) -> Arc<Mailbox<ActionMessage>> {
        self.mailbox.clone()
    }

    /// Announce a local federate's mailbox before it registers, keyed by
    /// name until the root broker assigns an id.
    pub fn attach_federate(&self, name: &str, mailbox: Arc<Mailbox<ActionMessage>>) {
        let _ = self.control.send(CoreControl::AttachFederate {
            name: name.to_owned(),
            mailbox,
        });
    }

    /// Install the operator executed for a locally registered filter.
    pub fn set_filter_operator(&self, filter: GlobalHandle, operator: Box<dyn FilterOperator>) {
        let _ = self
            .control
            .send(CoreControl::SetFilterOperator { filter, operator });
    }

    /// Block until the worker exits (after a `Terminate` envelope).
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Worker-owned state; nothing here is shared.
struct CoreState {
    name: String,
    id: GlobalFederateId,
    mailbox: Arc<Mailbox<ActionMessage>>,
    outbound: crossbeam_channel::Sender<ActionMessage>,
    control: crossbeam_channel::Receiver<CoreControl>,
    /// Envelopes held back until the broker acknowledges this core.
    stalled: Vec<ActionMessage>,
    feds: HashMap<GlobalFederateId, Arc<Mailbox<ActionMessage>>>,
    fed_names: HashMap<GlobalFederateId, String>,
    pending_feds: HashMap<String, Arc<Mailbox<ActionMessage>>>,
    /// Subscribers of each locally owned publication.
    subscribers: HashMap<GlobalHandle, Vec<GlobalHandle>>,
    /// Locally owned endpoints by key.
    local_endpoints: HashMap<String, GlobalHandle>,
    /// Source filters by filtered endpoint key.
    src_filters: HashMap<String, Vec<GlobalHandle>>,
    /// Destination filters by filtered endpoint key.
    dst_filters: HashMap<String, Vec<GlobalHandle>>,
    filter_ops: HashMap<GlobalHandle, Box<dyn FilterOperator>>,
    route_out: Option<JoinHandle<()>>,
    terminated: bool,
}

impl CoreState {
    #[tracing::instrument(skip(self), fields(core = %self.name))]
    fn run(mut self) {
        let mut announce = ActionMessage::new(Action::RegisterCore);
        announce.set_name(&self.name);
        self.send_up(announce);

        while !self.terminated {
            while let Ok(control) = self.control.try_recv() {
                self.handle_control(control);
            }
            if let Some(msg) = self.mailbox.pop_timeout(POLL_SLICE) {
                self.handle(msg);
            }
        }

        // Dropping the outbound sender stops the route-out worker.
        let (closed, _) = crossbeam_channel::unbounded();
        self.outbound = closed;
        if let Some(handle) = self.route_out.take() {
            let _ = handle.join();
        }
        tracing::debug!("core worker exiting");
    }

    fn handle_control(&mut self, control: CoreControl) {
        match control {
            CoreControl::AttachFederate { name, mailbox } => {
                self.pending_feds.insert(name, mailbox);
            }
            CoreControl::SetFilterOperator { filter, operator } => {
                self.filter_ops.insert(filter, operator);
            }
        }
    }

    fn send_up(&self, msg: ActionMessage) {
        let _ = self.outbound.send(msg);
    }

    /// Push to a local federate mailbox, or forward toward the broker.
    fn deliver(&mut self, msg: ActionMessage) {
        if let Some(mailbox) = self.feds.get(&msg.dest_id) {
            if msg.is_priority() {
                mailbox.push_priority(msg);
            } else {
                mailbox.push(msg);
            }
        } else {
            self.send_up(msg);
        }
    }

    fn broadcast_local(&mut self, msg: &ActionMessage) {
        for mailbox in self.feds.values() {
            let mut copy = msg.clone();
            copy.dest_id = GlobalFederateId::INVALID;
            if copy.is_priority() {
                mailbox.push_priority(copy);
            } else {
                mailbox.push(copy);
            }
        }
    }

    fn handle(&mut self, mut msg: ActionMessage) {
        // Apply pending control first: a federate attach or operator install
        // must be visible before the envelope that depends on it.
        while let Ok(control) = self.control.try_recv() {
            self.handle_control(control);
        }
        // Everything leaving this core needs the broker to know its origin;
        // hold traffic until the broker has acknowledged us.
        if !self.id.is_valid() && msg.action != Action::CoreAck {
            self.stalled.push(msg);
            return;
        }
        match msg.action {
            Action::CoreAck => {
                self.id = msg.dest_id;
                tracing::debug!(core = %self.name, id = %self.id, "core acknowledged");
                for stalled in std::mem::take(&mut self.stalled) {
                    self.handle(stalled);
                }
            }
            Action::RegisterFederate => {
                // Stamp the owning core so the broker can route the ack.
                msg.source_id = self.id;
                self.send_up(msg);
            }
            Action::FederateAck => {
                let name = msg.name().to_owned();
                if let Some(mailbox) = self.pending_feds.remove(&name) {
                    self.feds.insert(msg.dest_id, mailbox.clone());
                    self.fed_names.insert(msg.dest_id, name);
                    mailbox.push_priority(msg);
                } else {
                    tracing::warn!(core = %self.name, "ack for unknown federate {name:?}");
                }
            }
            Action::RegisterPublication
            | Action::RegisterInput
            | Action::RegisterFilter => {
                self.send_up(msg);
            }
            Action::RegisterEndpoint => {
                self.local_endpoints.insert(
                    msg.name().to_owned(),
                    GlobalHandle::new(msg.source_id, msg.source_handle),
                );
                self.send_up(msg);
            }
            Action::AddFilterTarget => {
                if self.feds.contains_key(&msg.dest_id) {
                    // A filter attached to one of our endpoints.
                    let filter = GlobalHandle::new(msg.source_id, msg.source_handle);
                    let table = if msg.flags.contains(Flags::DEST_FILTER) {
                        &mut self.dst_filters
                    } else {
                        &mut self.src_filters
                    };
                    table.entry(msg.name().to_owned()).or_default().push(filter);
                } else {
                    self.send_up(msg);
                }
            }
            Action::AddSubscriber => {
                if self.feds.contains_key(&msg.dest_id) {
                    let publication = GlobalHandle::new(msg.dest_id, msg.dest_handle);
                    let subscriber = GlobalHandle::new(msg.source_id, msg.source_handle);
                    let subs = self.subscribers.entry(publication).or_default();
                    if !subs.contains(&subscriber) {
                        subs.push(subscriber);
                    }
                }
                self.deliver(msg);
            }
            Action::Publish => {
                if msg.dest_id.is_valid() {
                    // Addressed copy coming down from the broker.
                    self.deliver(msg);
                } else {
                    self.fan_out_publish(msg);
                }
            }
            Action::SendMessage => self.route_message(msg),
            Action::SendForFilter => self.run_filter(msg),
            Action::Error | Action::LocalError => {
                if msg.dest_id.is_valid() {
                    self.deliver(msg);
                } else {
                    // Annotate with the source federate name and escalate.
                    if let Some(name) = self.fed_names.get(&msg.source_id) {
                        msg.extra_mut().source_name = name.clone();
                    }
                    self.send_up(msg);
                }
            }
            Action::GlobalError => {
                if msg.dest_id.is_valid() {
                    self.deliver(msg);
                } else {
                    self.broadcast_local(&msg);
                }
            }
            Action::InitGrant | Action::ExecGrant | Action::DisconnectFederate => {
                if msg.dest_id.is_valid() {
                    self.deliver(msg);
                } else {
                    self.broadcast_local(&msg);
                }
            }
            Action::Query => {
                if msg.extra.as_ref().map(|e| e.target_name.as_str()) == Some(self.name.as_str()) {
                    self.answer_query(&msg);
                } else {
                    self.deliver(msg);
                }
            }
            Action::Terminate => {
                self.broadcast_local(&msg);
                self.terminated = true;
            }
            Action::Unknown => {
                tracing::warn!(core = %self.name, "dropping envelope with unknown action tag");
            }
            Action::Ignore => {}
            // Time traffic, barriers, acks, disconnects, replies: routed by
            // destination, or escalated when they originate locally.
            _ => self.deliver(msg),
        }
    }

    /// Deliver a publish to every subscriber of the source publication.
    fn fan_out_publish(&mut self, msg: ActionMessage) {
        let publication = GlobalHandle::new(msg.source_id, msg.source_handle);
        let Some(subs) = self.subscribers.get(&publication) else {
            return;
        };
        for sub in subs.clone() {
            let mut copy = msg.clone();
            copy.dest_id = sub.federate;
            copy.dest_handle = sub.handle;
            self.deliver(copy);
        }
    }

    /// Route a message envelope, applying source filters at the sending core
    /// and destination filters at the delivering core.
    fn route_message(&mut self, mut msg: ActionMessage) {
        let source_key = msg
            .extra
            .as_ref()
            .map(|e| e.source_name.clone())
            .unwrap_or_default();
        if !msg.flags.contains(Flags::SRC_FILTERED) {
            msg.flags.set(Flags::SRC_FILTERED);
            if let Some(filter) = self.first_filter(&self.src_filters, &source_key) {
                self.divert_to_filter(filter, msg);
                return;
            }
        }

        let dest_key = msg
            .extra
            .as_ref()
            .map(|e| e.target_name.clone())
            .unwrap_or_default();
        match self.local_endpoints.get(&dest_key).copied() {
            Some(endpoint) => {
                if !msg.flags.contains(Flags::DST_FILTERED) {
                    msg.flags.set(Flags::DST_FILTERED);
                    if let Some(filter) = self.first_filter(&self.dst_filters, &dest_key) {
                        self.divert_to_filter(filter, msg);
                        return;
                    }
                }
                msg.dest_id = endpoint.federate;
                msg.dest_handle = endpoint.handle;
                self.deliver(msg);
            }
            None if msg.dest_id.is_valid() => self.deliver(msg),
            None => self.send_up(msg),
        }
    }

    fn first_filter(
        &self,
        table: &HashMap<String, Vec<GlobalHandle>>,
        key: &str,
    ) -> Option<GlobalHandle> {
        table.get(key).and_then(|filters| filters.first()).copied()
    }

    /// Hand a message to a filter for processing, locally when the operator
    /// lives here, otherwise via the filter federate's core.
    fn divert_to_filter(&mut self, filter: GlobalHandle, mut msg: ActionMessage) {
        if self.filter_ops.contains_key(&filter) {
            msg.dest_id = filter.federate;
            msg.dest_handle = filter.handle;
            msg.action = Action::SendForFilter;
            self.run_filter(msg);
        } else {
            msg.action = Action::SendForFilter;
            msg.dest_id = filter.federate;
            msg.dest_handle = filter.handle;
            self.deliver(msg);
        }
    }

    /// Execute a locally installed filter operator and re-route its outputs
    /// as freshly sent messages. A filter with no installed operator passes
    /// the message through unchanged.
    fn run_filter(&mut self, msg: ActionMessage) {
        let filter = GlobalHandle::new(msg.dest_id, msg.dest_handle);
        let input_time = msg.action_time;
        let flags = msg.flags;
        let (original_source, source_key, dest_key) = msg
            .extra
            .as_ref()
            .map(|e| {
                (
                    e.original_source.clone(),
                    e.source_name.clone(),
                    e.target_name.clone(),
                )
            })
            .unwrap_or_default();
        let input = EndpointMessage {
            time: msg.action_time,
            original_source,
            source: GlobalHandle::new(msg.source_id, msg.source_handle),
            dest: dest_key,
            data: msg.payload,
        };

        let outputs = match self.filter_ops.get_mut(&filter) {
            Some(operator) => operator.process(input),
            None => vec![input],
        };
        for output in outputs {
            if output.time < input_time {
                let mut err = ActionMessage::new(Action::Error);
                err.flags.set(Flags::ERROR);
                err.source_id = filter.federate;
                err.set_name("filter produced a message earlier than its input");
                self.send_up(err);
                continue;
            }
            let mut out = ActionMessage::new(Action::SendMessage);
            out.flags = flags;
            out.source_id = filter.federate;
            out.source_handle = filter.handle;
            out.action_time = output.time;
            out.payload = output.data;
            let extra = out.extra_mut();
            extra.original_source = output.original_source;
            extra.source_name = source_key.clone();
            extra.target_name = output.dest;
            self.route_message(out);
        }
    }

    fn answer_query(&mut self, msg: &ActionMessage) {
        let answer = match msg.name() {
            "name" => self.name.clone(),
            "federates" => {
                let mut names: Vec<&str> =
                    self.fed_names.values().map(String::as_str).collect();
                names.sort_unstable();
                names.join(";")
            }
            _ => String::from("#invalid"),
        };
        let mut reply = ActionMessage::new(Action::QueryReply);
        reply.source_id = self.id;
        reply.dest_id = msg.source_id;
        reply.payload = answer.into_bytes();
        self.deliver(reply);
    }
}
