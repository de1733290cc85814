//! Broker worker: accepts cores and sub-brokers, routes by federate id,
//! resolves deferred subscriptions, and runs the federation barriers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use tandem_core::{ids::FEDERATE_ID_BASE, GlobalFederateId, GlobalHandle, RouteId};
use tandem_runtime::{
    registry::{HandleInfo, HandleKind, HandleRegistry},
    route::{RouteResolver, RouteSender},
    Action, ActionMessage, Flags, Mailbox,
};

const POLL_SLICE: Duration = Duration::from_millis(20);

/// Broker configuration, mirroring the node CLI surface.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    /// Number of federates the init barrier waits for (`--federates=N`).
    pub federates: usize,
    /// The root broker allocates ids; non-root brokers forward upward.
    pub root: bool,
}

impl BrokerConfig {
    pub fn new(name: &str, federates: usize) -> Self {
        Self {
            name: name.to_owned(),
            federates,
            root: true,
        }
    }

    pub fn sub_broker(mut self) -> Self {
        self.root = false;
        self
    }
}

/// Handle to a running broker worker.
pub struct Broker {
    name: String,
    mailbox: Arc<Mailbox<ActionMessage>>,
    errored: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Start a broker. `resolver` maps the names presented in `RegisterCore`
    /// envelopes to send routes; `parent` is the uplink for non-root
    /// brokers.
    pub fn start(
        config: BrokerConfig,
        resolver: Box<dyn RouteResolver>,
        parent: Option<Box<dyn RouteSender>>,
    ) -> Arc<Broker> {
        Self::start_with_mailbox(config, resolver, parent, Arc::new(Mailbox::new()))
    }

    /// Start a broker reading from a caller-provided mailbox, so launchers
    /// can point a transport at it before any traffic arrives.
    pub fn start_with_mailbox(
        config: BrokerConfig,
        resolver: Box<dyn RouteResolver>,
        parent: Option<Box<dyn RouteSender>>,
        mailbox: Arc<Mailbox<ActionMessage>>,
    ) -> Arc<Broker> {
        let errored = Arc::new(AtomicBool::new(false));
        let mut state = BrokerState::new(config.clone(), mailbox.clone(), resolver, parent);
        state.errored = errored.clone();
        let worker = std::thread::Builder::new()
            .name(format!("broker-{}", config.name))
            .spawn(move || state.run())
            .expect("spawn broker worker");
        Arc::new(Broker {
            name: config.name,
            mailbox,
            errored,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mailbox(&self) -> Arc<Mailbox<ActionMessage>> {
        self.mailbox.clone()
    }

    /// True once any error envelope has crossed this broker.
    pub fn observed_error(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    /// Block until the federation has drained and the worker exited.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

struct FedRecord {
    id: GlobalFederateId,
    name: String,
    route: RouteId,
    init_requested: bool,
    exec_requested: bool,
    disconnected: bool,
    errored: bool,
    /// Owns endpoints or filters, so it joins the message timing mesh.
    in_message_mesh: bool,
}

impl FedRecord {
    fn active(&self) -> bool {
        !self.disconnected && !self.errored
    }
}

struct PendingSubscription {
    input: GlobalHandle,
    required: bool,
}

struct BrokerState {
    name: String,
    root: bool,
    /// This broker's own id, assigned by the parent for sub-brokers.
    id: GlobalFederateId,
    expected_federates: usize,
    mailbox: Arc<Mailbox<ActionMessage>>,
    parent: Option<Box<dyn RouteSender>>,
    resolver: Box<dyn RouteResolver>,
    routes: HashMap<RouteId, Box<dyn RouteSender>>,
    /// Node id (core, sub-broker, or federate) to its outbound route.
    route_of: HashMap<GlobalFederateId, RouteId>,
    next_route: i32,
    next_broker_id: i32,
    next_fed_id: i32,
    /// Pass-through bookkeeping for a non-root broker: registration name to
    /// the route it arrived on, resolved when the ack comes back down.
    pending_names: HashMap<String, RouteId>,
    /// Global naming: publications, endpoints, filters by key.
    handles: HandleRegistry,
    /// Subscriptions whose matching publication is not yet registered.
    pending_subs: HashMap<String, Vec<PendingSubscription>>,
    /// Filter attachments whose endpoint is not yet registered.
    pending_filter_targets: Vec<ActionMessage>,
    feds: Vec<FedRecord>,
    cores: Vec<GlobalFederateId>,
    init_granted: bool,
    exec_granted: bool,
    mesh_built: bool,
    terminated: bool,
    errored: Arc<AtomicBool>,
}

impl BrokerState {
    fn new(
        config: BrokerConfig,
        mailbox: Arc<Mailbox<ActionMessage>>,
        resolver: Box<dyn RouteResolver>,
        parent: Option<Box<dyn RouteSender>>,
    ) -> Self {
        Self {
            name: config.name,
            root: config.root,
            id: if config.root {
                // The root broker is node 1 by definition.
                GlobalFederateId::new(1)
            } else {
                GlobalFederateId::INVALID
            },
            expected_federates: config.federates,
            mailbox,
            parent,
            resolver,
            routes: HashMap::new(),
            route_of: HashMap::new(),
            next_route: 1,
            // The broker itself is node 1; children allocate upward.
            next_broker_id: 2,
            next_fed_id: FEDERATE_ID_BASE,
            pending_names: HashMap::new(),
            handles: HandleRegistry::new(),
            pending_subs: HashMap::new(),
            pending_filter_targets: Vec::new(),
            feds: Vec::new(),
            cores: Vec::new(),
            init_granted: false,
            exec_granted: false,
            mesh_built: false,
            terminated: false,
            errored: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tracing::instrument(skip(self), fields(broker = %self.name))]
    fn run(mut self) {
        if !self.root {
            // Announce to the parent broker.
            let mut announce = ActionMessage::new(Action::RegisterBroker);
            announce.set_name(&self.name);
            self.forward_up(announce);
        }
        while !self.terminated {
            if let Some(msg) = self.mailbox.pop_timeout(POLL_SLICE) {
                self.handle(msg);
            }
        }
        tracing::debug!("broker worker exiting");
    }

    fn alloc_route(&mut self, sender: Box<dyn RouteSender>) -> RouteId {
        let route = RouteId::new(self.next_route);
        self.next_route += 1;
        self.routes.insert(route, sender);
        route
    }

    fn send_on(&self, route: RouteId, msg: ActionMessage) {
        if let Some(sender) = self.routes.get(&route) {
            if let Err(err) = sender.send(msg) {
                tracing::error!(broker = %self.name, %route, "route send failed: {err}");
            }
        } else {
            tracing::warn!(broker = %self.name, %route, "send on unknown route");
        }
    }

    /// Route by destination id; unknown destinations go to the parent.
    fn route_down_or_up(&self, msg: ActionMessage) {
        match self.route_of.get(&msg.dest_id) {
            Some(route) => self.send_on(*route, msg),
            None => {
                if let Some(parent) = &self.parent {
                    let _ = parent.send(msg);
                } else {
                    tracing::warn!(broker = %self.name, dest = %msg.dest_id, action = %msg.action, "dropping unroutable envelope");
                }
            }
        }
    }

    fn fed_record(&mut self, id: GlobalFederateId) -> Option<&mut FedRecord> {
        self.feds.iter_mut().find(|f| f.id == id)
    }

    fn error_to(&self, fed: GlobalFederateId, text: &str) {
        self.errored.store(true, Ordering::Release);
        let mut msg = ActionMessage::new(Action::Error);
        msg.flags.set(Flags::ERROR);
        msg.dest_id = fed;
        msg.set_name(text);
        self.route_down_or_up(msg);
    }

    fn handle(&mut self, msg: ActionMessage) {
        match msg.action {
            // Sub-brokers attach exactly like cores, with their own ack tag.
            Action::RegisterCore | Action::RegisterBroker => self.handle_register_core(msg),
            Action::CoreAck | Action::FederateAck | Action::BrokerAck if !self.root => {
                // Pass-through ack on its way down: learn the route.
                let name = msg.name().to_owned();
                if name == self.name {
                    self.id = msg.dest_id;
                    tracing::debug!(broker = %self.name, id = %self.id, "sub-broker acknowledged");
                } else if let Some(route) = self.pending_names.remove(&name) {
                    self.route_of.insert(msg.dest_id, route);
                    self.send_on(route, msg);
                } else {
                    self.route_down_or_up(msg);
                }
            }
            Action::RegisterFederate => self.handle_register_federate(msg),
            Action::RegisterPublication => self.handle_register_publication(msg),
            Action::RegisterInput => self.handle_register_input(msg),
            Action::RegisterEndpoint => self.handle_register_endpoint(msg),
            Action::RegisterFilter => self.handle_register_filter(msg),
            Action::AddFilterTarget => self.handle_filter_target(msg),
            Action::InitRequest => {
                if !self.root {
                    self.forward_up(msg);
                    return;
                }
                if let Some(fed) = self.fed_record(msg.source_id) {
                    fed.init_requested = true;
                }
                self.check_barriers();
            }
            Action::ExecRequest => {
                if !self.root {
                    self.forward_up(msg);
                    return;
                }
                if let Some(fed) = self.fed_record(msg.source_id) {
                    fed.exec_requested = true;
                }
                self.check_barriers();
            }
            Action::SendMessage => self.handle_send_message(msg),
            Action::Error | Action::LocalError => self.handle_error(msg),
            Action::GlobalError => self.handle_error(msg),
            Action::Finalize => self.handle_finalize(msg),
            Action::Query => self.handle_query(msg),
            Action::Ping => {
                let mut pong = ActionMessage::new(Action::Pong);
                pong.dest_id = msg.source_id;
                self.route_down_or_up(pong);
            }
            Action::DisconnectCore | Action::DisconnectBroker => {
                self.cores.retain(|c| *c != msg.source_id);
                if self.cores.is_empty() {
                    self.terminated = true;
                }
            }
            Action::Terminate => self.terminated = true,
            Action::Unknown => {
                tracing::warn!(broker = %self.name, "dropping envelope with unknown action tag");
            }
            Action::Ignore => {}
            // Time traffic, data copies, replies, acks: routed by id.
            _ => self.route_down_or_up(msg),
        }
    }

    fn forward_up(&self, msg: ActionMessage) {
        if let Some(parent) = &self.parent {
            let _ = parent.send(msg);
        }
    }

    fn handle_register_core(&mut self, msg: ActionMessage) {
        let name = msg.name().to_owned();
        let Some(sender) = self.resolver.resolve(&name) else {
            tracing::error!(broker = %self.name, core = %name, "cannot resolve route for core");
            return;
        };
        let route = self.alloc_route(sender);
        if !self.root {
            self.pending_names.insert(name, route);
            self.forward_up(msg);
            return;
        }
        let id = GlobalFederateId::new(self.next_broker_id);
        self.next_broker_id += 1;
        self.route_of.insert(id, route);
        self.cores.push(id);

        let ack_action = if msg.action == Action::RegisterBroker {
            Action::BrokerAck
        } else {
            Action::CoreAck
        };
        let mut ack = ActionMessage::new(ack_action);
        ack.dest_id = id;
        ack.set_name(&name);
        self.send_on(route, ack);
        tracing::info!(broker = %self.name, child = %name, %id, "child node registered");
    }

    fn handle_register_federate(&mut self, msg: ActionMessage) {
        let name = msg.name().to_owned();
        let Some(&core_route) = self.route_of.get(&msg.source_id) else {
            tracing::error!(broker = %self.name, "federate registration from unknown core");
            return;
        };
        if !self.root {
            self.pending_names.insert(name, core_route);
            self.forward_up(msg);
            return;
        }
        if self.feds.iter().any(|f| f.name == name) {
            let mut ack = ActionMessage::new(Action::FederateAck);
            ack.flags.set(Flags::ERROR);
            ack.set_name(&format!("duplicate federate name {name:?}"));
            self.send_on(core_route, ack);
            return;
        }
        let id = GlobalFederateId::new(self.next_fed_id);
        self.next_fed_id += 1;
        self.route_of.insert(id, core_route);
        self.feds.push(FedRecord {
            id,
            name: name.clone(),
            route: core_route,
            init_requested: false,
            exec_requested: false,
            disconnected: false,
            errored: false,
            in_message_mesh: false,
        });

        let mut ack = ActionMessage::new(Action::FederateAck);
        ack.dest_id = id;
        ack.set_name(&name);
        self.send_on(core_route, ack);
        tracing::info!(broker = %self.name, federate = %name, %id, "federate registered");
    }

    fn interface_info(&self, msg: &ActionMessage, kind: HandleKind) -> HandleInfo {
        let (type_name, units) = msg
            .extra
            .as_ref()
            .map(|e| (e.source_name.clone(), e.target_name.clone()))
            .unwrap_or_default();
        HandleInfo {
            handle: GlobalHandle::new(msg.source_id, msg.source_handle),
            kind,
            key: msg.name().to_owned(),
            type_name,
            units,
            flags: msg.flags,
        }
    }

    fn handle_register_publication(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let info = self.interface_info(&msg, HandleKind::Publication);
        let key = info.key.clone();
        let publication = info.handle;
        if self.handles.register(info).is_err() {
            self.error_to(msg.source_id, &format!("duplicate publication name {key:?}"));
            return;
        }
        // Late-joining subscribers bind as soon as the publication appears.
        for pending in self.pending_subs.remove(&key).unwrap_or_default() {
            self.bind_subscription(publication, pending.input);
        }
    }

    fn handle_register_input(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let key = msg.name().to_owned();
        let input = GlobalHandle::new(msg.source_id, msg.source_handle);
        match self.handles.resolve(HandleKind::Publication, &key) {
            Some(publication) => self.bind_subscription(publication, input),
            None => {
                self.pending_subs.entry(key).or_default().push(PendingSubscription {
                    input,
                    required: msg.flags.contains(Flags::REQUIRED),
                });
            }
        }
    }

    /// Wire a publication to a subscribing input: the value path, then the
    /// coordinator dependency edges.
    fn bind_subscription(&mut self, publication: GlobalHandle, input: GlobalHandle) {
        let (pub_type, pub_units) = self
            .handles
            .lookup(publication)
            .map(|info| (info.type_name.clone(), info.units.clone()))
            .unwrap_or_default();

        let mut add_publisher = ActionMessage::new(Action::AddPublisher);
        add_publisher.source_id = publication.federate;
        add_publisher.source_handle = publication.handle;
        add_publisher.dest_id = input.federate;
        add_publisher.dest_handle = input.handle;
        let extra = add_publisher.extra_mut();
        extra.source_name = pub_type;
        extra.target_name = pub_units;
        self.route_down_or_up(add_publisher);

        let mut add_subscriber = ActionMessage::new(Action::AddSubscriber);
        add_subscriber.source_id = input.federate;
        add_subscriber.source_handle = input.handle;
        add_subscriber.dest_id = publication.federate;
        add_subscriber.dest_handle = publication.handle;
        self.route_down_or_up(add_subscriber);

        if publication.federate != input.federate {
            self.add_dependency_edge(input.federate, publication.federate);
        }
    }

    /// `dependent` depends on `upstream`: inform both coordinators.
    fn add_dependency_edge(&self, dependent: GlobalFederateId, upstream: GlobalFederateId) {
        let mut add_dependency = ActionMessage::new(Action::AddDependency);
        add_dependency.source_id = upstream;
        add_dependency.dest_id = dependent;
        self.route_down_or_up(add_dependency);

        let mut add_dependent = ActionMessage::new(Action::AddDependent);
        add_dependent.source_id = dependent;
        add_dependent.dest_id = upstream;
        self.route_down_or_up(add_dependent);
    }

    fn handle_register_endpoint(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let info = self.interface_info(&msg, HandleKind::Endpoint);
        let key = info.key.clone();
        if self.handles.register(info).is_err() {
            self.error_to(msg.source_id, &format!("duplicate endpoint name {key:?}"));
            return;
        }
        if let Some(fed) = self.fed_record(msg.source_id) {
            fed.in_message_mesh = true;
        }
        // Filter attachments that were waiting for this endpoint.
        let pending = std::mem::take(&mut self.pending_filter_targets);
        for target in pending {
            if target.name() == key {
                self.handle_filter_target(target);
            } else {
                self.pending_filter_targets.push(target);
            }
        }
    }

    fn handle_register_filter(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let info = self.interface_info(&msg, HandleKind::Filter);
        let key = info.key.clone();
        if self.handles.register(info).is_err() {
            self.error_to(msg.source_id, &format!("duplicate filter name {key:?}"));
            return;
        }
        // Filter federates take part in message timing.
        if let Some(fed) = self.fed_record(msg.source_id) {
            fed.in_message_mesh = true;
        }
    }

    fn handle_filter_target(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let key = msg.name().to_owned();
        match self.handles.resolve(HandleKind::Endpoint, &key) {
            Some(endpoint) => {
                let mut attach = msg.clone();
                attach.dest_id = endpoint.federate;
                attach.dest_handle = endpoint.handle;
                self.route_down_or_up(attach);
            }
            None => self.pending_filter_targets.push(msg),
        }
    }

    /// Resolve a message envelope's destination by endpoint key and route it.
    fn handle_send_message(&mut self, mut msg: ActionMessage) {
        if msg.dest_id.is_valid() {
            self.route_down_or_up(msg);
            return;
        }
        let key = msg
            .extra
            .as_ref()
            .map(|e| e.target_name.clone())
            .unwrap_or_default();
        match self.handles.resolve(HandleKind::Endpoint, &key) {
            Some(endpoint) => {
                msg.dest_id = endpoint.federate;
                msg.dest_handle = endpoint.handle;
                self.route_down_or_up(msg);
            }
            None if self.root => {
                self.error_to(msg.source_id, &format!("unknown message target {key:?}"));
            }
            None => self.forward_up(msg),
        }
    }

    fn handle_error(&mut self, msg: ActionMessage) {
        if msg.dest_id.is_valid() {
            self.route_down_or_up(msg);
            return;
        }
        if !self.root {
            self.forward_up(msg);
            return;
        }
        tracing::error!(broker = %self.name, source = %msg.source_id, "federation error: {}", msg.name());
        self.errored.store(true, Ordering::Release);
        if let Some(fed) = self.fed_record(msg.source_id) {
            fed.errored = true;
        }
        // Broadcast so every federate sharing the dependency fabric halts
        // its next grant with the error.
        let targets: Vec<GlobalFederateId> = self
            .feds
            .iter()
            .filter(|f| f.active() && f.id != msg.source_id)
            .map(|f| f.id)
            .collect();
        for fed in targets {
            let mut copy = ActionMessage::new(Action::GlobalError);
            copy.flags.set(Flags::ERROR);
            copy.source_id = msg.source_id;
            copy.dest_id = fed;
            copy.payload = msg.payload.clone();
            self.route_down_or_up(copy);
        }
        self.check_barriers();
    }

    fn handle_finalize(&mut self, msg: ActionMessage) {
        if !self.root {
            self.forward_up(msg);
            return;
        }
        let Some(fed) = self.fed_record(msg.source_id) else {
            return;
        };
        fed.disconnected = true;
        let route = fed.route;
        let name = fed.name.clone();
        tracing::info!(broker = %self.name, federate = %name, "federate disconnected");

        // Retire its handles, then drain in-flight references.
        self.handles.remove_federate(msg.source_id);
        let mut ack = ActionMessage::new(Action::DisconnectAck);
        ack.dest_id = msg.source_id;
        self.send_on(route, ack);

        let remaining: Vec<GlobalFederateId> = self
            .feds
            .iter()
            .filter(|f| f.active())
            .map(|f| f.id)
            .collect();
        for fed in remaining {
            let mut notice = ActionMessage::new(Action::DisconnectFederate);
            notice.source_id = msg.source_id;
            notice.dest_id = fed;
            self.route_down_or_up(notice);
        }

        self.check_barriers();
        if self.feds.iter().all(|f| f.disconnected || f.errored) && !self.feds.is_empty() {
            for core in &self.cores {
                if let Some(route) = self.route_of.get(core) {
                    self.send_on(*route, ActionMessage::new(Action::Terminate));
                }
            }
            self.terminated = true;
        }
    }

    fn active_feds(&self) -> Vec<GlobalFederateId> {
        self.feds
            .iter()
            .filter(|f| f.active())
            .map(|f| f.id)
            .collect()
    }

    /// Barriers complete when every expected federate has asked; grants are
    /// broadcast once.
    fn check_barriers(&mut self) {
        if !self.root {
            return;
        }
        let active_count = self.feds.iter().filter(|f| f.active()).count();
        let all_init = self
            .feds
            .iter()
            .filter(|f| f.active())
            .all(|f| f.init_requested);
        if !self.init_granted
            && self.feds.len() >= self.expected_federates
            && active_count > 0
            && all_init
        {
            self.check_required_subscriptions();
            self.build_message_mesh();
            self.init_granted = true;
            for fed in self.active_feds() {
                let mut grant = ActionMessage::new(Action::InitGrant);
                grant.dest_id = fed;
                self.route_down_or_up(grant);
            }
            tracing::info!(broker = %self.name, "initialization barrier released");
        }

        let active_count = self.feds.iter().filter(|f| f.active()).count();
        let all_exec = self
            .feds
            .iter()
            .filter(|f| f.active())
            .all(|f| f.exec_requested);
        if self.init_granted && !self.exec_granted && active_count > 0 && all_exec {
            self.exec_granted = true;
            for fed in self.active_feds() {
                let mut grant = ActionMessage::new(Action::ExecGrant);
                grant.dest_id = fed;
                self.route_down_or_up(grant);
            }
            tracing::info!(broker = %self.name, "execution barrier released");
        }
    }

    /// A `required` subscription left unbound at the init barrier is a
    /// registration error for its federate, non-fatal to peers.
    fn check_required_subscriptions(&mut self) {
        let unbound: Vec<(GlobalFederateId, String)> = self
            .pending_subs
            .iter()
            .flat_map(|(key, pendings)| {
                pendings
                    .iter()
                    .filter(|p| p.required)
                    .map(|p| (p.input.federate, key.clone()))
            })
            .collect();
        for (fed, key) in unbound {
            self.error_to(fed, &format!("required subscription {key:?} has no publication"));
            if let Some(record) = self.fed_record(fed) {
                record.errored = true;
            }
        }
    }

    /// Conservative timing coupling for discrete messages: every federate
    /// owning an endpoint or filter may exchange messages with every other,
    /// so each pair becomes mutually dependent before execution starts.
    fn build_message_mesh(&mut self) {
        if self.mesh_built {
            return;
        }
        self.mesh_built = true;
        let members: Vec<GlobalFederateId> = self
            .feds
            .iter()
            .filter(|f| f.active() && f.in_message_mesh)
            .map(|f| f.id)
            .collect();
        for &a in &members {
            for &b in &members {
                if a != b {
                    self.add_dependency_edge(a, b);
                }
            }
        }
    }

    fn handle_query(&mut self, msg: ActionMessage) {
        let target = msg
            .extra
            .as_ref()
            .map(|e| e.target_name.clone())
            .unwrap_or_default();
        if target == self.name {
            let answer = match msg.name() {
                "name" => self.name.clone(),
                "federates" => {
                    let mut names: Vec<&str> =
                        self.feds.iter().map(|f| f.name.as_str()).collect();
                    names.sort_unstable();
                    names.join(";")
                }
                "isinit" => self.init_granted.to_string(),
                _ => String::from("#invalid"),
            };
            let mut reply = ActionMessage::new(Action::QueryReply);
            reply.dest_id = msg.source_id;
            reply.payload = answer.into_bytes();
            self.route_down_or_up(reply);
            return;
        }
        // A query against a federate by name.
        if let Some(fed) = self.feds.iter().find(|f| f.name == target) {
            let mut forward = msg.clone();
            forward.dest_id = fed.id;
            self.route_down_or_up(forward);
            return;
        }
        if self.root {
            let mut reply = ActionMessage::new(Action::QueryReply);
            reply.dest_id = msg.source_id;
            reply.payload = b"#unknown_target".to_vec();
            self.route_down_or_up(reply);
        } else {
            self.forward_up(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::InterfaceHandle;

    /// Resolver backed by a name-to-mailbox table, standing in for the
    /// in-process transport.
    struct TableResolver {
        table: HashMap<String, Arc<Mailbox<ActionMessage>>>,
    }

    impl RouteResolver for TableResolver {
        fn resolve(&self, name: &str) -> Option<Box<dyn RouteSender>> {
            self.table
                .get(name)
                .map(|mailbox| Box::new(mailbox.clone()) as Box<dyn RouteSender>)
        }
    }

    struct TestBench {
        broker: Arc<Broker>,
        core_rx: Arc<Mailbox<ActionMessage>>,
    }

    fn bench(federates: usize) -> TestBench {
        let core_rx = Arc::new(Mailbox::new());
        let resolver = TableResolver {
            table: HashMap::from([("core0".to_owned(), core_rx.clone())]),
        };
        let broker = Broker::start(
            BrokerConfig::new("root", federates),
            Box::new(resolver),
            None,
        );
        let mut announce = ActionMessage::new(Action::RegisterCore);
        announce.set_name("core0");
        broker.mailbox().push_priority(announce);
        TestBench { broker, core_rx }
    }

    fn expect(core_rx: &Mailbox<ActionMessage>, action: Action) -> ActionMessage {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if let Some(msg) = core_rx.pop_timeout(Duration::from_millis(50)) {
                if msg.action == action {
                    return msg;
                }
            }
        }
        panic!("did not receive {action} in time");
    }

    fn register_fed(bench: &TestBench, core_id: GlobalFederateId, name: &str) -> GlobalFederateId {
        let mut msg = ActionMessage::new(Action::RegisterFederate);
        msg.source_id = core_id;
        msg.set_name(name);
        bench.broker.mailbox().push_priority(msg);
        let ack = expect(&bench.core_rx, Action::FederateAck);
        assert_eq!(ack.name(), name);
        assert!(ack.dest_id.is_federate());
        ack.dest_id
    }

    #[test_log::test]
    fn core_and_federate_registration() {
        let bench = bench(1);
        let core_ack = expect(&bench.core_rx, Action::CoreAck);
        assert!(core_ack.dest_id.is_broker());

        let fed = register_fed(&bench, core_ack.dest_id, "fed0");
        assert!(fed.is_federate());

        // A duplicate name is rejected with an error-flagged ack.
        let mut msg = ActionMessage::new(Action::RegisterFederate);
        msg.source_id = core_ack.dest_id;
        msg.set_name("fed0");
        bench.broker.mailbox().push_priority(msg);
        let ack = expect(&bench.core_rx, Action::FederateAck);
        assert!(ack.is_error());
    }

    #[test_log::test]
    fn deferred_subscription_binds_when_publication_appears() {
        let bench = bench(2);
        let core_ack = expect(&bench.core_rx, Action::CoreAck);
        let core_id = core_ack.dest_id;
        let sub_fed = register_fed(&bench, core_id, "subscriber");
        let pub_fed = register_fed(&bench, core_id, "publisher");

        // The input arrives before its matching publication.
        let mut input = ActionMessage::new(Action::RegisterInput);
        input.source_id = sub_fed;
        input.source_handle = InterfaceHandle::new(1);
        input.set_name("values");
        bench.broker.mailbox().push_priority(input);

        let mut publication = ActionMessage::new(Action::RegisterPublication);
        publication.source_id = pub_fed;
        publication.source_handle = InterfaceHandle::new(1);
        publication.set_name("values");
        publication.extra_mut().source_name = "double".to_owned();
        bench.broker.mailbox().push_priority(publication);

        let add_publisher = expect(&bench.core_rx, Action::AddPublisher);
        assert_eq!(add_publisher.dest_id, sub_fed);
        assert_eq!(add_publisher.source_id, pub_fed);
        assert_eq!(add_publisher.extra.as_ref().unwrap().source_name, "double");

        let add_subscriber = expect(&bench.core_rx, Action::AddSubscriber);
        assert_eq!(add_subscriber.dest_id, pub_fed);
        assert_eq!(add_subscriber.source_id, sub_fed);

        let add_dependency = expect(&bench.core_rx, Action::AddDependency);
        assert_eq!(add_dependency.dest_id, sub_fed);
        assert_eq!(add_dependency.source_id, pub_fed);

        let add_dependent = expect(&bench.core_rx, Action::AddDependent);
        assert_eq!(add_dependent.dest_id, pub_fed);
        assert_eq!(add_dependent.source_id, sub_fed);
    }

    #[test_log::test]
    fn init_barrier_waits_for_every_federate() {
        let bench = bench(2);
        let core_ack = expect(&bench.core_rx, Action::CoreAck);
        let core_id = core_ack.dest_id;
        let fed_a = register_fed(&bench, core_id, "a");
        let fed_b = register_fed(&bench, core_id, "b");

        let mut req = ActionMessage::new(Action::InitRequest);
        req.source_id = fed_a;
        bench.broker.mailbox().push_priority(req);

        // Only one of two federates has asked: no grant yet.
        assert!(bench
            .core_rx
            .pop_timeout(Duration::from_millis(100))
            .is_none());

        let mut req = ActionMessage::new(Action::InitRequest);
        req.source_id = fed_b;
        bench.broker.mailbox().push_priority(req);

        let grant_one = expect(&bench.core_rx, Action::InitGrant);
        let grant_two = expect(&bench.core_rx, Action::InitGrant);
        let mut granted = vec![grant_one.dest_id, grant_two.dest_id];
        granted.sort();
        let mut expected = vec![fed_a, fed_b];
        expected.sort();
        assert_eq!(granted, expected);
    }

    #[test_log::test]
    fn required_subscription_without_publication_errors_at_init() {
        let bench = bench(1);
        let core_ack = expect(&bench.core_rx, Action::CoreAck);
        let fed = register_fed(&bench, core_ack.dest_id, "lonely");

        let mut input = ActionMessage::new(Action::RegisterInput);
        input.source_id = fed;
        input.source_handle = InterfaceHandle::new(1);
        input.flags.set(Flags::REQUIRED);
        input.set_name("missing");
        bench.broker.mailbox().push_priority(input);

        let mut req = ActionMessage::new(Action::InitRequest);
        req.source_id = fed;
        bench.broker.mailbox().push_priority(req);

        let err = expect(&bench.core_rx, Action::Error);
        assert_eq!(err.dest_id, fed);
        assert!(err.name().contains("missing"));
    }
}
