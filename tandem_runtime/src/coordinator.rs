//! The per-federate time coordinator.
//!
//! Each coordinator owns only its own state and holds peers by id; the
//! dependency graph may contain cycles, which are broken by the `min_fed`
//! marker carried on every report: a dependency's `tdemin` is disregarded
//! when its constraint is just this federate's own report echoed back
//! through the loop.

use tandem_core::{GlobalFederateId, InterfaceHandle, IterationRequest, IterationResult, IterationTime, Time};

use crate::{Action, ActionMessage, Flags};

/// Time behavior knobs settable per federate.
#[derive(Debug, Clone)]
pub struct TimeProperties {
    /// Grants are aligned to multiples of the period (plus offset) when set.
    pub period: Time,
    pub offset: Time,
    /// Minimum spacing between successive non-iterating grants.
    pub time_delta: Time,
    /// Delay applied to arriving data.
    pub input_delay: Time,
    /// Delay applied to emitted data.
    pub output_delay: Time,
    /// Cap on same-time iterations before the coordinator forces an advance.
    pub max_iterations: i32,
}

impl Default for TimeProperties {
    fn default() -> Self {
        Self {
            period: Time::ZERO,
            offset: Time::ZERO,
            time_delta: Time::EPSILON,
            input_delay: Time::ZERO,
            output_delay: Time::ZERO,
            max_iterations: 50,
        }
    }
}

impl TimeProperties {
    /// The spacing used when propagating `tdemin` past a grant.
    fn effective_period(&self) -> Time {
        self.period.max(self.time_delta)
    }
}

/// The most recent report from one dependency.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub id: GlobalFederateId,
    /// Earliest time the dependency could next emit something we must see.
    pub next: Time,
    /// Earliest time the dependency itself could need input.
    pub te: Time,
    /// Earliest event time propagated recursively from its dependencies.
    pub tdemin: Time,
    /// The federate whose event constrained `tdemin`.
    pub min_fed: GlobalFederateId,
    /// The dependency reported unconverged iteration.
    pub iterating: bool,
}

impl DependencyInfo {
    fn new(id: GlobalFederateId) -> Self {
        // Until the first report arrives, assume the dependency could send
        // at the start of time.
        Self {
            id,
            next: Time::ZERO,
            te: Time::ZERO,
            tdemin: Time::ZERO,
            min_fed: GlobalFederateId::INVALID,
            iterating: false,
        }
    }
}

/// The error type for coordinator time processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("grant of {grant} would regress behind granted time {granted}")]
    CausalityViolation { grant: Time, granted: Time },

    #[error("data stamped {time} arrived behind granted time {granted}")]
    LateArrival { time: Time, granted: Time },
}

/// Computes safe grant times for one federate from dependency reports.
#[derive(Debug, Default)]
pub struct TimeCoordinator {
    id: GlobalFederateId,
    pub props: TimeProperties,

    granted: Time,
    requested: Time,
    /// A request is outstanding.
    active: bool,
    iterate: IterationRequest,
    /// Sub-time-step iteration counter at the granted time.
    iteration: i32,
    /// Earliest locally queued event (input value or endpoint message).
    event_time: Time,
    /// Local data arrived at exactly the granted time since the last grant.
    pending_at_granted: bool,

    // Last advertised report, to suppress no-op resends.
    sent_next: Time,
    sent_te: Time,
    sent_tdemin: Time,
    sent_min_fed: GlobalFederateId,
    sent_iterating: bool,

    dependencies: Vec<DependencyInfo>,
    dependents: Vec<GlobalFederateId>,
}

impl TimeCoordinator {
    pub fn new(id: GlobalFederateId) -> Self {
        Self {
            id,
            event_time: Time::MAX,
            sent_next: Time::MIN,
            sent_te: Time::MIN,
            sent_tdemin: Time::MIN,
            ..Default::default()
        }
    }

    pub fn set_id(&mut self, id: GlobalFederateId) {
        self.id = id;
    }

    pub fn granted_time(&self) -> Time {
        self.granted
    }

    pub fn requested_time(&self) -> Time {
        self.requested
    }

    pub fn iteration(&self) -> i32 {
        self.iteration
    }

    pub fn has_active_request(&self) -> bool {
        self.active
    }

    /// Ids of the current dependencies, ascending.
    pub fn dependencies(&self) -> Vec<GlobalFederateId> {
        self.dependencies.iter().map(|d| d.id).collect()
    }

    pub fn dependents(&self) -> &[GlobalFederateId] {
        &self.dependents
    }

    pub fn dependency(&self, id: GlobalFederateId) -> Option<&DependencyInfo> {
        self.dependencies
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|i| &self.dependencies[i])
    }

    /// Add a dependency; repeated adds are ignored.
    pub fn add_dependency(&mut self, id: GlobalFederateId) -> bool {
        match self.dependencies.binary_search_by_key(&id, |d| d.id) {
            Ok(_) => false,
            Err(at) => {
                self.dependencies.insert(at, DependencyInfo::new(id));
                true
            }
        }
    }

    pub fn remove_dependency(&mut self, id: GlobalFederateId) {
        if let Ok(at) = self.dependencies.binary_search_by_key(&id, |d| d.id) {
            self.dependencies.remove(at);
        }
    }

    /// Add a dependent; repeated adds are ignored.
    pub fn add_dependent(&mut self, id: GlobalFederateId) -> bool {
        match self.dependents.binary_search(&id) {
            Ok(_) => false,
            Err(at) => {
                self.dependents.insert(at, id);
                true
            }
        }
    }

    pub fn remove_dependent(&mut self, id: GlobalFederateId) {
        if let Ok(at) = self.dependents.binary_search(&id) {
            self.dependents.remove(at);
        }
    }

    /// Apply a dependency-graph maintenance envelope.
    pub fn process_dependency_update(&mut self, msg: &ActionMessage) {
        match msg.action {
            Action::AddDependency => {
                self.add_dependency(msg.source_id);
            }
            Action::RemoveDependency => self.remove_dependency(msg.source_id),
            Action::AddDependent => {
                self.add_dependent(msg.source_id);
            }
            Action::RemoveDependent => self.remove_dependent(msg.source_id),
            _ => {}
        }
    }

    /// A disconnected dependency will never send again.
    pub fn mark_disconnected(&mut self, id: GlobalFederateId) {
        if let Ok(at) = self.dependencies.binary_search_by_key(&id, |d| d.id) {
            let dep = &mut self.dependencies[at];
            dep.next = Time::MAX;
            dep.te = Time::MAX;
            dep.tdemin = Time::MAX;
            dep.iterating = false;
        }
    }

    /// Record the earliest locally queued event time, and whether data has
    /// landed at exactly the granted time since the last grant.
    pub fn set_event_time(&mut self, event_time: Time, pending_at_granted: bool) {
        self.event_time = event_time;
        self.pending_at_granted = pending_at_granted;
    }

    /// Transition into execution: time starts granted at zero.
    pub fn enter_executing(&mut self) {
        self.granted = Time::ZERO;
        self.requested = Time::ZERO;
        self.active = false;
        self.iteration = 0;
    }

    /// Post a time request. The grant is produced later by
    /// [`check_grant`](Self::check_grant) once dependency reports allow it.
    pub fn request(&mut self, time: Time, iterate: IterationRequest) {
        self.requested = if iterate == IterationRequest::NoIterations {
            time.max(self.granted + self.props.time_delta)
        } else {
            time.max(self.granted)
        };
        self.iterate = iterate;
        self.active = true;
    }

    /// Update this dependency's slot from a report envelope. Returns true if
    /// anything changed.
    pub fn process_time_message(&mut self, msg: &ActionMessage) -> bool {
        if !matches!(msg.action, Action::TimeReport | Action::TimeRequest) {
            return false;
        }
        let Ok(at) = self
            .dependencies
            .binary_search_by_key(&msg.source_id, |d| d.id)
        else {
            return false;
        };
        let dep = &mut self.dependencies[at];
        let (te, tdemin) = msg
            .extra
            .as_ref()
            .map(|e| (e.te, e.tdemin))
            .unwrap_or((msg.action_time, msg.action_time));
        // Time reports reuse source_handle to carry the constraining id.
        let min_fed = GlobalFederateId::new(msg.source_handle.base_value());
        let iterating = msg.flags.contains(Flags::ITERATING);
        let changed = dep.next != msg.action_time
            || dep.te != te
            || dep.tdemin != tdemin
            || dep.min_fed != min_fed
            || dep.iterating != iterating;
        dep.next = msg.action_time;
        dep.te = te;
        dep.tdemin = tdemin;
        dep.min_fed = min_fed;
        dep.iterating = iterating;
        changed
    }

    /// A data envelope stamped before the granted time is a causality
    /// violation.
    pub fn check_message_time(&self, time: Time) -> Result<(), TimeError> {
        if time < self.granted {
            return Err(TimeError::LateArrival {
                time,
                granted: self.granted,
            });
        }
        Ok(())
    }

    /// `tdemin` of a dependency with the echo through this federate removed.
    fn effective_tdemin(&self, dep: &DependencyInfo) -> Time {
        if dep.min_fed == self.id {
            // The constraint is our own report coming back around the loop;
            // fall back to the dependency's own event time.
            dep.te.max(dep.next)
        } else {
            dep.tdemin
        }
    }

    /// The earliest time an external event could still arrive.
    fn upstream_time(&self) -> Time {
        let mut t_allow = Time::MAX;
        for dep in &self.dependencies {
            let bound = dep.next.max(self.effective_tdemin(dep));
            t_allow = t_allow.min(bound + self.props.input_delay);
        }
        t_allow
    }

    /// Recompute the advertised `(next, te, tdemin, min_fed)`. Returns true
    /// when the report changed and should be resent to dependents.
    pub fn update_time_factors(&mut self) -> bool {
        let mut upstream_tdemin = Time::MAX;
        let mut upstream_min_fed = GlobalFederateId::INVALID;
        for dep in &self.dependencies {
            let eff = self.effective_tdemin(dep);
            if eff < upstream_tdemin
                || (eff == upstream_tdemin && dep.id < upstream_min_fed)
            {
                upstream_tdemin = eff;
                upstream_min_fed = dep.id;
            }
        }
        let t_allow = self.upstream_time();

        let (next, te, tdemin, min_fed) = if self.active {
            // Earliest we could act: our requested time, a queued local
            // event, or an upstream wake.
            let te = self.requested.min(self.event_time);
            let floor = if self.iterate == IterationRequest::NoIterations {
                self.granted + self.props.time_delta
            } else {
                self.granted
            };
            let next = floor.max(te.min(t_allow)).min(te);
            let tdemin = te.min(upstream_tdemin);
            let min_fed = if te <= upstream_tdemin {
                if upstream_tdemin == te && upstream_min_fed.is_valid() {
                    self.id.min(upstream_min_fed)
                } else {
                    self.id
                }
            } else {
                upstream_min_fed
            };
            (next, te, tdemin, min_fed)
        } else {
            // Executing at the granted time; we may still emit here.
            let tdemin = (self.granted + self.props.effective_period()).min(upstream_tdemin);
            let min_fed = if self.granted + self.props.effective_period() <= upstream_tdemin {
                self.id
            } else {
                upstream_min_fed
            };
            (self.granted, self.granted, tdemin, min_fed)
        };

        let next = next + self.props.output_delay;
        let te = te + self.props.output_delay;
        let iterating = self.active && self.iterate != IterationRequest::NoIterations;

        let changed = next != self.sent_next
            || te != self.sent_te
            || tdemin != self.sent_tdemin
            || min_fed != self.sent_min_fed
            || iterating != self.sent_iterating;
        self.sent_next = next;
        self.sent_te = te;
        self.sent_tdemin = tdemin;
        self.sent_min_fed = min_fed;
        self.sent_iterating = iterating;
        changed
    }

    /// Build the report envelope carrying the advertised times, addressed to
    /// `dependent`.
    pub fn make_report(&self, dependent: GlobalFederateId) -> ActionMessage {
        let mut msg = ActionMessage::new(Action::TimeReport);
        msg.source_id = self.id;
        msg.source_handle = InterfaceHandle::new(self.sent_min_fed.base_value());
        msg.dest_id = dependent;
        msg.action_time = self.sent_next;
        msg.iteration = self.iteration;
        if self.sent_iterating {
            msg.flags.set(Flags::ITERATING);
        }
        let extra = msg.extra_mut();
        extra.te = self.sent_te;
        extra.tdemin = self.sent_tdemin;
        msg
    }

    /// Evaluate whether the outstanding request can be granted.
    ///
    /// Returns `Ok(None)` while the coordinator must keep waiting for
    /// dependency reports.
    pub fn check_grant(&mut self) -> Result<Option<IterationTime>, TimeError> {
        if !self.active {
            return Ok(None);
        }
        let t_upstream = self.upstream_time();
        let t_grant = self.requested.min(t_upstream);
        if t_grant < self.granted {
            return Err(TimeError::CausalityViolation {
                grant: t_grant,
                granted: self.granted,
            });
        }

        let iterating_dependency = self
            .dependencies
            .iter()
            .any(|d| d.iterating && d.next <= t_grant);

        if t_grant == self.granted && self.granted < self.requested {
            // Same-time re-entry territory.
            match self.iterate {
                IterationRequest::NoIterations => return Ok(None),
                IterationRequest::ForceIteration => {
                    return Ok(Some(self.grant_iteration()));
                }
                IterationRequest::IterateIfNeeded => {
                    if self.iteration >= self.props.max_iterations {
                        return Ok(None);
                    }
                    if self.pending_at_granted || iterating_dependency {
                        return Ok(Some(self.grant_iteration()));
                    }
                    return Ok(None);
                }
            }
        }

        if self.requested <= t_upstream {
            // Fully released up to the requested time.
            if self.iterate == IterationRequest::ForceIteration {
                return Ok(Some(self.grant_iteration()));
            }
            if (self.pending_at_granted || iterating_dependency)
                && self.iterate == IterationRequest::IterateIfNeeded
                && self.iteration < self.props.max_iterations
            {
                return Ok(Some(self.grant_iteration()));
            }
            return Ok(Some(self.grant_time(self.requested)));
        }

        // An already-queued local event may wake us before the requested
        // time once upstream has released its timestamp.
        if self.event_time > self.granted && self.event_time <= t_upstream {
            return Ok(Some(self.grant_time(self.event_time)));
        }

        Ok(None)
    }

    fn grant_time(&mut self, time: Time) -> IterationTime {
        self.granted = time;
        self.active = false;
        self.iteration = 0;
        self.pending_at_granted = false;
        IterationTime::new(time, IterationResult::NextStep)
    }

    fn grant_iteration(&mut self) -> IterationTime {
        self.iteration += 1;
        self.active = false;
        self.pending_at_granted = false;
        IterationTime::new(self.granted, IterationResult::Iterating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FED1: GlobalFederateId = GlobalFederateId::new(131_072);
    const FED2: GlobalFederateId = GlobalFederateId::new(131_073);
    const FED3: GlobalFederateId = GlobalFederateId::new(131_074);

    fn seconds(s: f64) -> Time {
        Time::from_seconds(s)
    }

    #[test]
    fn dependency_bookkeeping() {
        let mut ftc = TimeCoordinator::new(FED1);
        assert!(ftc.add_dependency(FED2));
        assert!(ftc.add_dependency(FED3));
        assert_eq!(ftc.dependencies(), vec![FED2, FED3]);

        // Repeated inputs are dealt with correctly.
        assert!(!ftc.add_dependency(FED3));
        assert_eq!(ftc.dependencies(), vec![FED2, FED3]);

        ftc.remove_dependency(FED2);
        assert_eq!(ftc.dependencies(), vec![FED3]);
        // Removing twice is a no-op.
        ftc.remove_dependency(FED2);
        assert_eq!(ftc.dependencies(), vec![FED3]);
    }

    #[test]
    fn dependency_bookkeeping_by_message() {
        let mut ftc = TimeCoordinator::new(FED1);
        let mut add = ActionMessage::new(Action::AddDependency);
        add.source_id = FED2;
        ftc.process_dependency_update(&add);
        add.source_id = FED3;
        ftc.process_dependency_update(&add);
        ftc.process_dependency_update(&add);
        assert_eq!(ftc.dependencies(), vec![FED2, FED3]);

        let mut rem = ActionMessage::new(Action::RemoveDependency);
        rem.source_id = FED2;
        ftc.process_dependency_update(&rem);
        assert_eq!(ftc.dependencies(), vec![FED3]);

        // Removing an unknown id is a no-op.
        rem.source_id = GlobalFederateId::new(10);
        ftc.process_dependency_update(&rem);
        assert_eq!(ftc.dependencies(), vec![FED3]);
    }

    #[test]
    fn dependent_bookkeeping() {
        let mut ftc = TimeCoordinator::new(FED1);
        assert!(ftc.add_dependent(FED2));
        assert!(ftc.add_dependent(FED3));
        assert!(!ftc.add_dependent(FED3));
        assert_eq!(ftc.dependents(), &[FED2, FED3]);

        ftc.remove_dependent(FED2);
        ftc.remove_dependent(FED2);
        assert_eq!(ftc.dependents(), &[FED3]);
    }

    #[test]
    fn free_running_grant() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.enter_executing();
        ftc.request(seconds(1.0), IterationRequest::NoIterations);
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, seconds(1.0));
        assert_eq!(grant.state, IterationResult::NextStep);
        assert_eq!(ftc.granted_time(), seconds(1.0));
    }

    fn report_from(
        id: GlobalFederateId,
        next: Time,
        te: Time,
        tdemin: Time,
        min_fed: GlobalFederateId,
    ) -> ActionMessage {
        let mut msg = ActionMessage::new(Action::TimeReport);
        msg.source_id = id;
        msg.source_handle = InterfaceHandle::new(min_fed.base_value());
        msg.action_time = next;
        let extra = msg.extra_mut();
        extra.te = te;
        extra.tdemin = tdemin;
        msg
    }

    #[test]
    fn blocked_until_dependency_advances() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.add_dependency(FED2);
        ftc.enter_executing();
        ftc.request(seconds(1.0), IterationRequest::NoIterations);
        assert_eq!(ftc.check_grant().unwrap(), None);

        // The dependency reports it cannot send anything before t=2.
        let report = report_from(FED2, seconds(2.0), seconds(2.0), seconds(2.0), FED2);
        assert!(ftc.process_time_message(&report));
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, seconds(1.0));
        assert_eq!(grant.state, IterationResult::NextStep);
    }

    #[test]
    fn event_wakes_before_requested_time() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.add_dependency(FED2);
        ftc.enter_executing();
        ftc.request(seconds(10.0), IterationRequest::NoIterations);

        // Data queued locally at t=3; upstream has released through t=5.
        ftc.set_event_time(seconds(3.0), false);
        let report = report_from(FED2, seconds(5.0), seconds(5.0), seconds(5.0), FED2);
        ftc.process_time_message(&report);

        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, seconds(3.0));
    }

    #[test]
    fn mutual_dependency_cycle_converges() {
        let mut a = TimeCoordinator::new(FED1);
        let mut b = TimeCoordinator::new(FED2);
        a.add_dependency(FED2);
        a.add_dependent(FED2);
        b.add_dependency(FED1);
        b.add_dependent(FED1);
        a.enter_executing();
        b.enter_executing();

        // Initial post-exec reports.
        a.update_time_factors();
        b.update_time_factors();
        b.process_time_message(&a.make_report(FED2));
        a.process_time_message(&b.make_report(FED1));

        // Both request t=1.
        a.request(seconds(1.0), IterationRequest::NoIterations);
        a.update_time_factors();
        b.process_time_message(&a.make_report(FED2));

        b.request(seconds(1.0), IterationRequest::NoIterations);
        b.update_time_factors();
        a.process_time_message(&b.make_report(FED1));

        // The naive min over tdemin would deadlock here; the echo rule lets
        // both sides grant.
        let grant_b = b.check_grant().unwrap().expect("b grants");
        assert_eq!(grant_b.granted_time, seconds(1.0));

        b.update_time_factors();
        a.process_time_message(&b.make_report(FED1));
        let grant_a = a.check_grant().unwrap().expect("a grants");
        assert_eq!(grant_a.granted_time, seconds(1.0));
    }

    #[test]
    fn iterate_if_needed_with_pending_data() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.add_dependency(FED2);
        ftc.enter_executing();

        // New data landed at exactly the granted time.
        ftc.set_event_time(Time::ZERO, true);
        ftc.request(seconds(1.0), IterationRequest::IterateIfNeeded);
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, Time::ZERO);
        assert_eq!(grant.state, IterationResult::Iterating);
        assert_eq!(ftc.iteration(), 1);

        // No new data and the dependency has moved on: advance.
        ftc.set_event_time(Time::MAX, false);
        ftc.request(seconds(1.0), IterationRequest::IterateIfNeeded);
        let report = report_from(FED2, seconds(2.0), seconds(2.0), seconds(2.0), FED2);
        ftc.process_time_message(&report);
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, seconds(1.0));
        assert_eq!(grant.state, IterationResult::NextStep);
        assert_eq!(ftc.iteration(), 0);
    }

    #[test]
    fn force_iteration_reenters_same_time() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.enter_executing();
        ftc.request(seconds(1.0), IterationRequest::ForceIteration);
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.granted_time, Time::ZERO);
        assert_eq!(grant.state, IterationResult::Iterating);
    }

    #[test]
    fn iteration_capped_at_max() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.props.max_iterations = 3;
        ftc.enter_executing();
        for _ in 0..3 {
            ftc.set_event_time(Time::ZERO, true);
            ftc.request(seconds(1.0), IterationRequest::IterateIfNeeded);
            let grant = ftc.check_grant().unwrap().unwrap();
            assert_eq!(grant.state, IterationResult::Iterating);
        }
        // The cap stops further same-time grants even with pending data.
        ftc.set_event_time(Time::ZERO, true);
        ftc.request(seconds(1.0), IterationRequest::IterateIfNeeded);
        let grant = ftc.check_grant().unwrap().unwrap();
        assert_eq!(grant.state, IterationResult::NextStep);
        assert_eq!(grant.granted_time, seconds(1.0));
    }

    #[test]
    fn late_arrival_is_a_causality_error() {
        let mut ftc = TimeCoordinator::new(FED1);
        ftc.enter_executing();
        ftc.request(seconds(5.0), IterationRequest::NoIterations);
        let _ = ftc.check_grant().unwrap().unwrap();
        assert_eq!(
            ftc.check_message_time(seconds(4.0)),
            Err(TimeError::LateArrival {
                time: seconds(4.0),
                granted: seconds(5.0),
            })
        );
        assert!(ftc.check_message_time(seconds(5.0)).is_ok());
    }
}
