//! Client sessions: authentication state, subscriptions and the ack-gated
//! outbound event queue.
//!
//! Sessions are owned by the request handler and mutated only on the
//! supervisor's execution context. The WebSocket pump pulls one frame at a
//! time; a new frame is released only after the previous one was
//! acknowledged with the literal text `"OK"`.

use crate::auth::LoginUser;
use crate::network::protocol::{EventFrame, SubOptions};
use crate::values::{AlarmOrEvent, HistoryChange, ObjectRef, Severity, VariableRef, VariableValue};
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Variable-value subscription: explicit refs and/or object-tree roots.
#[derive(Debug, Clone)]
pub struct VarSubscription {
    pub options: SubOptions,
    pub variables: HashSet<VariableRef>,
    pub roots: Vec<ObjectRef>,
}

/// Per-kind subscription set of one session.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    pub var_values: Option<VarSubscription>,
    pub var_history: bool,
    pub config: Option<HashSet<ObjectRef>>,
    pub alarms: Option<Severity>,
}

pub struct Session {
    pub id: String,
    /// Login presented at `Login`; identity is bound after `Authenticate`.
    pub login: String,
    pub challenge: i64,
    pub user: Option<LoginUser>,
    pub auth_attempts: u32,
    pub subscriptions: Subscriptions,

    outbound: VecDeque<EventFrame>,
    waiter: Option<oneshot::Sender<EventFrame>>,
    in_flight: bool,
    last_ack: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: String, login: String, challenge: i64) -> Session {
        let now = Instant::now();
        Session {
            id,
            login,
            challenge,
            user: None,
            auth_attempts: 0,
            subscriptions: Subscriptions::default(),
            outbound: VecDeque::new(),
            waiter: None,
            in_flight: false,
            last_ack: now,
            last_activity: now,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Abandoned iff client-bound traffic is pending and nothing has been
    /// acknowledged within the idle window.
    pub fn is_abandoned(&self, idle: Duration) -> bool {
        (self.in_flight || !self.outbound.is_empty()) && self.last_ack.elapsed() > idle
    }

    pub fn queued_frames(&self) -> usize {
        self.outbound.len()
    }

    /// Called by the WebSocket pump: hands out the next frame, or parks the
    /// reply until one arrives. A parked pump is replaced by a newer call.
    pub fn next_event(&mut self, reply: oneshot::Sender<EventFrame>) {
        match self.outbound.pop_front() {
            Some(frame) => {
                self.in_flight = true;
                let _ = reply.send(frame);
            }
            None => self.waiter = Some(reply),
        }
    }

    /// Client acknowledged the in-flight frame.
    pub fn ack(&mut self) {
        self.in_flight = false;
        self.last_ack = Instant::now();
        self.touch();
    }

    fn dispatch(&mut self, frame: EventFrame) {
        if let Some(waiter) = self.waiter.take() {
            match waiter.send(frame) {
                Ok(()) => {
                    self.in_flight = true;
                    return;
                }
                // Pump went away; queue the frame for its successor.
                Err(frame) => self.outbound.push_back(frame),
            }
            return;
        }
        self.outbound.push_back(frame);
    }

    /// Enqueues a value-change batch. With coalescing enabled, a
    /// queued-but-unsent frame absorbs the batch, keeping only the newest
    /// value per variable.
    pub fn enqueue_values(&mut self, values: Vec<VariableValue>) {
        if values.is_empty() {
            return;
        }
        let coalesce = self
            .subscriptions
            .var_values
            .as_ref()
            .map(|s| s.options.coalesce)
            .unwrap_or(true);

        if coalesce && self.waiter.is_none() {
            if let Some(EventFrame::OnVariableValueChanged { values: queued }) =
                self.outbound.back_mut()
            {
                for vv in values {
                    match queued.iter_mut().find(|q| q.variable == vv.variable) {
                        Some(existing) => *existing = vv,
                        None => queued.push(vv),
                    }
                }
                return;
            }
        }
        self.dispatch(EventFrame::OnVariableValueChanged { values });
    }

    pub fn enqueue_history(&mut self, changes: Vec<HistoryChange>) {
        if !changes.is_empty() {
            self.dispatch(EventFrame::OnVariableHistoryChanged { changes });
        }
    }

    pub fn enqueue_config(&mut self, objects: Vec<ObjectRef>) {
        if !objects.is_empty() {
            self.dispatch(EventFrame::OnConfigChanged { objects });
        }
    }

    pub fn enqueue_alarm(&mut self, event: AlarmOrEvent) {
        self.dispatch(EventFrame::OnAlarmOrEvent {
            events: vec![event],
        });
    }

    /// Whether this session's value subscription covers `variable`, given a
    /// parent-resolving closure for tree roots.
    pub fn matches_variable<F>(&self, variable: &VariableRef, parent_of: F) -> bool
    where
        F: Fn(&ObjectRef) -> Option<ObjectRef>,
    {
        let Some(sub) = &self.subscriptions.var_values else {
            return false;
        };
        if sub.variables.contains(variable) {
            return true;
        }
        if sub.roots.is_empty() {
            return false;
        }
        // Walk the object's parent chain; a subscription root anywhere on
        // the chain matches. Bounded in case a module declares a cyclic
        // parent relation.
        let mut current = Some(variable.object.clone());
        let mut hops = 0;
        while let Some(obj) = current {
            if sub.roots.contains(&obj) {
                return true;
            }
            hops += 1;
            if hops > 64 {
                return false;
            }
            current = parent_of(&obj);
        }
        false
    }

    pub fn matches_alarm(&self, event: &AlarmOrEvent) -> bool {
        match self.subscriptions.alarms {
            Some(min) => event.severity >= min,
            None => false,
        }
    }

    pub fn matches_config(&self, object: &ObjectRef) -> bool {
        match &self.subscriptions.config {
            Some(set) => set.is_empty() || set.contains(object),
            None => false,
        }
    }
}
