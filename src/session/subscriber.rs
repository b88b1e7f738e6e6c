//! Per-viewer delivery queue
//!
//! Each subscriber owns a bounded FIFO. The pump appends to it without ever
//! waiting; when it is full the oldest unit is discarded, so a slow viewer
//! only ever hurts itself.
//!
//! A subscriber with a hole in its stream (joined before any key unit, or lost
//! units to overflow) is gated on the consumer side: parameter sets pass,
//! slices are skipped until the next key unit, and the cached SPS/PPS are
//! emitted in front of that key unit if the viewer has not seen them since.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::broadcast::SessionInner;
use crate::media::{CodedUnit, ParameterSlot, UnitKind};

#[derive(Debug)]
struct QueueState {
    units: VecDeque<CodedUnit>,
    closed: bool,
    /// Units were discarded in front of the current head
    gap: bool,
    dropped: u64,
}

/// Bounded drop-oldest FIFO shared by the pump and one [`Subscription`]
#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                units: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                gap: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a unit, discarding the oldest one if full
    ///
    /// Returns `true` if a unit was discarded.
    pub(crate) fn push(&self, unit: CodedUnit) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        let mut dropped = false;
        if state.units.len() >= self.capacity {
            state.units.pop_front();
            state.dropped += 1;
            state.gap = true;
            dropped = true;
        }
        state.units.push_back(unit);
        drop(state);

        self.notify.notify_one();
        dropped
    }

    /// Mark the end of the stream; queued units remain readable
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<(CodedUnit, bool)> {
        let mut state = self.lock();
        let unit = state.units.pop_front()?;
        let gap = std::mem::take(&mut state.gap);
        Some((unit, gap))
    }

    /// Next unit and whether units were lost just before it
    ///
    /// Returns `None` once the queue is closed and empty.
    async fn pop(&self) -> Option<(CodedUnit, bool)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(unit) = state.units.pop_front() {
                    let gap = std::mem::take(&mut state.gap);
                    return Some((unit, gap));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().units.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[derive(Debug, Default)]
struct Gate {
    active: bool,
    sps_sent: bool,
    pps_sent: bool,
}

impl Gate {
    fn engage(&mut self) {
        *self = Gate {
            active: true,
            ..Default::default()
        };
    }
}

/// Receiving end of one viewer's unit stream
///
/// Yields the late-join snapshot first, then live units. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    session: Arc<SessionInner>,
    gate: Gate,
    /// Units released by the gate, delivered before the queue
    pending: VecDeque<CodedUnit>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        queue: Arc<SubscriberQueue>,
        session: Arc<SessionInner>,
        gated: bool,
    ) -> Self {
        let mut gate = Gate::default();
        if gated {
            gate.engage();
        }
        Self {
            id,
            queue,
            session,
            gate,
            pending: VecDeque::new(),
        }
    }

    /// Subscriber id, unique within the session
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session this subscription belongs to
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Wait for the next unit
    ///
    /// Returns `None` after the session stopped and the queue drained.
    pub async fn recv(&mut self) -> Option<CodedUnit> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(unit);
            }
            let (unit, gap) = self.queue.pop().await?;
            if let Some(unit) = self.admit(unit, gap) {
                return Some(unit);
            }
        }
    }

    /// Next unit if one is already queued
    pub fn try_recv(&mut self) -> Option<CodedUnit> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(unit);
            }
            let (unit, gap) = self.queue.try_pop()?;
            if let Some(unit) = self.admit(unit, gap) {
                return Some(unit);
            }
        }
    }

    /// Units waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len() + self.pending.len()
    }

    /// Units this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Whether the session has ended this stream
    ///
    /// Queued units may still be readable.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Detach from the session
    pub fn unsubscribe(self) {}

    fn admit(&mut self, unit: CodedUnit, gap: bool) -> Option<CodedUnit> {
        if gap {
            tracing::debug!(
                session = %self.session.id(),
                subscriber = self.id,
                dropped = self.queue.dropped(),
                "Subscriber lost units, waiting for next key unit"
            );
            self.gate.engage();
        }

        if !self.gate.active {
            return Some(unit);
        }

        match unit.kind() {
            UnitKind::ParameterSet => {
                match unit.parameter_slot() {
                    Some(ParameterSlot::Sps) => self.gate.sps_sent = true,
                    Some(ParameterSlot::Pps) => self.gate.pps_sent = true,
                    None => {}
                }
                Some(unit)
            }
            UnitKind::KeyUnit => {
                if !(self.gate.sps_sent && self.gate.pps_sent) {
                    for param in self.session.parameter_sets() {
                        let missing = match param.parameter_slot() {
                            Some(ParameterSlot::Sps) => !self.gate.sps_sent,
                            Some(ParameterSlot::Pps) => !self.gate.pps_sent,
                            None => false,
                        };
                        if missing {
                            self.pending.push_back(param);
                        }
                    }
                }
                self.gate = Gate::default();
                self.pending.push_back(unit);
                self.pending.pop_front()
            }
            UnitKind::DeltaUnit | UnitKind::Other => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.remove_subscriber(self.id);
    }
}
