//! Reload debouncer.
//!
//! Tracks services that are mid-transition and decides when a
//! reconfiguration is both safe (nothing in flight) and necessary (at least
//! one tracked transition has settled).  The pending timer is a deadline
//! owned by this struct; the controller sleeps until it and calls
//! [`DebounceState::take_due`].  Clearing the deadline is the cancellation,
//! so a cancelled timer can never fire.

use std::collections::VecDeque;
use std::time::Duration;

use log::info;
use tokio::time::Instant;

use crate::types::{LifecycleState, Phase};

#[derive(Debug)]
pub struct DebounceState {
    /// Service ids in transition, oldest first.  Settle events pop from the
    /// front without matching the id.
    changing: VecDeque<String>,
    /// A tracked transition settled since the last arm.
    changed: bool,
    deadline: Option<Instant>,
    quiet: Duration,
}

/// Outcome of feeding one service event to the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// Transition recorded; any pending reconfiguration was cancelled.
    Transition,
    /// A tracked transition settled but others are still in flight.
    Settled,
    /// Everything settled; a reconfiguration is armed for after the quiet period.
    Armed,
    /// No effect.
    Ignored,
}

impl DebounceState {
    pub fn new(quiet: Duration) -> Self {
        Self {
            changing: VecDeque::new(),
            changed: false,
            deadline: None,
            quiet,
        }
    }

    pub fn observe(&mut self, uuid: &str, state: LifecycleState, now: Instant) -> Observed {
        let observed = match state.phase() {
            Phase::Transitional => {
                info!("Service: {} is {}...", uuid, state);
                self.deadline = None;
                self.changing.push_back(uuid.to_string());
                Observed::Transition
            }
            Phase::Settled if !self.changing.is_empty() => {
                info!("Service: {} is {}!", uuid, state);
                self.changing.pop_front();
                self.deadline = None;
                self.changed = true;
                Observed::Settled
            }
            _ => Observed::Ignored,
        };

        if self.changed && self.changing.is_empty() {
            info!("Services changed - scheduling reconfiguration");
            self.changed = false;
            self.deadline = Some(now + self.quiet);
            return Observed::Armed;
        }
        observed
    }

    /// Called when the event stream (re)connects.  Returns true when events
    /// may have been missed mid-transition; the state is then reset and the
    /// caller must reconfigure immediately.
    pub fn on_connect(&mut self) -> bool {
        if self.changing.is_empty() {
            return false;
        }
        self.reset();
        true
    }

    pub fn reset(&mut self) {
        self.changing.clear();
        self.changed = false;
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the deadline if it has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn in_transition(&self) -> usize {
        self.changing.len()
    }
}
