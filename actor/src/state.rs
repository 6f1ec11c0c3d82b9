// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor lifecycle state
//!
//! The state is a small set of bit flags updated with compare-and-swap. It only moves forward:
//! not started, running, stopping or terminating, stopped or terminated.
//!

use serde::{Deserialize, Serialize};

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

const ACTIVE: u8 = 1;
const FINISHING: u8 = 2;
const FINISHED: u8 = 4;
const STOP: u8 = 8;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = ACTIVE;
const STOPPING: u8 = ACTIVE | FINISHING | STOP;
const TERMINATING: u8 = ACTIVE | FINISHING;
const STOPPED: u8 = FINISHED | STOP;
const TERMINATED: u8 = FINISHED;

/// Lifecycle state of an actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorState {
    /// Created, `start()` not called yet.
    NotStarted,
    /// Processing messages.
    Running,
    /// `stop()` was called; queued messages are still processed.
    Stopping,
    /// `terminate()` was called; the actor finishes at the next opportunity.
    Terminating,
    /// Finished after a stop.
    Stopped,
    /// Finished after a termination or a failure.
    Terminated,
}

impl ActorState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            RUNNING => ActorState::Running,
            STOPPING => ActorState::Stopping,
            TERMINATING => ActorState::Terminating,
            STOPPED => ActorState::Stopped,
            TERMINATED => ActorState::Terminated,
            _ => ActorState::NotStarted,
        }
    }

    /// True once the actor reached `Stopped` or `Terminated`.
    pub fn is_finished(&self) -> bool {
        matches!(self, ActorState::Stopped | ActorState::Terminated)
    }

    /// True while the actor is started and not finished.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ActorState::Running | ActorState::Stopping | ActorState::Terminating
        )
    }
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorState::NotStarted => "not started",
            ActorState::Running => "running",
            ActorState::Stopping => "stopping",
            ActorState::Terminating => "terminating",
            ActorState::Stopped => "stopped",
            ActorState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// How an actor ends when it finishes on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ending {
    Stop,
    Terminate,
}

/// Atomic holder of the lifecycle flags.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(NOT_STARTED))
    }

    pub fn get(&self) -> ActorState {
        ActorState::from_bits(self.0.load(Ordering::Acquire))
    }

    fn swap_from(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Not started to running. Fails on any other state.
    pub fn start(&self) -> bool {
        self.swap_from(NOT_STARTED, RUNNING)
    }

    /// Running to stopping. Any other state is left alone.
    pub fn stop(&self) -> bool {
        self.swap_from(RUNNING, STOPPING)
    }

    /// Moves any unfinished state, stopping included, to terminating. Returns the state it left,
    /// or `None` when the actor was already terminating or finished.
    pub fn terminate(&self) -> Option<ActorState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & FINISHED != 0 || current == TERMINATING {
                return None;
            }
            match self.0.compare_exchange(
                current,
                TERMINATING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ActorState::from_bits(current)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves to the matching finished state. A finishing state already chosen by `stop()` or
    /// `terminate()` wins over `ending`. Returns the final state.
    pub fn finish(&self, ending: Ending) -> ActorState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & FINISHED != 0 {
                return ActorState::from_bits(current);
            }
            let target = if current & FINISHING != 0 {
                FINISHED | (current & STOP)
            } else {
                match ending {
                    Ending::Stop => STOPPED,
                    Ending::Terminate => TERMINATED,
                }
            };
            match self.0.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ActorState::from_bits(target),
                Err(actual) => current = actual,
            }
        }
    }
}
