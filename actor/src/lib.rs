// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Braid actors
//!
//! Lightweight actors scheduled on a shared thread pool, with single-assignment dataflow values
//! as their reply channel.
//!
//! ## Overview
//!
//! An actor is a piece of private state plus a mailbox. Messages are processed one at a time, in
//! the order each sender sent them, and never by two threads at once. Actor code does not hold a
//! thread while waiting for its next message: it returns a [`Flow`] describing what to do next,
//! and the scheduler resumes it on whichever pool thread is free when a message arrives. This lets
//! a handful of threads drive a large number of mostly idle actors.
//!
//! ## Core Components
//!
//! ### Mailbox
//!
//! A lock-free multi-producer, single-consumer queue. Its pending counter decides when an idle
//! actor has to be scheduled and when a running one has to be resubmitted, which guarantees that
//! at most one task per actor is ever queued or running.
//!
//! ### Lifecycle
//!
//! ```text
//! NotStarted -> Running -> Stopping    -> Stopped
//!                       -> Terminating -> Terminated
//! ```
//!
//! [`ActorRef::stop`] lets every message queued before it be processed first.
//! [`ActorRef::terminate`] finishes the actor as soon as possible and interrupts a blocking
//! [`ActorContext::receive`]. Either way, [`ActorRef::join`] returns the final [`ActorState`] and
//! [`Actor::after_stop`] receives the messages that were never processed.
//!
//! ### Continuations
//!
//! * [`ActorContext::react`] and its variants wait for the next message.
//! * [`ActorContext::loop_forever`], [`ActorContext::loop_times`] and
//!   [`ActorContext::loop_while`] re-run a body after each completed reaction.
//! * [`ActorContext::receive`] blocks the current thread instead, for code that cannot be
//!   written as continuations.
//!
//! ### Replies
//!
//! Every message carries an optional reply address. [`ActorRef::send_and_wait`] waits on a
//! dataflow variable, [`ActorRef::send_and_continue`] runs a callback, and an [`ActorRef`] can be
//! used as the reply address of another actor's message.
//!
//! ## Getting Started
//!
//! ```ignore
//! use actor::{ActorGroup, GroupConfig};
//!
//! let group = ActorGroup::new(GroupConfig::default())?;
//! let doubler = group.reactor("doubler", |value: u64| value * 2)?;
//! assert_eq!(doubler.send_and_wait(21)?, 42);
//! doubler.stop()?;
//! doubler.join()?;
//! ```
//!

mod actor;
mod error;
mod group;
mod mailbox;
mod message;
mod pool;
mod runner;
mod state;

pub use actor::{Actor, ActorContext, ActorRef, Flow, Mail, Reaction, Step};
pub use error::Error;
pub use group::{
    ActorGroup, GroupConfig, POOL_SIZE_VAR, Reactor, configure_default_group, default_group,
};
pub use message::{Envelope, Message, ReplyTo, Replyable, Response};
pub use pool::{Pool, Scheduled, Task, Timer, TokioPool, TokioTimer};
pub use state::ActorState;
