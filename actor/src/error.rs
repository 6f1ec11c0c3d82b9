// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::{any::Any, time::Duration};

/// Error type for the actor runtime.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// `start()` was called on an actor that is not in the not-started state.
    #[error("Actor {0} has already been started.")]
    AlreadyStarted(String),
    /// An ordinary message was sent to an actor that has finished.
    #[error("Actor {0} has finished and accepts no more messages.")]
    Finished(String),
    /// An actor-only operation was called from a foreign thread.
    #[error("Actor {0} can only be driven from its own thread.")]
    NotActorThread(String),
    /// A blocking receive was cut short because the actor is being terminated.
    #[error("Actor {0} was interrupted.")]
    Interrupted(String),
    /// A blocking receive was cut short because the actor reached its stop sentinel.
    #[error("Actor {0} is stopping.")]
    Stopping(String),
    /// A timed wait gave up.
    #[error("No answer within {0:?}.")]
    Timeout(Duration),
    /// `reply()` was called while processing a message without a sender.
    #[error("The current message has no sender to reply to.")]
    NoSender,
    /// Every reply failure collected by a single `reply()` call.
    #[error("Replies failed: {0:?}")]
    Reply(Vec<Error>),
    /// The pool or timer no longer accepts work.
    #[error("The actor group has been shut down.")]
    PoolShutdown,
    /// The runtime backing a pool could not be built.
    #[error("Can't build the runtime: {0}")]
    Runtime(String),
    /// A configuration call was rejected.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    /// A dataflow primitive used by the actor failed.
    #[error("Dataflow error: {0}")]
    Dataflow(#[from] dataflow::Error),
    /// User code panicked.
    #[error("Actor code panicked: {0}")]
    Panicked(String),
    /// Error that does not compromise the operation of the system.
    #[error("Error: {0}")]
    Functional(String),
}

impl Error {
    /// Builds a [`Error::Panicked`] from a payload caught by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Error::Panicked(message)
    }
}
