// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Facade of the braid runtime.
//! Re-exports the actor runtime and the dataflow primitives it is built on, so applications can
//! depend on a single crate.

pub use actor::{
    Actor, ActorContext, ActorGroup, ActorRef, ActorState, Envelope, Error as ActorError, Flow,
    GroupConfig, Mail, Message, POOL_SIZE_VAR, Pool, Reaction, Reactor, ReplyTo, Replyable,
    Response, Scheduled, Step, Task, Timer, TokioPool, TokioTimer, configure_default_group,
    default_group,
};

pub use dataflow::{
    DataflowBroadcast, DataflowQueue, DataflowStream, DataflowVariable, Error as DataflowError,
    Listener, ReadChannel, Select, SelectResult, StreamReadAdapter, StreamWriter,
    SyncStreamWriter, interruptible, is_interrupted,
};
