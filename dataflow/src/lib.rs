// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dataflow
//!
//! Single-assignment synchronization primitives shared by threads, async tasks and actors.
//!
//! ## Variables
//!
//! A [`DataflowVariable`] starts unbound and is bound exactly once. Readers either block the
//! calling thread ([`DataflowVariable::get`]), wait asynchronously ([`DataflowVariable::wait`]),
//! or register a callback ([`DataflowVariable::when_bound`]). Binding never blocks: waiting
//! threads are kept in a lock-free chain that the binder swaps out and releases in one pass.
//! Release order across waiters is unspecified.
//!
//! ## Streams
//!
//! A [`DataflowStream`] is a persistent linked list of variables. The writer binds the head cell
//! and moves on to its rest; every reader walks the same cells with its own
//! [`StreamReadAdapter`], so every reader sees every value. [`DataflowBroadcast`] wraps this in a
//! thread-safe writer and [`DataflowQueue`] offers point-to-point delivery instead.
//!
//! ## Interruption
//!
//! Blocking reads fail with [`Error::Interrupted`] when the reading thread runs inside
//! [`interruptible`] and its flag is raised. The actor runtime installs one such flag per
//! running actor so that terminating it unblocks whatever read it is stuck in.
//!
//! ## Select
//!
//! [`Select`] multiplexes reads over any set of [`ReadChannel`]s, either blocking, with a
//! timeout, or delivering the result to a callback.
//!
//! ```ignore
//! use dataflow::{DataflowVariable, ReadChannel, Select};
//! use std::sync::Arc;
//!
//! let a = DataflowVariable::new();
//! let b = DataflowVariable::new();
//! let select = Select::new(vec![
//!     Arc::new(a.clone()) as Arc<dyn ReadChannel<u32>>,
//!     Arc::new(b.clone()),
//! ])?;
//! b.bind(7)?;
//! assert_eq!(select.select()?.index, 1);
//! ```
//!

mod broadcast;
mod channel;
mod error;
mod interrupt;
mod queue;
mod select;
mod stream;
mod variable;

pub use broadcast::DataflowBroadcast;
pub use channel::{Listener, ReadChannel};
pub use error::Error;
pub use interrupt::{interruptible, is_interrupted};
pub use queue::DataflowQueue;
pub use select::{Select, SelectResult};
pub use stream::{DataflowStream, StreamReadAdapter, StreamWriter, SyncStreamWriter};
pub use variable::DataflowVariable;
