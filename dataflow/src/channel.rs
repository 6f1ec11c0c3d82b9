// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Read channels
//!
//! The common read side of every dataflow channel. [`Select`](crate::Select) only talks to
//! channels through this trait.
//!

use crate::Error;

use std::sync::Arc;

/// Notification hook fired whenever a channel may have a new value to poll.
pub type Listener = Arc<dyn Fn() + Send + Sync + 'static>;

/// Read side of a dataflow channel.
pub trait ReadChannel<T>: Send + Sync {
    /// Takes the next value if one is ready, without blocking.
    ///
    /// Variables return their value on every call; streams and queues consume it.
    fn poll(&self) -> Option<T>;

    /// Blocks until the next value is ready. `Ok(None)` means the channel has ended and will
    /// never yield again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the reading thread is interrupted while waiting.
    fn get_val(&self) -> Result<Option<T>, Error>;

    /// Registers `listener` to be fired every time a new value becomes available.
    fn when_value_available(&self, listener: Listener);
}

impl<T, C> ReadChannel<T> for Arc<C>
where
    C: ReadChannel<T> + ?Sized,
{
    fn poll(&self) -> Option<T> {
        (**self).poll()
    }

    fn get_val(&self) -> Result<Option<T>, Error> {
        (**self).get_val()
    }

    fn when_value_available(&self, listener: Listener) {
        (**self).when_value_available(listener)
    }
}
