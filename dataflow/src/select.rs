// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Select
//!
//! Multiplexed reads over several [`ReadChannel`]s. A select request scans the eligible channels
//! with a non-blocking poll and takes the first value it finds. When nothing is ready the request
//! is parked until one of the channels reports a new value.
//!
//! `select` starts the scan at a random channel, `priority_select` always starts at channel 0.
//! Only per-channel ordering is guaranteed; which of several ready channels wins is best effort.
//!

use crate::{
    DataflowVariable, Error,
    channel::{Listener, ReadChannel},
};

use rand::Rng;
use tracing::debug;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread,
    time::Duration,
};

/// The outcome of a select: the index of the channel that delivered and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectResult<T> {
    /// Position of the delivering channel in the select's channel list.
    pub index: usize,
    /// The value read from that channel.
    pub value: T,
}

type Reply<T> = Box<dyn FnOnce(Result<SelectResult<T>, Error>) + Send>;

struct Request<T> {
    id: u64,
    mask: Option<Vec<bool>>,
    priority: bool,
    reply: Reply<T>,
}

struct SelectState<T> {
    pending: Vec<Request<T>>,
    next_id: u64,
    closed: bool,
}

struct SelectInner<T> {
    channels: Vec<Arc<dyn ReadChannel<T>>>,
    state: Mutex<SelectState<T>>,
}

impl<T> SelectInner<T>
where
    T: Send + 'static,
{
    fn state(&self) -> MutexGuard<'_, SelectState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scans the channels allowed by `mask` once, in round-robin order.
    fn scan(&self, mask: Option<&[bool]>, priority: bool) -> Option<SelectResult<T>> {
        let count = self.channels.len();
        let start = if priority {
            0
        } else {
            rand::rng().random_range(0..count)
        };
        (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|index| mask.is_none_or(|mask| mask[*index]))
            .find_map(|index| {
                self.channels[index]
                    .poll()
                    .map(|value| SelectResult { index, value })
            })
    }

    /// Listener hook: a channel reports that it may have a value.
    fn value_arrived(&self, index: usize) {
        let mut ready = Vec::new();
        {
            let mut state = self.state();
            let mut position = 0;
            while position < state.pending.len() {
                let request = &state.pending[position];
                if request.mask.as_ref().is_some_and(|mask| !mask[index]) {
                    position += 1;
                    continue;
                }
                match self.scan(request.mask.as_deref(), request.priority) {
                    Some(result) => {
                        let request = state.pending.remove(position);
                        ready.push((request.reply, result));
                    }
                    None => position += 1,
                }
            }
        }
        for (reply, result) in ready {
            reply(Ok(result));
        }
    }
}

/// Select over a fixed list of read channels.
pub struct Select<T> {
    inner: Arc<SelectInner<T>>,
}

impl<T> Select<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds a select over `channels` and subscribes to each of them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoChannels`] when `channels` is empty.
    pub fn new(channels: Vec<Arc<dyn ReadChannel<T>>>) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::NoChannels);
        }
        let inner = Arc::new(SelectInner {
            channels,
            state: Mutex::new(SelectState {
                pending: Vec::new(),
                next_id: 0,
                closed: false,
            }),
        });
        for (index, channel) in inner.channels.iter().enumerate() {
            let weak: Weak<SelectInner<T>> = Arc::downgrade(&inner);
            let listener: Listener = Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.value_arrived(index);
                }
            });
            channel.when_value_available(listener);
        }
        Ok(Self { inner })
    }

    /// Number of watched channels.
    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    /// Always false: a select is never built without channels.
    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    /// Blocks until any channel delivers a value, scanning from a random start.
    pub fn select(&self) -> Result<SelectResult<T>, Error> {
        self.blocking(None, false)
    }

    /// Like [`Select::select`], restricted to the channels whose mask entry is true.
    pub fn select_masked(&self, mask: &[bool]) -> Result<SelectResult<T>, Error> {
        self.blocking(Some(mask), false)
    }

    /// Blocks until any channel delivers, preferring lower indices when several are ready.
    pub fn priority_select(&self) -> Result<SelectResult<T>, Error> {
        self.blocking(None, true)
    }

    /// Like [`Select::priority_select`], restricted by `mask`.
    pub fn priority_select_masked(&self, mask: &[bool]) -> Result<SelectResult<T>, Error> {
        self.blocking(Some(mask), true)
    }

    /// Waits at most `timeout` for a value. `Ok(None)` means the deadline passed and the request
    /// was withdrawn.
    pub fn select_timeout(&self, timeout: Duration) -> Result<Option<SelectResult<T>>, Error> {
        self.waiting(None, false, Some(timeout))
    }

    /// Delivers the next value to `callback` instead of blocking the calling thread.
    pub fn select_async<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<SelectResult<T>, Error>) + Send + 'static,
    {
        self.request(None, false, Box::new(callback)).map(|_| ())
    }

    /// Masked variant of [`Select::select_async`].
    pub fn select_masked_async<F>(&self, mask: &[bool], callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<SelectResult<T>, Error>) + Send + 'static,
    {
        self.request(Some(mask), false, Box::new(callback))
            .map(|_| ())
    }

    /// Priority-ordered variant of [`Select::select_async`].
    pub fn priority_select_async<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<SelectResult<T>, Error>) + Send + 'static,
    {
        self.request(None, true, Box::new(callback)).map(|_| ())
    }

    /// Masked, priority-ordered variant of [`Select::select_async`].
    pub fn priority_select_masked_async<F>(
        &self,
        mask: &[bool],
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Result<SelectResult<T>, Error>) + Send + 'static,
    {
        self.request(Some(mask), true, Box::new(callback))
            .map(|_| ())
    }

    /// Rejects further requests and fails every parked one with [`Error::SelectClosed`].
    pub fn close(&self) {
        let pending = {
            let mut state = self.inner.state();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        debug!("Select closed with {} pending requests.", pending.len());
        for request in pending {
            (request.reply)(Err(Error::SelectClosed));
        }
    }

    /// True once [`Select::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    fn blocking(&self, mask: Option<&[bool]>, priority: bool) -> Result<SelectResult<T>, Error> {
        self.waiting(mask, priority, None)?
            .ok_or(Error::Interrupted)
    }

    /// Parks a request and blocks on its answer. A request abandoned on timeout or interruption
    /// is withdrawn, so no channel value is consumed on its behalf.
    fn waiting(
        &self,
        mask: Option<&[bool]>,
        priority: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<SelectResult<T>>, Error> {
        let result = DataflowVariable::new();
        let target = result.clone();
        let id = self.request(
            mask,
            priority,
            Box::new(move |outcome| {
                target.bind_safely(outcome);
            }),
        )?;
        let abandoned = match timeout {
            Some(timeout) => result.get_timeout(timeout),
            None => result.get().map(Some),
        };
        let error = match abandoned {
            Ok(Some(outcome)) => return outcome.map(Some),
            Ok(None) => None,
            Err(error) => Some(error),
        };
        let withdrawn = {
            let mut state = self.inner.state();
            let before = state.pending.len();
            state.pending.retain(|request| Some(request.id) != id);
            state.pending.len() < before
        };
        if withdrawn {
            return error.map_or(Ok(None), Err);
        }
        // A channel resolved the request while it was being withdrawn; its reply is on the way.
        loop {
            if let Some(outcome) = result.poll() {
                return outcome.map(Some);
            }
            thread::yield_now();
        }
    }

    /// Scans once and parks the request if nothing is ready. The scan runs under the state lock
    /// so a value arriving concurrently is seen either by the scan or by `value_arrived`.
    ///
    /// Returns the id of the parked request, or `None` when it was answered right away.
    fn request(
        &self,
        mask: Option<&[bool]>,
        priority: bool,
        reply: Reply<T>,
    ) -> Result<Option<u64>, Error> {
        if let Some(mask) = mask {
            if mask.len() != self.len() {
                return Err(Error::MaskLength {
                    mask: mask.len(),
                    channels: self.len(),
                });
            }
        }
        let result = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(Error::SelectClosed);
            }
            match self.inner.scan(mask, priority) {
                Some(result) => result,
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.pending.push(Request {
                        id,
                        mask: mask.map(<[bool]>::to_vec),
                        priority,
                        reply,
                    });
                    return Ok(Some(id));
                }
            }
        };
        reply(Ok(result));
        Ok(None)
    }
}

impl<T> Clone for Select<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
