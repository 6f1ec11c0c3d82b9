// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dataflow queue
//!
//! A point-to-point FIFO channel. Every written value is delivered to exactly one reader. The
//! queue holds either bound variables waiting for readers or unbound requests waiting for
//! writers, never both.
//!

use crate::{
    DataflowVariable, Error,
    channel::{Listener, ReadChannel},
};

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

struct QueueState<T> {
    values: VecDeque<DataflowVariable<T>>,
    requests: VecDeque<DataflowVariable<T>>,
    listeners: Vec<Listener>,
}

/// A many-writers, many-readers FIFO queue of dataflow values.
pub struct DataflowQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> DataflowQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                values: VecDeque::new(),
                requests: VecDeque::new(),
                listeners: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `value`, handing it straight to the oldest waiting reader if there is one.
    pub fn write(&self, value: T) {
        let (request, listeners) = {
            let mut state = self.state();
            match state.requests.pop_front() {
                Some(request) => (Some(request), Vec::new()),
                None => {
                    state.values.push_back(DataflowVariable::bound(value.clone()));
                    (None, state.listeners.clone())
                }
            }
        };
        if let Some(request) = request {
            request.bind_safely(value);
        }
        for listener in listeners {
            listener();
        }
    }

    /// Blocks until a value is available and takes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the reading thread is interrupted. The request is
    /// withdrawn first, so the next value goes to another reader.
    pub fn get_val(&self) -> Result<T, Error> {
        let request = self.request();
        match request.get() {
            Ok(value) => Ok(value),
            Err(error) => match self.withdraw(request) {
                Ok(()) => Err(error),
                Err(value) => Ok(value),
            },
        }
    }

    /// Takes a value, waiting at most `timeout`. An expired request is withdrawn so no value is
    /// lost to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] like [`get_val`](Self::get_val).
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, Error> {
        let request = self.request();
        match request.get_timeout(timeout) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => Ok(self.withdraw(request).err()),
            Err(error) => match self.withdraw(request) {
                Ok(()) => Err(error),
                Err(value) => Ok(Some(value)),
            },
        }
    }

    /// Removes an abandoned request. When a writer claimed it first, waits for the value it is
    /// about to bind and hands it back as the error.
    fn withdraw(&self, request: DataflowVariable<T>) -> Result<(), T> {
        let mut state = self.state();
        let before = state.requests.len();
        state.requests.retain(|pending| *pending != request);
        if state.requests.len() < before {
            return Ok(());
        }
        drop(state);
        loop {
            if let Some(value) = request.poll() {
                return Err(value);
            }
            thread::yield_now();
        }
    }

    /// Takes the next value without blocking.
    pub fn poll(&self) -> Option<T> {
        self.state().values.pop_front().and_then(|value| value.poll())
    }

    /// Registers `callback` for the next value in line, without blocking.
    pub fn get_val_async<F>(&self, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.request().when_bound(callback);
    }

    /// Number of values written and not yet taken.
    pub fn len(&self) -> usize {
        self.state().values.len()
    }

    /// True when no value is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the variable that will carry the next value for this reader.
    fn request(&self) -> DataflowVariable<T> {
        let mut state = self.state();
        match state.values.pop_front() {
            Some(value) => value,
            None => {
                let request = DataflowVariable::new();
                state.requests.push_back(request.clone());
                request
            }
        }
    }
}

impl<T> Clone for DataflowQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for DataflowQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadChannel<T> for DataflowQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn poll(&self) -> Option<T> {
        DataflowQueue::poll(self)
    }

    fn get_val(&self) -> Result<Option<T>, Error> {
        DataflowQueue::get_val(self).map(Some)
    }

    fn when_value_available(&self, listener: Listener) {
        let pending = {
            let mut state = self.state();
            state.listeners.push(listener.clone());
            state.values.len()
        };
        for _ in 0..pending {
            listener();
        }
    }
}
