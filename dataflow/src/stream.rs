// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dataflow stream
//!
//! A persistent, write-once linked sequence. Every cell pairs a [`DataflowVariable`] holding the
//! element with a lazily created link to the next cell. Cells never change once written, so any
//! number of readers can walk the same spine with their own cursor: the broadcast property falls
//! out of the variable's support for many independent waiters.
//!
//! A cell bound to `None` marks the end of the stream.
//!

use crate::{
    DataflowVariable, Error,
    channel::{Listener, ReadChannel},
};

use futures::Stream;

use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
    time::{Duration, Instant},
};

struct StreamCell<T> {
    first: DataflowVariable<Option<T>>,
    rest: OnceLock<DataflowStream<T>>,
}

impl<T> Drop for StreamCell<T> {
    // Unlinks the spine iteratively so long streams do not recurse on drop.
    fn drop(&mut self) {
        let mut next = self.rest.take();
        while let Some(stream) = next {
            match Arc::try_unwrap(stream.cell) {
                Ok(mut cell) => next = cell.rest.take(),
                Err(_) => break,
            }
        }
    }
}

/// A cell of a persistent dataflow stream, and the stream that starts at it.
pub struct DataflowStream<T> {
    cell: Arc<StreamCell<T>>,
}

impl<T> DataflowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty, unwritten stream.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(StreamCell {
                first: DataflowVariable::new(),
                rest: OnceLock::new(),
            }),
        }
    }

    /// The variable holding this cell's element. `None` once bound means end-of-stream.
    pub fn first(&self) -> &DataflowVariable<Option<T>> {
        &self.cell.first
    }

    /// The stream after this cell, created on first request.
    pub fn rest(&self) -> DataflowStream<T> {
        self.cell.rest.get_or_init(DataflowStream::new).clone()
    }

    /// Writes `value` into this cell and returns the stream that follows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyBound`] when the cell already holds an element and
    /// [`Error::StreamClosed`] when it holds the end-of-stream marker.
    pub fn push(&self, value: T) -> Result<DataflowStream<T>, Error> {
        match self.cell.first.bind(Some(value)) {
            Ok(()) => Ok(self.rest()),
            Err(error) => Err(self.bind_error(error)),
        }
    }

    /// Writes the end-of-stream marker into this cell.
    pub fn close(&self) -> Result<(), Error> {
        self.cell.first.bind(None).map_err(|error| self.bind_error(error))
    }

    fn bind_error(&self, error: Error) -> Error {
        match self.cell.first.poll() {
            Some(None) => Error::StreamClosed,
            _ => error,
        }
    }

    /// True once this cell holds an element or the end marker.
    pub fn is_bound(&self) -> bool {
        self.cell.first.is_bound()
    }

    /// Blocks until this cell is written and reports whether it is the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the reading thread is interrupted.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.cell.first.get()?.is_none())
    }

    /// A reader starting at this cell. Readers never disturb each other.
    pub fn create_read_channel(&self) -> StreamReadAdapter<T> {
        StreamReadAdapter::new(self.clone())
    }

    /// Collects every element until the end marker, blocking as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the reading thread is interrupted.
    pub fn collect_all(&self) -> Result<Vec<T>, Error> {
        let reader = self.create_read_channel();
        let mut values = Vec::new();
        while let Some(value) = reader.get_val()? {
            values.push(value);
        }
        Ok(values)
    }

    fn same_cell(&self, other: &DataflowStream<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn downgrade(&self) -> Weak<StreamCell<T>> {
        Arc::downgrade(&self.cell)
    }
}

impl<T> Clone for DataflowStream<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Default for DataflowStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Debug for DataflowStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataflowStream")
            .field("first", &self.cell.first)
            .finish()
    }
}

/// Fires `listener` for the element of `cell` and keeps watching the following cells until the
/// end marker. Holds only weak links so an abandoned stream can still be freed.
fn watch<T>(cell: &DataflowStream<T>, listener: Listener)
where
    T: Clone + Send + Sync + 'static,
{
    let mut cell = cell.clone();
    // Cells written before the registration are reported right away.
    while let Some(value) = cell.first().poll() {
        listener();
        if value.is_none() {
            return;
        }
        cell = cell.rest();
    }
    let weak = cell.downgrade();
    cell.first().when_bound(move |value| {
        listener();
        if value.is_none() {
            return;
        }
        if let Some(cell) = weak.upgrade() {
            let rest = DataflowStream { cell }.rest();
            watch(&rest, listener);
        }
    });
}

/// Write side of a stream. Keeps the cursor at the first unwritten cell.
///
/// A single writer is assumed; use [`SyncStreamWriter`] when several threads write.
pub struct StreamWriter<T> {
    head: DataflowStream<T>,
}

impl<T> StreamWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a writer appending at `stream`.
    pub fn new(stream: DataflowStream<T>) -> Self {
        Self { head: stream }
    }

    /// Appends `value` and advances the cursor.
    pub fn write(&mut self, value: T) -> Result<(), Error> {
        self.head = self.head.push(value)?;
        Ok(())
    }

    /// Ends the stream.
    pub fn close(&mut self) -> Result<(), Error> {
        self.head.close()
    }

    /// The first unwritten cell.
    pub fn head(&self) -> DataflowStream<T> {
        self.head.clone()
    }
}

/// A stream writer shared between threads. Writes are serialized by a mutex.
pub struct SyncStreamWriter<T> {
    inner: Arc<Mutex<StreamWriter<T>>>,
}

impl<T> SyncStreamWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a shared writer appending at `stream`.
    pub fn new(stream: DataflowStream<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamWriter::new(stream))),
        }
    }

    fn writer(&self) -> MutexGuard<'_, StreamWriter<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `value`.
    pub fn write(&self, value: T) -> Result<(), Error> {
        self.writer().write(value)
    }

    /// Ends the stream.
    pub fn close(&self) -> Result<(), Error> {
        self.writer().close()
    }

    /// The first unwritten cell.
    pub fn head(&self) -> DataflowStream<T> {
        self.writer().head()
    }
}

impl<T> Clone for SyncStreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// An independent reading cursor over a stream.
///
/// Reading advances only this adapter. Sharing one adapter between threads serializes their
/// reads.
pub struct StreamReadAdapter<T> {
    cursor: Mutex<DataflowStream<T>>,
}

impl<T> StreamReadAdapter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cursor positioned at `stream`.
    pub fn new(stream: DataflowStream<T>) -> Self {
        Self {
            cursor: Mutex::new(stream),
        }
    }

    fn cursor(&self) -> MutexGuard<'_, DataflowStream<T>> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cell this adapter will read next.
    pub fn position(&self) -> DataflowStream<T> {
        self.cursor().clone()
    }

    /// Blocks until the next element is written. Returns `Ok(None)` at the end of the stream, and
    /// keeps returning it afterwards.
    ///
    /// The cursor lock is not held while blocked. When several threads share the adapter, only
    /// the one that moves the cursor past a cell gets its element; the others read on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the reading thread is interrupted; the cursor does not
    /// move.
    pub fn get_val(&self) -> Result<Option<T>, Error> {
        loop {
            let position = self.position();
            let value = position.first().get()?;
            if let Some(value) = self.advance(&position, value) {
                return Ok(value);
            }
        }
    }

    /// Like [`get_val`](Self::get_val) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nothing was written in time and [`Error::Interrupted`]
    /// when the thread is interrupted; the cursor does not move in either case.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let position = self.position();
            let left = deadline.saturating_duration_since(Instant::now());
            let value = position
                .first()
                .get_timeout(left)?
                .ok_or(Error::Timeout(timeout))?;
            if let Some(value) = self.advance(&position, value) {
                return Ok(value);
            }
        }
    }

    /// Moves the cursor past `position` if it still points there. `None` when another reader of
    /// this adapter moved it first.
    fn advance(&self, position: &DataflowStream<T>, value: Option<T>) -> Option<Option<T>> {
        let mut cursor = self.cursor();
        if !cursor.same_cell(position) {
            return None;
        }
        if value.is_some() {
            *cursor = position.rest();
        }
        Some(value)
    }

    /// Takes the next element if it is already written.
    pub fn poll(&self) -> Option<T> {
        let mut cursor = self.cursor();
        let value = cursor.first().poll()??;
        *cursor = cursor.rest();
        Some(value)
    }

    /// True when the cursor sits on the end marker.
    pub fn is_at_end(&self) -> bool {
        matches!(self.cursor().first().poll(), Some(None))
    }

    /// Consumes the adapter into an asynchronous stream of the remaining elements.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self, |adapter| async move {
            let position = adapter.position();
            let value = position.first().wait().await?;
            {
                let mut cursor = adapter.cursor();
                if cursor.same_cell(&position) {
                    *cursor = position.rest();
                }
            }
            Some((value, adapter))
        })
    }
}

impl<T> Iterator for StreamReadAdapter<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;

    /// Ends at the end marker and on interruption.
    fn next(&mut self) -> Option<T> {
        self.get_val().ok().flatten()
    }
}

impl<T> ReadChannel<T> for StreamReadAdapter<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn poll(&self) -> Option<T> {
        StreamReadAdapter::poll(self)
    }

    fn get_val(&self) -> Result<Option<T>, Error> {
        StreamReadAdapter::get_val(self)
    }

    fn when_value_available(&self, listener: Listener) {
        watch(&self.position(), listener);
    }
}
