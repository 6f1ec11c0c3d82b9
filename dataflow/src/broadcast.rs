// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Broadcast channel
//!
//! A thread-safe writer over a [`DataflowStream`] whose readers subscribe at the current write
//! position: every subscriber sees each value written after it subscribed.
//!

use crate::{
    Error,
    stream::{DataflowStream, StreamReadAdapter, SyncStreamWriter},
};

/// One-to-many channel built on a dataflow stream.
pub struct DataflowBroadcast<T> {
    writer: SyncStreamWriter<T>,
}

impl<T> DataflowBroadcast<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a broadcast over a fresh stream.
    pub fn new() -> Self {
        Self {
            writer: SyncStreamWriter::new(DataflowStream::new()),
        }
    }

    /// Publishes `value` to every current subscriber.
    pub fn write(&self, value: T) -> Result<(), Error> {
        self.writer.write(value)
    }

    /// Ends the stream for every subscriber.
    pub fn close(&self) -> Result<(), Error> {
        self.writer.close()
    }

    /// Subscribes a new reader at the current write position.
    pub fn create_read_channel(&self) -> StreamReadAdapter<T> {
        self.writer.head().create_read_channel()
    }
}

impl<T> Clone for DataflowBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<T> Default for DataflowBroadcast<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
