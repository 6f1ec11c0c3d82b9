// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

/// Error type for the dataflow primitives.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// A value was bound to a variable that already holds one.
    #[error("The dataflow variable is already bound.")]
    AlreadyBound,
    /// A timed read gave up before a value arrived.
    #[error("No value arrived within {0:?}.")]
    Timeout(Duration),
    /// A blocking read gave up because its thread was interrupted.
    #[error("The blocking read was interrupted.")]
    Interrupted,
    /// A value was written after the end-of-stream marker.
    #[error("The dataflow stream is already closed.")]
    StreamClosed,
    /// A select operation was requested after `close()`.
    #[error("The select has been closed.")]
    SelectClosed,
    /// A select was built without any channel to watch.
    #[error("A select needs at least one channel.")]
    NoChannels,
    /// The eligibility mask does not cover every channel.
    #[error("Mask of length {mask} does not match {channels} channels.")]
    MaskLength {
        /// Length of the supplied mask.
        mask: usize,
        /// Number of channels watched by the select.
        channels: usize,
    },
}
