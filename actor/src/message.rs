// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Messages and reply routing
//!
//! Every message travels in an [`Envelope`] that carries the payload together with an optional
//! reply handle. Reply handles implement [`Replyable`]; actor references and dataflow variables
//! both do, so an actor can answer another actor or bind a variable a caller is waiting on.
//!

use crate::Error;

use dataflow::{DataflowQueue, DataflowVariable};

use std::{fmt, sync::Arc};

/// Marker for types that can be sent to an actor.
pub trait Message: Send + 'static {}

/// Marker for types an actor replies with.
pub trait Response: Clone + Send + Sync + 'static {}

macro_rules! impl_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Message for $ty {}
            impl Response for $ty {}
        )*
    };
}

impl_payload!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

impl<T: Message> Message for Vec<T> {}
impl<T: Response> Response for Vec<T> {}
impl<T: Message> Message for Option<T> {}
impl<T: Response> Response for Option<T> {}
impl<T: Response, E: Response> Response for Result<T, E> {}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Message),+> Message for ($($name,)+) {}
        impl<$($name: Response),+> Response for ($($name,)+) {}
    };
}

impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);

/// A handle able to receive replies of type `R`.
pub trait Replyable<R>: Send + Sync {
    /// Delivers `reply` to this handle.
    fn reply(&self, reply: R) -> Result<(), Error>;

    /// Called when the message this handle was attached to will never be processed.
    fn on_delivery_error(&self, _error: Error) {}
}

/// Shared reply handle carried by an envelope.
pub type ReplyTo<R> = Arc<dyn Replyable<R>>;

impl<R> Replyable<R> for DataflowVariable<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn reply(&self, reply: R) -> Result<(), Error> {
        self.bind(reply).map_err(Error::from)
    }
}

impl<R> Replyable<R> for DataflowQueue<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn reply(&self, reply: R) -> Result<(), Error> {
        self.write(reply);
        Ok(())
    }
}

/// Reply handle used by `send_and_wait`: it also learns about undelivered messages.
pub(crate) struct WaitReply<R> {
    result: DataflowVariable<Result<R, Error>>,
}

impl<R> WaitReply<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> (Arc<Self>, DataflowVariable<Result<R, Error>>) {
        let result = DataflowVariable::new();
        (
            Arc::new(Self {
                result: result.clone(),
            }),
            result,
        )
    }
}

impl<R> Replyable<R> for WaitReply<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn reply(&self, reply: R) -> Result<(), Error> {
        self.result.bind(Ok(reply)).map_err(Error::from)
    }

    fn on_delivery_error(&self, error: Error) {
        self.result.bind_safely(Err(error));
    }
}

/// A message together with the handle its answer should go to.
pub struct Envelope<M, R> {
    payload: M,
    sender: Option<ReplyTo<R>>,
}

impl<M, R> Envelope<M, R> {
    /// Wraps `payload` with an optional reply handle.
    pub fn new(payload: M, sender: Option<ReplyTo<R>>) -> Self {
        Self { payload, sender }
    }

    /// The message itself.
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Where replies to this message go, if anywhere.
    pub fn sender(&self) -> Option<&ReplyTo<R>> {
        self.sender.as_ref()
    }

    /// Splits the envelope into payload and reply handle.
    pub fn into_parts(self) -> (M, Option<ReplyTo<R>>) {
        (self.payload, self.sender)
    }

    /// Tells the sender, if any, that this message will not be processed.
    pub fn reject(&self, error: Error) {
        if let Some(sender) = &self.sender {
            sender.on_delivery_error(error);
        }
    }
}

impl<M: fmt::Debug, R> fmt::Debug for Envelope<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("payload", &self.payload)
            .field("has_sender", &self.sender.is_some())
            .finish()
    }
}
