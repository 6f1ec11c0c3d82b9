// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor
//!
//! The [`Actor`] trait, the [`ActorContext`] handed to every piece of actor code, and the
//! [`ActorRef`] used to drive an actor from the outside.
//!
//! Actor code never blocks waiting for its next message. Instead it returns a [`Flow`] that tells
//! the scheduler what to do next: wait for a message with a reaction, continue the current loop,
//! stop or terminate. The scheduler stores the reaction, releases the pool thread, and runs the
//! reaction on whichever pool thread is free once a message arrives.
//!

use crate::{
    Error,
    message::{Envelope, Message, ReplyTo, Replyable, Response, WaitReply},
    runner::{ActorCell, Letter},
    state::{ActorState, Ending},
};

use dataflow::DataflowVariable;

use tracing::{error, warn};

use std::{
    collections::VecDeque,
    fmt,
    sync::{atomic::Ordering, Arc, Weak},
    time::{Duration, Instant},
};

/// An envelope addressed to actor `A`.
pub type Mail<A> = Envelope<<A as Actor>::Message, <A as Actor>::Reply>;

/// What actor code returns: the next step, or a failure routed to [`Actor::on_exception`].
pub type Step<A> = Result<Flow<A>, Error>;

/// The next step of an actor, as decided by the code that just ran.
pub enum Flow<A: Actor> {
    /// Release the thread and resume with this reaction when a message arrives.
    React(Reaction<A>),
    /// Run the next iteration of the current loop. Without a loop the actor stops.
    Continue,
    /// Finish now as stopped. Queued messages become undelivered.
    Stop,
    /// Finish now as terminated.
    Terminate,
}

impl<A: Actor> fmt::Debug for Flow<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::React(reaction) => f
                .debug_tuple("React")
                .field(&reaction.timeout)
                .finish(),
            Flow::Continue => write!(f, "Continue"),
            Flow::Stop => write!(f, "Stop"),
            Flow::Terminate => write!(f, "Terminate"),
        }
    }
}

type Handler<A> =
    Box<dyn FnOnce(&mut A, Mail<A>, &mut ActorContext<A>) -> Step<A> + Send + 'static>;

/// A pending reaction: the code to run with the next message, and an optional timeout.
pub struct Reaction<A: Actor> {
    pub(crate) handler: Handler<A>,
    pub(crate) timeout: Option<Duration>,
}

impl<A: Actor> Reaction<A> {
    fn new(timeout: Option<Duration>, handler: Handler<A>) -> Self {
        Self { handler, timeout }
    }
}

type Body<A> = Box<dyn FnMut(&mut A, &mut ActorContext<A>) -> Step<A> + Send + 'static>;

pub(crate) enum LoopCondition<A> {
    Forever,
    Times(usize),
    While(Box<dyn FnMut(&A) -> bool + Send + 'static>),
}

/// The body re-run after every completed reaction cycle.
pub(crate) struct LoopBody<A: Actor> {
    pub body: Body<A>,
    pub condition: LoopCondition<A>,
}

/// Behaviour of an actor.
///
/// An actor is started with [`Actor::act`], which usually sets up a loop of reactions:
///
/// ```ignore
/// use actor::{Actor, ActorContext, Flow, Step};
///
/// struct Counter {
///     total: u64,
/// }
///
/// impl Actor for Counter {
///     type Message = u64;
///     type Reply = u64;
///
///     fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
///         Ok(ctx.loop_forever(|_, ctx| {
///             Ok(ctx.react(|counter: &mut Counter, value, ctx| {
///                 counter.total += value;
///                 ctx.reply_if_exists(counter.total);
///                 Ok(Flow::Continue)
///             }))
///         }))
///     }
/// }
/// ```
///
/// All hooks run on the pool thread that currently owns the actor, never concurrently with each
/// other. A panic inside any of them is caught and handled like a returned error.
pub trait Actor: Send + Sized + 'static {
    /// Messages this actor reacts to.
    type Message: Message;

    /// Replies this actor sends back to the senders of its messages.
    type Reply: Response;

    /// Body of the actor, run once right after it starts.
    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self>;

    /// Runs before [`Actor::act`]. An error terminates the actor.
    fn on_start(&mut self, _ctx: &mut ActorContext<Self>) -> Result<(), Error> {
        Ok(())
    }

    /// Receives every error returned or panic raised by actor code. The actor terminates right
    /// after.
    fn on_exception(&mut self, error: Error, ctx: &mut ActorContext<Self>) {
        error!("Actor {} failed: {}", ctx.name(), error);
    }

    /// Called when a termination request interrupted the actor while it was running. The actor
    /// terminates right after.
    fn on_interrupt(&mut self, ctx: &mut ActorContext<Self>) {
        warn!("Actor {} was interrupted.", ctx.name());
    }

    /// Called when a reaction armed with a timeout saw no message in time. The default
    /// terminates the actor silently.
    fn on_timeout(&mut self, _ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(Flow::Terminate)
    }

    /// Last hook of the actor, with every message that was queued but never processed.
    fn after_stop(&mut self, _undelivered: Vec<Mail<Self>>) {}
}

/// Execution context of an actor.
///
/// Only reachable from the actor's own code, so everything here runs on the actor's thread.
pub struct ActorContext<A: Actor> {
    cell: Weak<ActorCell<A>>,
    name: String,
    pub(crate) receiver: crate::mailbox::MailboxReceiver<Letter<A>>,
    pub(crate) reaction: Option<Reaction<A>>,
    pub(crate) body: Option<LoopBody<A>>,
    pub(crate) senders: Vec<ReplyTo<A::Reply>>,
    pub(crate) stash: VecDeque<Mail<A>>,
    pub(crate) generation: u64,
    pub(crate) control: Option<Ending>,
    pub(crate) started: bool,
}

impl<A: Actor> ActorContext<A> {
    pub(crate) fn new(
        cell: Weak<ActorCell<A>>,
        name: &str,
        receiver: crate::mailbox::MailboxReceiver<Letter<A>>,
    ) -> Self {
        Self {
            cell,
            name: name.to_owned(),
            receiver,
            reaction: None,
            body: None,
            senders: Vec::new(),
            stash: VecDeque::new(),
            generation: 0,
            control: None,
            started: false,
        }
    }

    fn cell(&self) -> Result<Arc<ActorCell<A>>, Error> {
        self.cell
            .upgrade()
            .ok_or_else(|| Error::Finished(self.name.clone()))
    }

    /// Name of the actor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A reference to this actor, to hand out as a reply address.
    pub fn myself(&self) -> Result<ActorRef<A>, Error> {
        self.cell().map(ActorRef::from_cell)
    }

    /// Waits for the next message and runs `handler` with it.
    pub fn react<F>(&mut self, handler: F) -> Flow<A>
    where
        F: FnOnce(&mut A, A::Message, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        Flow::React(Reaction::new(
            None,
            Box::new(move |actor: &mut A, mail: Mail<A>, ctx: &mut ActorContext<A>| {
                let message = ctx.open(mail);
                handler(actor, message, ctx)
            }),
        ))
    }

    /// Like [`ActorContext::react`], but gives up after `timeout` and calls
    /// [`Actor::on_timeout`] instead.
    pub fn react_for<F>(&mut self, timeout: Duration, handler: F) -> Flow<A>
    where
        F: FnOnce(&mut A, A::Message, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        match self.react(handler) {
            Flow::React(mut reaction) => {
                reaction.timeout = Some(timeout);
                Flow::React(reaction)
            }
            other => other,
        }
    }

    /// Waits for the next message and runs `handler` without looking at it.
    pub fn react_any<F>(&mut self, handler: F) -> Flow<A>
    where
        F: FnOnce(&mut A, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        self.react(move |actor, _, ctx| handler(actor, ctx))
    }

    /// Waits for `count` messages (at least one) and runs `handler` with all of them. Replies go
    /// to every sender of the batch.
    pub fn react_many<F>(&mut self, count: usize, handler: F) -> Flow<A>
    where
        F: FnOnce(&mut A, Vec<A::Message>, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        gather(count.max(1), Vec::new(), handler)
    }

    /// Runs `body` repeatedly, once per completed reaction cycle, until the actor stops.
    pub fn loop_forever<F>(&mut self, body: F) -> Flow<A>
    where
        F: FnMut(&mut A, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        self.start_loop(LoopCondition::Forever, Box::new(body))
    }

    /// Runs `body` `times` times, then stops the actor.
    pub fn loop_times<F>(&mut self, times: usize, body: F) -> Flow<A>
    where
        F: FnMut(&mut A, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        self.start_loop(LoopCondition::Times(times), Box::new(body))
    }

    /// Runs `body` while `condition` holds before each iteration, then stops the actor.
    pub fn loop_while<P, F>(&mut self, condition: P, body: F) -> Flow<A>
    where
        P: FnMut(&A) -> bool + Send + 'static,
        F: FnMut(&mut A, &mut ActorContext<A>) -> Step<A> + Send + 'static,
    {
        self.start_loop(LoopCondition::While(Box::new(condition)), Box::new(body))
    }

    fn start_loop(&mut self, condition: LoopCondition<A>, body: Body<A>) -> Flow<A> {
        self.body = Some(LoopBody { body, condition });
        Flow::Continue
    }

    /// Blocks the actor's thread until the next message arrives.
    ///
    /// Prefer [`ActorContext::react`], which releases the thread while waiting.
    ///
    /// # Errors
    ///
    /// * [`Error::NotActorThread`] off the actor's thread.
    /// * [`Error::Interrupted`] when the actor is terminated while waiting.
    /// * [`Error::Stopping`] when the stop sentinel is reached. The actor stops once the
    ///   current code returns, whatever it returns.
    pub fn receive(&mut self) -> Result<A::Message, Error> {
        match self.receive_until(None)? {
            Some(message) => Ok(message),
            None => Err(Error::Interrupted(self.name.clone())),
        }
    }

    /// Like [`ActorContext::receive`], returning `Ok(None)` when nothing arrived in time.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<A::Message>, Error> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    fn receive_until(&mut self, deadline: Option<Instant>) -> Result<Option<A::Message>, Error> {
        let cell = self.cell()?;
        if !cell.is_current_thread() {
            return Err(Error::NotActorThread(self.name.clone()));
        }
        if let Some(mail) = self.stash.pop_front() {
            return Ok(Some(self.open(mail)));
        }
        loop {
            if cell.state.get() == ActorState::Terminating {
                self.control = Some(Ending::Terminate);
                return Err(Error::Interrupted(self.name.clone()));
            }
            let letter = self
                .receiver
                .take(deadline, || cell.interrupted.load(Ordering::SeqCst));
            match letter {
                Some(Letter::Message(mail)) => return Ok(Some(self.open(mail))),
                Some(Letter::Stop) => {
                    self.control = Some(Ending::Stop);
                    return Err(Error::Stopping(self.name.clone()));
                }
                Some(Letter::Terminate) => {
                    self.control = Some(Ending::Terminate);
                    return Err(Error::Interrupted(self.name.clone()));
                }
                Some(Letter::Start) | Some(Letter::Timeout(_)) => continue,
                None => {
                    if cell.interrupted.load(Ordering::SeqCst)
                        || cell.state.get() == ActorState::Terminating
                    {
                        self.control = Some(Ending::Terminate);
                        return Err(Error::Interrupted(self.name.clone()));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Makes the sender of `mail` the current reply address and returns the payload.
    pub(crate) fn open(&mut self, mail: Mail<A>) -> A::Message {
        let (message, sender) = mail.into_parts();
        self.senders = sender.into_iter().collect();
        message
    }

    /// Reply addresses of the message being processed.
    pub fn senders(&self) -> &[ReplyTo<A::Reply>] {
        &self.senders
    }

    /// Sends `reply` to every sender of the current message.
    ///
    /// # Errors
    ///
    /// [`Error::NoSender`] when there is nobody to reply to, otherwise [`Error::Reply`] with
    /// every failure after all senders were tried.
    pub fn reply(&self, reply: A::Reply) -> Result<(), Error> {
        if self.senders.is_empty() {
            return Err(Error::NoSender);
        }
        let failures: Vec<Error> = self
            .senders
            .iter()
            .filter_map(|sender| sender.reply(reply.clone()).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            warn!(
                "Actor {} could not deliver {} replies.",
                self.name,
                failures.len()
            );
            Err(Error::Reply(failures))
        }
    }

    /// Best-effort [`ActorContext::reply`]: failures and missing senders are ignored.
    pub fn reply_if_exists(&self, reply: A::Reply) {
        for sender in &self.senders {
            let _ = sender.reply(reply.clone());
        }
    }

    /// Marks the actor as terminating. Return the flow to finish right away.
    pub fn terminate(&self) -> Flow<A> {
        if let Ok(cell) = self.cell() {
            cell.state.terminate();
        }
        Flow::Terminate
    }

    /// True when a termination request is interrupting the current code.
    pub fn is_interrupted(&self) -> bool {
        self.cell
            .upgrade()
            .is_some_and(|cell| cell.interrupted.load(Ordering::SeqCst))
    }
}

/// One curried step of [`ActorContext::react_many`].
fn gather<A, F>(count: usize, mut collected: Vec<Mail<A>>, handler: F) -> Flow<A>
where
    A: Actor,
    F: FnOnce(&mut A, Vec<A::Message>, &mut ActorContext<A>) -> Step<A> + Send + 'static,
{
    Flow::React(Reaction::new(
        None,
        Box::new(move |actor: &mut A, mail: Mail<A>, ctx: &mut ActorContext<A>| {
            collected.push(mail);
            if collected.len() < count {
                return Ok(gather(count, collected, handler));
            }
            let mut messages = Vec::with_capacity(collected.len());
            let mut senders = Vec::new();
            for mail in collected {
                let (message, sender) = mail.into_parts();
                messages.push(message);
                senders.extend(sender);
            }
            ctx.senders = senders;
            handler(actor, messages, ctx)
        }),
    ))
}

/// Handle used to start, stop, join and message an actor. Cheap to clone.
pub struct ActorRef<A: Actor> {
    cell: Arc<ActorCell<A>>,
}

impl<A: Actor> ActorRef<A> {
    pub(crate) fn from_cell(cell: Arc<ActorCell<A>>) -> Self {
        Self { cell }
    }

    /// Name of the actor.
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ActorState {
        self.cell.state.get()
    }

    /// True between start and the end of the actor.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Starts the actor on its group's pool.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] on any actor that is not in the not-started state.
    pub fn start(&self) -> Result<(), Error> {
        if !self.cell.state.start() {
            return Err(Error::AlreadyStarted(self.cell.name.clone()));
        }
        self.cell.sender.push_uncounted(Letter::Start);
        self.cell.schedule()
    }

    /// Asks the actor to stop once every message queued so far is processed. A no-op unless the
    /// actor is running.
    pub fn stop(&self) -> Result<(), Error> {
        if self.cell.state.stop() {
            self.cell.deliver(Letter::Stop)
        } else {
            Ok(())
        }
    }

    /// Terminates the actor as soon as possible: an actor blocked in `receive` or in a dataflow
    /// read is interrupted, an idle one is woken by a terminate sentinel. A no-op on a finished
    /// actor.
    pub fn terminate(&self) -> Result<(), Error> {
        match self.cell.state.terminate() {
            None => Ok(()),
            Some(ActorState::NotStarted) => {
                self.cell.sender.push_uncounted(Letter::Terminate);
                self.cell.schedule()
            }
            Some(_) => {
                self.cell.interrupt();
                self.cell.deliver(Letter::Terminate)
            }
        }
    }

    /// Blocks until the actor finished and returns its final state.
    ///
    /// # Errors
    ///
    /// [`Error::Dataflow`] with an interruption when the joining actor is itself terminated.
    pub fn join(&self) -> Result<ActorState, Error> {
        Ok(self.cell.join.get()?)
    }

    /// Like [`ActorRef::join`], giving up after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Result<ActorState, Error> {
        self.cell
            .join
            .get_timeout(timeout)?
            .ok_or(Error::Timeout(timeout))
    }

    /// Waits for the actor to finish without blocking an executor thread.
    pub async fn finished(&self) -> ActorState {
        self.cell.join.wait().await
    }

    /// Runs `callback` with the final state once the actor finished.
    pub fn when_finished<F>(&self, callback: F)
    where
        F: FnOnce(ActorState) + Send + 'static,
    {
        self.cell.join.when_bound(callback);
    }

    /// Sends a message without a reply address.
    ///
    /// # Errors
    ///
    /// [`Error::Finished`] when the actor has already finished.
    pub fn send(&self, message: A::Message) -> Result<(), Error> {
        self.post(Envelope::new(message, None))
    }

    /// Sends a message whose replies go to `reply_to`.
    pub fn send_with_reply_to(
        &self,
        message: A::Message,
        reply_to: ReplyTo<A::Reply>,
    ) -> Result<(), Error> {
        self.post(Envelope::new(message, Some(reply_to)))
    }

    /// Sends a message and blocks until the actor replies.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be sent, is left undelivered when the actor finishes, or
    /// when the waiting actor is itself terminated.
    pub fn send_and_wait(&self, message: A::Message) -> Result<A::Reply, Error> {
        let (handle, result) = WaitReply::new();
        self.post(Envelope::new(message, Some(handle as ReplyTo<A::Reply>)))?;
        result.get()?
    }

    /// Like [`ActorRef::send_and_wait`], giving up after `timeout`.
    pub fn send_and_wait_timeout(
        &self,
        message: A::Message,
        timeout: Duration,
    ) -> Result<A::Reply, Error> {
        let (handle, result) = WaitReply::new();
        self.post(Envelope::new(message, Some(handle as ReplyTo<A::Reply>)))?;
        result.get_timeout(timeout)?.ok_or(Error::Timeout(timeout))?
    }

    /// Sends a message and runs `callback` with the reply, on the thread that replies.
    pub fn send_and_continue<F>(&self, message: A::Message, callback: F) -> Result<(), Error>
    where
        F: FnOnce(A::Reply) + Send + 'static,
    {
        let reply = DataflowVariable::new();
        reply.when_bound(callback);
        self.post(Envelope::new(message, Some(Arc::new(reply) as ReplyTo<A::Reply>)))
    }

    /// This actor as a reply address for other actors.
    pub fn reply_to(&self) -> ReplyTo<A::Message> {
        Arc::new(self.clone())
    }

    fn post(&self, mail: Mail<A>) -> Result<(), Error> {
        if self.state().is_finished() {
            return Err(Error::Finished(self.cell.name.clone()));
        }
        self.cell.deliver(Letter::Message(mail))
    }
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: Actor> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("name", &self.cell.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<A: Actor> Replyable<A::Message> for ActorRef<A> {
    fn reply(&self, reply: A::Message) -> Result<(), Error> {
        self.send(reply)
    }
}
