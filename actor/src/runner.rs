// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor runner
//!
//! Runs an actor one chunk at a time on its group's pool. Every chunk takes a single letter from
//! the mailbox, feeds it to the pending reaction (or to the lifecycle logic for sentinels), and
//! follows the returned [`Flow`] until the actor waits for a message again or finishes.
//!
//! The mailbox counter guarantees that at most one chunk is queued or running per actor: a
//! sender schedules a chunk only when the counter goes from zero to one, and a finished chunk
//! resubmits itself only when letters are still pending.
//!
//! Once the actor has finished, every letter posted afterwards schedules a chunk of its own that
//! rejects it, so no message is left without an answer.
//!

use crate::{
    Error,
    actor::{Actor, ActorContext, Flow, LoopCondition, Mail, Reaction, Step},
    group::ActorGroup,
    mailbox::{mailbox, MailboxSender},
    pool::Scheduled,
    state::{ActorState, Ending, StateCell},
};

use dataflow::{DataflowVariable, interruptible};

use tracing::{debug, error, warn};

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, Thread},
};

/// Everything that can sit in an actor's mailbox.
pub(crate) enum Letter<A: Actor> {
    /// An ordinary message.
    Message(Mail<A>),
    /// Initializes the actor.
    Start,
    /// Stop sentinel, reached after every message queued before it.
    Stop,
    /// Terminate sentinel, wakes an idle actor that must terminate.
    Terminate,
    /// Reaction timeout, tagged with the generation of the reaction it belongs to.
    Timeout(u64),
}

/// Runs `f`, turning a panic into [`Error::Panicked`].
fn guarded<R>(f: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

/// State shared by every reference to an actor.
pub(crate) struct ActorCell<A: Actor> {
    pub name: String,
    pub state: StateCell,
    pub sender: MailboxSender<Letter<A>>,
    pub join: DataflowVariable<ActorState>,
    /// Raised by `terminate` from another thread. Blocking dataflow reads of the running
    /// actor fail once it is set.
    pub interrupted: Arc<AtomicBool>,
    current: Mutex<Option<Thread>>,
    group: ActorGroup,
    core: Mutex<Core<A>>,
}

/// The part of an actor only touched by the chunk that owns it.
struct Core<A: Actor> {
    actor: A,
    ctx: ActorContext<A>,
    /// Timeout of the pending reaction.
    timer: Option<Scheduled>,
}

impl<A: Actor> ActorCell<A> {
    /// Creates the cell of a not-started actor. The mailbox counter starts at one: that unit
    /// belongs to the start (or early terminate) sentinel, so nothing is scheduled before it.
    pub fn new(name: &str, actor: A, group: ActorGroup) -> Arc<Self> {
        let (sender, receiver) = mailbox(1);
        Arc::new_cyclic(|cell| Self {
            name: name.to_owned(),
            state: StateCell::new(),
            sender,
            join: DataflowVariable::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
            group,
            core: Mutex::new(Core {
                actor,
                ctx: ActorContext::new(cell.clone(), name, receiver),
                timer: None,
            }),
        })
    }

    pub fn group(&self) -> &ActorGroup {
        &self.group
    }

    fn current(&self) -> MutexGuard<'_, Option<Thread>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when called from the thread running the actor right now.
    pub fn is_current_thread(&self) -> bool {
        self.current()
            .as_ref()
            .is_some_and(|thread| thread.id() == thread::current().id())
    }

    /// Flags and wakes the thread running the actor, unless that is the caller itself.
    pub fn interrupt(&self) {
        let current = self.current();
        if let Some(thread) = current.as_ref() {
            if thread.id() != thread::current().id() {
                self.interrupted.store(true, Ordering::SeqCst);
                thread.unpark();
                self.sender.wake();
            }
        }
    }

    /// Submits one chunk of this actor to the pool.
    pub fn schedule(self: &Arc<Self>) -> Result<(), Error> {
        let cell = self.clone();
        self.group
            .pool()
            .execute(Box::new(move || cell.run()))
            .inspect_err(|e| error!("Can't schedule actor {}: {}", self.name, e))
    }

    /// Queues a counted letter and schedules the actor if it was idle. A letter that lands after
    /// the actor finished gets a chunk of its own, which rejects it.
    pub fn deliver(self: &Arc<Self>, letter: Letter<A>) -> Result<(), Error> {
        let pending = self.sender.push(letter);
        if pending == 1 || self.state.get().is_finished() {
            self.schedule()?;
        }
        Ok(())
    }

    /// One chunk: a single letter and everything it leads to.
    fn run(self: Arc<Self>) {
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.get().is_finished() {
            core.sweep(&self);
            return;
        }
        // The count moved before the letter was linked, so it is on its way.
        let letter = loop {
            if let Some(letter) = core.ctx.receiver.poll() {
                break letter;
            }
            thread::yield_now();
        };
        *self.current() = Some(thread::current());
        interruptible(self.interrupted.clone(), || core.dispatch(&self, letter));
        *self.current() = None;
        let finished = self.state.get().is_finished();
        drop(core);
        if !finished && self.sender.complete() > 0 {
            let _ = self.schedule();
        }
    }
}

impl<A: Actor> Core<A> {
    fn dispatch(&mut self, cell: &Arc<ActorCell<A>>, letter: Letter<A>) {
        if cell.state.get() == ActorState::Terminating {
            if let Letter::Message(mail) = letter {
                self.ctx.stash.push_back(mail);
            }
            self.finish(cell, Ending::Terminate);
            return;
        }
        match letter {
            Letter::Start => {
                if !self.ctx.started {
                    self.initialize(cell);
                }
            }
            Letter::Message(mail) => {
                if !self.ctx.started {
                    self.ctx.stash.push_back(mail);
                    self.initialize(cell);
                    return;
                }
                match self.ctx.reaction.take() {
                    Some(reaction) => {
                        self.disarm();
                        let step = self.invoke(reaction, mail);
                        self.apply(cell, step);
                    }
                    None => self.ctx.stash.push_back(mail),
                }
            }
            Letter::Stop => self.finish(cell, Ending::Stop),
            Letter::Terminate => self.finish(cell, Ending::Terminate),
            Letter::Timeout(generation) => {
                let current = self.ctx.reaction.is_some() && generation == self.ctx.generation;
                if !current {
                    debug!("Actor {} ignores a stale timeout.", cell.name);
                    return;
                }
                self.ctx.reaction = None;
                self.timer = None;
                let Core { actor, ctx, .. } = self;
                let step = guarded(|| actor.on_timeout(ctx));
                self.apply(cell, step);
            }
        }
    }

    fn initialize(&mut self, cell: &Arc<ActorCell<A>>) {
        self.ctx.started = true;
        debug!("Actor {} is started.", cell.name);
        let Core { actor, ctx, .. } = self;
        let step = guarded(|| actor.on_start(ctx)).and_then(|_| guarded(|| actor.act(ctx)));
        self.apply(cell, step);
    }

    fn invoke(&mut self, reaction: Reaction<A>, mail: Mail<A>) -> Step<A> {
        let Core { actor, ctx, .. } = self;
        guarded(|| (reaction.handler)(actor, mail, ctx))
    }

    /// Follows flows until the actor waits for a message or finishes.
    fn apply(&mut self, cell: &Arc<ActorCell<A>>, mut step: Step<A>) {
        loop {
            if let Some(ending) = self.ctx.control.take() {
                self.finish(cell, ending);
                return;
            }
            if cell.state.get() == ActorState::Terminating {
                self.finish(cell, Ending::Terminate);
                return;
            }
            let flow = match step {
                Ok(flow) => flow,
                Err(error) => {
                    let Core { actor, ctx, .. } = self;
                    let handled = guarded(|| {
                        actor.on_exception(error, ctx);
                        Ok(())
                    });
                    if let Err(error) = handled {
                        error!("Actor {} failed while handling a failure: {}", cell.name, error);
                    }
                    self.finish(cell, Ending::Terminate);
                    return;
                }
            };
            step = match flow {
                Flow::React(reaction) => match self.ctx.stash.pop_front() {
                    Some(mail) => self.invoke(reaction, mail),
                    None => {
                        self.arm(cell, reaction);
                        return;
                    }
                },
                Flow::Continue => match self.next_iteration() {
                    Some(step) => step,
                    None => {
                        self.finish(cell, Ending::Stop);
                        return;
                    }
                },
                Flow::Stop => {
                    self.finish(cell, Ending::Stop);
                    return;
                }
                Flow::Terminate => {
                    self.finish(cell, Ending::Terminate);
                    return;
                }
            };
        }
    }

    /// Runs the next loop iteration, or returns `None` when there is no loop or it is over.
    fn next_iteration(&mut self) -> Option<Step<A>> {
        let mut lp = self.ctx.body.take()?;
        let proceed = match &mut lp.condition {
            LoopCondition::Forever => Ok(true),
            LoopCondition::Times(remaining) => {
                let proceed = *remaining > 0;
                *remaining = remaining.saturating_sub(1);
                Ok(proceed)
            }
            LoopCondition::While(condition) => {
                let actor = &self.actor;
                guarded(|| Ok(condition(actor)))
            }
        };
        match proceed {
            Ok(true) => {}
            Ok(false) => return None,
            Err(error) => return Some(Err(error)),
        }
        let Core { actor, ctx, .. } = self;
        let step = guarded(|| (lp.body)(actor, ctx));
        // The body may have replaced itself with a new loop.
        if self.ctx.body.is_none() {
            self.ctx.body = Some(lp);
        }
        Some(step)
    }

    /// Withdraws the timeout of a reaction that no longer waits.
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Parks `reaction` until the next message, arming its timeout if it has one.
    fn arm(&mut self, cell: &Arc<ActorCell<A>>, reaction: Reaction<A>) {
        self.disarm();
        self.ctx.generation += 1;
        if let Some(timeout) = reaction.timeout {
            let generation = self.ctx.generation;
            let weak = Arc::downgrade(cell);
            let armed = cell.group().timer().schedule(
                timeout,
                Box::new(move || {
                    let Some(cell) = weak.upgrade() else {
                        return;
                    };
                    if cell.state.get().is_finished() {
                        debug!("Actor {} has finished, timeout discarded.", cell.name);
                        return;
                    }
                    let _ = cell.deliver(Letter::Timeout(generation));
                }),
            );
            match armed {
                Ok(timer) => self.timer = Some(timer),
                Err(error) => warn!("Actor {} can't arm its timeout: {}", cell.name, error),
            }
        }
        self.ctx.reaction = Some(reaction);
    }

    /// Ends the actor: final state, undelivered messages, stop hook, join promise.
    fn finish(&mut self, cell: &Arc<ActorCell<A>>, ending: Ending) {
        if cell.interrupted.swap(false, Ordering::SeqCst) && self.ctx.started {
            let Core { actor, ctx, .. } = self;
            let handled = guarded(|| {
                actor.on_interrupt(ctx);
                Ok(())
            });
            if let Err(error) = handled {
                error!("Actor {} failed while handling an interrupt: {}", cell.name, error);
            }
        }
        let state = cell.state.finish(ending);

        let mut undelivered: Vec<Mail<A>> = self.ctx.stash.drain(..).collect();
        undelivered.extend(
            self.ctx
                .receiver
                .drain()
                .into_iter()
                .filter_map(|letter| match letter {
                    Letter::Message(mail) => Some(mail),
                    _ => None,
                }),
        );
        self.ctx.reaction = None;
        self.disarm();
        self.ctx.body = None;
        self.ctx.senders.clear();
        for mail in &undelivered {
            mail.reject(Error::Finished(cell.name.clone()));
        }
        let actor = &mut self.actor;
        let stopped = guarded(|| {
            actor.after_stop(undelivered);
            Ok(())
        });
        if let Err(error) = stopped {
            error!("Actor {} failed in its stop hook: {}", cell.name, error);
        }

        cell.join.bind_safely(state);
        debug!("Actor {} is {}.", cell.name, state);
    }

    /// Rejects messages posted while the actor was finishing.
    fn sweep(&mut self, cell: &Arc<ActorCell<A>>) {
        let late: Vec<Mail<A>> = self
            .ctx
            .receiver
            .drain()
            .into_iter()
            .filter_map(|letter| match letter {
                Letter::Message(mail) => Some(mail),
                _ => None,
            })
            .collect();
        if late.is_empty() {
            return;
        }
        debug!("Actor {} rejects {} late messages.", cell.name, late.len());
        for mail in late {
            mail.reject(Error::Finished(cell.name.clone()));
        }
    }
}
