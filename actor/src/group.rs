// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor group
//!
//! The `group` module provides the [`ActorGroup`] type. A group owns the pool that runs its
//! actors and the timer that fires their reaction timeouts, and is the factory for new actors.
//! A process-wide default group is built lazily from a [`GroupConfig`].
//!

use crate::{
    Error,
    actor::{Actor, ActorContext, ActorRef, Flow, Step},
    message::{Message, Response},
    pool::{Pool, Timer, TokioPool, TokioTimer},
    runner::ActorCell,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use std::{
    fmt,
    sync::{Arc, OnceLock},
    thread,
};

/// Environment variable read by [`GroupConfig::from_env`].
pub const POOL_SIZE_VAR: &str = "BRAID_POOL_SIZE";

/// Settings of an actor group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Number of actor chunks that may run at once.
    pub pool_size: usize,
    /// Name of the group, also given to its threads.
    pub name: String,
}

impl Default for GroupConfig {
    /// One thread per core, plus one.
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            pool_size: cores + 1,
            name: "braid-actor".to_owned(),
        }
    }
}

impl GroupConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Defaults, with the pool size taken from `BRAID_POOL_SIZE` when it holds a positive
    /// integer.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(POOL_SIZE_VAR) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.with_pool_size(size),
                _ => {
                    warn!("Ignoring invalid {} value: {}", POOL_SIZE_VAR, value);
                    config
                }
            },
            Err(_) => config,
        }
    }
}

struct GroupInner {
    name: String,
    pool: Arc<dyn Pool>,
    timer: Arc<dyn Timer>,
}

/// A set of actors sharing one pool and one timer. Cheap to clone.
#[derive(Clone)]
pub struct ActorGroup {
    inner: Arc<GroupInner>,
}

impl ActorGroup {
    /// Creates a group backed by a dedicated tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if the runtime cannot be built.
    pub fn new(config: GroupConfig) -> Result<Self, Error> {
        let pool = TokioPool::new(config.pool_size, &config.name)?;
        let timer = TokioTimer::new(pool.handle().clone());
        Ok(Self::with_pool(&config.name, Arc::new(pool), Arc::new(timer)))
    }

    /// Creates a group on a caller-provided pool and timer.
    pub fn with_pool(name: &str, pool: Arc<dyn Pool>, timer: Arc<dyn Timer>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.to_owned(),
                pool,
                timer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.inner.pool
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.inner.timer
    }

    /// Creates an actor bound to this group without starting it.
    pub fn create<A: Actor>(&self, name: &str, actor: A) -> ActorRef<A> {
        ActorRef::from_cell(ActorCell::new(name, actor, self.clone()))
    }

    /// Creates and starts an actor.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool rejects the actor.
    pub fn actor<A: Actor>(&self, name: &str, actor: A) -> Result<ActorRef<A>, Error> {
        let actor = self.create(name, actor);
        actor.start()?;
        Ok(actor)
    }

    /// Starts an actor that answers every message with `body(message)`.
    pub fn reactor<M, R, F>(&self, name: &str, body: F) -> Result<ActorRef<Reactor<M, R>>, Error>
    where
        M: Message,
        R: Response,
        F: FnMut(M) -> R + Send + 'static,
    {
        self.actor(name, Reactor::new(body))
    }

    /// Stops the pool and the timer. Actors that still hold work never finish.
    pub fn shutdown(&self) {
        debug!("Shutting down actor group {}.", self.inner.name);
        self.inner.timer.shutdown();
        self.inner.pool.shutdown();
    }
}

impl fmt::Debug for ActorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorGroup")
            .field("name", &self.inner.name)
            .field("pool_size", &self.inner.pool.size())
            .finish()
    }
}

/// Stateless actor that answers each message with the result of a function.
pub struct Reactor<M, R> {
    body: Box<dyn FnMut(M) -> R + Send + 'static>,
}

impl<M, R> Reactor<M, R> {
    pub fn new<F>(body: F) -> Self
    where
        F: FnMut(M) -> R + Send + 'static,
    {
        Self {
            body: Box::new(body),
        }
    }
}

impl<M: Message, R: Response> Actor for Reactor<M, R> {
    type Message = M;
    type Reply = R;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.loop_forever(|_, ctx| {
            Ok(ctx.react(|reactor: &mut Reactor<M, R>, message, ctx| {
                let reply = (reactor.body)(message);
                ctx.reply_if_exists(reply);
                Ok(Flow::Continue)
            }))
        }))
    }
}

static DEFAULT_CONFIG: OnceLock<GroupConfig> = OnceLock::new();
static DEFAULT_GROUP: OnceLock<Result<ActorGroup, Error>> = OnceLock::new();

/// Sets the configuration of the default group.
///
/// # Errors
///
/// Returns [`Error::IllegalArgument`] when the default group was already configured or already
/// built.
pub fn configure_default_group(config: GroupConfig) -> Result<(), Error> {
    if DEFAULT_GROUP.get().is_some() {
        return Err(Error::IllegalArgument(
            "the default group is already running".to_owned(),
        ));
    }
    DEFAULT_CONFIG.set(config).map_err(|_| {
        Error::IllegalArgument("the default group is already configured".to_owned())
    })
}

/// The process-wide default group, built on first use from the configured settings or from
/// [`GroupConfig::from_env`].
///
/// # Errors
///
/// Returns the error the group failed to build with.
pub fn default_group() -> Result<ActorGroup, Error> {
    DEFAULT_GROUP
        .get_or_init(|| {
            let config = DEFAULT_CONFIG.get_or_init(GroupConfig::from_env).clone();
            debug!(
                "Building default actor group {} with {} threads.",
                config.name, config.pool_size
            );
            ActorGroup::new(config)
        })
        .clone()
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::ActorState;

    use tracing_test::traced_test;

    #[test]
    fn test_config_builders() {
        let config = GroupConfig::default().with_pool_size(3).with_name("workers");
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.name, "workers");
        assert!(GroupConfig::default().pool_size >= 2);
    }

    #[test]
    fn test_reactor_answers_each_message() {
        let group = ActorGroup::new(GroupConfig::default().with_pool_size(2)).unwrap();
        let doubler = group.reactor("doubler", |value: u32| value * 2).unwrap();
        for value in 0..10 {
            assert_eq!(doubler.send_and_wait(value).unwrap(), value * 2);
        }
        doubler.stop().unwrap();
        assert_eq!(doubler.join(), Ok(ActorState::Stopped));
    }

    #[test]
    #[traced_test]
    fn test_shutdown_rejects_new_actors() {
        let group = ActorGroup::new(GroupConfig::default().with_name("closing")).unwrap();
        group.shutdown();
        assert!(logs_contain("Shutting down actor group closing."));
        let echo = group.create("late", Reactor::new(|value: u8| value));
        assert_eq!(echo.start(), Err(Error::PoolShutdown));
    }

    #[test]
    fn test_debug_shows_name_and_size() {
        let group = ActorGroup::new(GroupConfig::default().with_pool_size(4).with_name("dbg"))
            .unwrap();
        assert_eq!(
            format!("{:?}", group),
            "ActorGroup { name: \"dbg\", pool_size: 4 }"
        );
    }
}
