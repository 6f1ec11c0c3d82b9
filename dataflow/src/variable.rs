// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dataflow variable
//!
//! A single-assignment promise. A `DataflowVariable` starts unbound and is bound exactly once;
//! every reader, whether it blocked a thread in [`DataflowVariable::get`] or registered a
//! callback through [`DataflowVariable::when_bound`], observes that first value forever.
//!
//! ## Waiter chain
//!
//! Parties that arrive before the value are linked into a singly-linked chain with a
//! compare-and-swap prepend. `bind` swaps the chain head for a terminal marker exactly once and
//! services every node it took: parked threads are unparked, callbacks are invoked on the binding
//! thread. A waiter whose prepend fails because the marker is already in place serves itself
//! inline, so nothing attaches after the swap.
//!
//! Waiters are released in the reverse order of their arrival. No ordering across waiters is
//! promised.
//!
//! A thread that stops waiting (timeout or interruption) claims its own node through a flag it
//! shares with the chain, then prunes: it detaches the whole chain, frees every claimed node and
//! links the survivors back in front of whatever arrived meanwhile. Whoever loses the claim race
//! against `bind` has been served and reads the value instead.
//!

use crate::{
    channel::{Listener, ReadChannel},
    interrupt::is_interrupted,
};

use tokio::sync::oneshot;
use tracing::error;

use std::{
    fmt::{self, Debug},
    panic::{AssertUnwindSafe, catch_unwind},
    ptr::{self, NonNull},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering},
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use crate::Error;

const NOT_INITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// Callback fired with a reference to the bound value.
type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// A party waiting for the value.
enum Waiter<T> {
    /// A thread parked in `get`.
    Thread(Thread),
    /// An asynchronous consumer.
    Callback(Callback<T>),
}

/// One cell of the waiter chain.
struct WaitNode<T> {
    waiter: Option<Waiter<T>>,
    /// Set by whoever gets to the node first: the binder servicing it or the waiter abandoning it.
    claimed: Arc<AtomicBool>,
    next: *mut WaitNode<T>,
}

impl<T> WaitNode<T> {
    fn new(waiter: Waiter<T>) -> Box<Self> {
        Box::new(Self {
            waiter: Some(waiter),
            claimed: Arc::new(AtomicBool::new(false)),
            next: ptr::null_mut(),
        })
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn service(&mut self, value: &T) {
        if !claim(&self.claimed) {
            return;
        }
        match self.waiter.take() {
            Some(Waiter::Thread(thread)) => thread.unpark(),
            Some(Waiter::Callback(callback)) => run_callback(callback, value),
            None => {}
        }
    }
}

/// Wins the node for the caller. False when the other side got there first.
fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn run_callback<T>(callback: Callback<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("A dataflow callback panicked while being notified!");
    }
}

/// Address stored in the chain head once the variable is bound. Never dereferenced.
fn bound_marker<T>() -> *mut WaitNode<T> {
    NonNull::dangling().as_ptr()
}

struct Inner<T> {
    state: AtomicU8,
    value: OnceLock<T>,
    waiting: AtomicPtr<WaitNode<T>>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_INITIALIZED),
            value: OnceLock::new(),
            waiting: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn value(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            self.value.get()
        } else {
            None
        }
    }

    /// Links a node into the chain. Hands the node back when the variable got bound meanwhile.
    fn attach(&self, node: Box<WaitNode<T>>) -> Result<(), Box<WaitNode<T>>> {
        let node = Box::into_raw(node);
        let mut head = self.waiting.load(Ordering::Acquire);
        loop {
            if head == bound_marker() {
                // SAFETY: `node` came from `Box::into_raw` above and was never published.
                return Err(unsafe { Box::from_raw(node) });
            }
            // SAFETY: the node is still exclusively ours until the CAS succeeds.
            unsafe { (*node).next = head };
            match self.waiting.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Frees the abandoned nodes of the chain.
    fn prune(&self) {
        let mut head = self.waiting.load(Ordering::Acquire);
        let mut chain = loop {
            if head.is_null() || head == bound_marker() {
                return;
            }
            match self.waiting.compare_exchange_weak(
                head,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(taken) => break taken,
                Err(actual) => head = actual,
            }
        };

        let mut first: *mut WaitNode<T> = ptr::null_mut();
        let mut last: *mut WaitNode<T> = ptr::null_mut();
        while !chain.is_null() {
            // SAFETY: the CAS above detached the chain, so this thread is its only owner.
            let node = unsafe { &mut *chain };
            let next = node.next;
            if node.is_claimed() {
                // SAFETY: published through `Box::into_raw` and owned here.
                drop(unsafe { Box::from_raw(chain) });
            } else {
                node.next = ptr::null_mut();
                if last.is_null() {
                    first = chain;
                } else {
                    // SAFETY: `last` is a survivor owned by this thread.
                    unsafe { (*last).next = chain };
                }
                last = chain;
            }
            chain = next;
        }
        if first.is_null() {
            return;
        }

        let mut head = self.waiting.load(Ordering::Acquire);
        loop {
            if head == bound_marker() {
                // Bound while detached: nobody else will see these nodes.
                let value = self.value.get();
                let mut chain = first;
                while !chain.is_null() {
                    // SAFETY: survivors are still owned by this thread.
                    let mut node = unsafe { Box::from_raw(chain) };
                    chain = node.next;
                    if let Some(value) = value {
                        node.service(value);
                    }
                }
                return;
            }
            // SAFETY: `last` is owned until the CAS publishes the survivors.
            unsafe { (*last).next = head };
            match self.waiting.compare_exchange_weak(
                head,
                first,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn bind(&self, value: T) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                NOT_INITIALIZED,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyBound);
        }
        let _ = self.value.set(value);
        self.state.store(INITIALIZED, Ordering::Release);

        let mut chain = self.waiting.swap(bound_marker(), Ordering::AcqRel);
        let Some(value) = self.value.get() else {
            return Ok(());
        };
        while !chain.is_null() {
            // SAFETY: every node in the chain was published by `attach` through
            // `Box::into_raw`, and the swap above made this thread its only owner.
            let mut node = unsafe { Box::from_raw(chain) };
            chain = node.next;
            node.service(value);
        }
        Ok(())
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut chain = *self.waiting.get_mut();
        if chain == bound_marker() {
            return;
        }
        while !chain.is_null() {
            // SAFETY: an unbound variable still owns every node of its chain.
            let node = unsafe { Box::from_raw(chain) };
            chain = node.next;
        }
    }
}

/// A single-assignment variable shared between threads, tasks and actors.
///
/// Cloning the handle shares the same slot. Values are handed out as clones, so `T` is usually a
/// cheap value or an `Arc`.
///
/// # Examples
///
/// ```ignore
/// use dataflow::DataflowVariable;
///
/// let variable = DataflowVariable::new();
/// let reader = variable.clone();
/// let handle = std::thread::spawn(move || reader.get());
/// variable.bind(42).unwrap();
/// assert_eq!(handle.join().unwrap(), Ok(42));
/// ```
pub struct DataflowVariable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> DataflowVariable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an unbound variable.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Creates a variable that is already bound to `value`.
    pub fn bound(value: T) -> Self {
        let variable = Self::new();
        let _ = variable.inner.bind(value);
        variable
    }

    /// Binds the value and releases every waiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyBound`] when the variable already holds a value. The first value
    /// is kept.
    pub fn bind(&self, value: T) -> Result<(), Error> {
        self.inner.bind(value)
    }

    /// Binds the value unless the variable is already bound. Returns whether this call bound it.
    pub fn bind_safely(&self, value: T) -> bool {
        self.inner.bind(value).is_ok()
    }

    /// True once a value is readable.
    pub fn is_bound(&self) -> bool {
        self.inner.value().is_some()
    }

    /// Non-blocking read.
    pub fn poll(&self) -> Option<T> {
        self.inner.value().cloned()
    }

    /// Blocks the calling thread until the variable is bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] when the thread runs under a raised interrupt flag (see
    /// [`interruptible`](crate::interruptible)) before the value arrives.
    pub fn get(&self) -> Result<T, Error> {
        self.wait_until(None)?.ok_or(Error::Interrupted)
    }

    /// Blocks until the variable is bound or `timeout` elapses. `Ok(None)` means the deadline
    /// passed first; the variable may still be bound later.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] like [`get`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, Error> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<Option<T>, Error> {
        if let Some(value) = self.poll() {
            return Ok(Some(value));
        }
        let node = WaitNode::new(Waiter::Thread(thread::current()));
        let claimed = node.claimed.clone();
        if self.inner.attach(node).is_err() {
            return Ok(self.poll());
        }
        loop {
            if let Some(value) = self.poll() {
                return Ok(Some(value));
            }
            let interrupted = is_interrupted();
            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if interrupted || expired {
                if claim(&claimed) {
                    self.inner.prune();
                    return if interrupted {
                        Err(Error::Interrupted)
                    } else {
                        Ok(None)
                    };
                }
                // Serviced by `bind`, the value is already in place.
                return Ok(self.poll());
            }
            match deadline {
                Some(deadline) => {
                    thread::park_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => thread::park(),
            }
        }
    }

    /// Registers `callback` to be invoked with the value once bound, without blocking.
    ///
    /// Callbacks registered before binding run on the thread that binds. A callback registered
    /// on a bound variable runs immediately on the calling thread.
    pub fn when_bound<F>(&self, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        if let Some(value) = self.poll() {
            callback(value);
            return;
        }
        let node = WaitNode::new(Waiter::Callback(Box::new(move |value: &T| {
            callback(value.clone())
        })));
        if let Err(mut node) = self.inner.attach(node) {
            if let Some(value) = self.inner.value() {
                node.service(value);
            }
        }
    }

    /// Derives a new variable bound to `f(value)` once this one is bound.
    pub fn then<U, F>(&self, f: F) -> DataflowVariable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let result = DataflowVariable::new();
        let target = result.clone();
        self.when_bound(move |value| {
            target.bind_safely(f(value));
        });
        result
    }

    /// Waits for the value without blocking an executor thread.
    pub async fn wait(&self) -> T {
        if let Some(value) = self.poll() {
            return value;
        }
        let (sender, receiver) = oneshot::channel();
        self.when_bound(move |value| {
            let _ = sender.send(value);
        });
        match receiver.await {
            Ok(value) => value,
            // The callback only disappears unfired together with the variable.
            Err(_) => futures::future::pending().await,
        }
    }
}

impl<T> Clone for DataflowVariable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for DataflowVariable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Debug for DataflowVariable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.value() {
            Some(value) => write!(f, "DataflowVariable({:?})", value),
            None => write!(f, "DataflowVariable(<unbound>)"),
        }
    }
}

impl<T> PartialEq for DataflowVariable<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> ReadChannel<T> for DataflowVariable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn poll(&self) -> Option<T> {
        DataflowVariable::poll(self)
    }

    fn get_val(&self) -> Result<Option<T>, Error> {
        self.get().map(Some)
    }

    fn when_value_available(&self, listener: Listener) {
        self.when_bound(move |_| listener());
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::sync::{Mutex, atomic::AtomicUsize};

    #[test]
    fn test_bind_once() {
        let variable = DataflowVariable::new();
        assert!(!variable.is_bound());
        variable.bind(1).unwrap();
        assert_eq!(variable.bind(2), Err(Error::AlreadyBound));
        assert!(!variable.bind_safely(3));
        assert_eq!(variable.get(), Ok(1));
        assert_eq!(variable.poll(), Some(1));
    }

    #[test]
    fn test_blocked_readers_are_released() {
        let variable = DataflowVariable::<String>::new();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let reader = variable.clone();
                thread::spawn(move || reader.get())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        variable.bind("done".to_owned()).unwrap();
        for reader in readers {
            assert_eq!(reader.join().unwrap().unwrap(), "done");
        }
    }

    #[test]
    fn test_get_timeout() {
        let variable = DataflowVariable::<u32>::new();
        assert_eq!(variable.get_timeout(Duration::from_millis(20)), Ok(None));
        variable.bind(7).unwrap();
        assert_eq!(variable.get_timeout(Duration::from_millis(20)), Ok(Some(7)));
    }

    #[test]
    fn test_callbacks_before_and_after_bind() {
        let variable = DataflowVariable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let early = seen.clone();
        variable.when_bound(move |value| early.lock().unwrap().push(("early", value)));
        assert!(seen.lock().unwrap().is_empty());

        variable.bind(5).unwrap();
        let late = seen.clone();
        variable.when_bound(move |value| late.lock().unwrap().push(("late", value)));

        assert_eq!(*seen.lock().unwrap(), vec![("early", 5), ("late", 5)]);
    }

    #[test]
    fn test_racing_binders_keep_first_value() {
        let variable = DataflowVariable::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let binders: Vec<_> = (0..16)
            .map(|i| {
                let variable = variable.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if variable.bind_safely(i) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for binder in binders {
            binder.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let value = variable.get().unwrap();
        assert_eq!(variable.get(), Ok(value));
    }

    #[test]
    fn test_callback_panic_does_not_stop_other_waiters() {
        let variable = DataflowVariable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = hits.clone();
        variable.when_bound(move |_: u8| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        variable.when_bound(|_| panic!("boom"));
        let last = hits.clone();
        variable.when_bound(move |_| {
            last.fetch_add(1, Ordering::SeqCst);
        });
        variable.bind(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_then_chains() {
        let variable = DataflowVariable::new();
        let doubled = variable.then(|value: i32| value * 2);
        variable.bind(21).unwrap();
        assert_eq!(doubled.get(), Ok(42));
    }

    #[test]
    fn test_drop_unbound_with_waiters() {
        let variable = DataflowVariable::<u8>::new();
        variable.when_bound(|_| {});
        variable.when_bound(|_| {});
        drop(variable);
    }

    /// Nodes in the chain of an unbound variable. Only meaningful while no thread is attaching.
    fn chain_len<T>(variable: &DataflowVariable<T>) -> usize {
        let mut chain = variable.inner.waiting.load(Ordering::Acquire);
        let mut len = 0;
        while !chain.is_null() && chain != bound_marker() {
            len += 1;
            // SAFETY: test threads are quiescent, nodes stay alive while linked.
            chain = unsafe { (*chain).next };
        }
        len
    }

    #[test]
    fn test_timed_out_waiters_leave_no_nodes() {
        let variable = DataflowVariable::<u32>::new();
        for _ in 0..1000 {
            assert_eq!(variable.get_timeout(Duration::from_micros(1)), Ok(None));
        }
        assert_eq!(chain_len(&variable), 0);

        variable.when_bound(|_| {});
        assert_eq!(variable.get_timeout(Duration::from_micros(1)), Ok(None));
        assert_eq!(chain_len(&variable), 1);
    }

    #[test]
    fn test_pruning_keeps_live_waiters() {
        let variable = DataflowVariable::<u32>::new();
        let reader = variable.clone();
        let blocked = thread::spawn(move || reader.get());
        let seen = Arc::new(AtomicUsize::new(0));
        let callback = seen.clone();
        variable.when_bound(move |value| {
            callback.fetch_add(value as usize, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));

        let timers: Vec<_> = (0..4)
            .map(|_| {
                let variable = variable.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(variable.get_timeout(Duration::from_micros(10)), Ok(None));
                    }
                })
            })
            .collect();
        for timer in timers {
            timer.join().unwrap();
        }
        assert_eq!(variable.get_timeout(Duration::from_micros(1)), Ok(None));
        assert_eq!(chain_len(&variable), 2);

        variable.bind(3).unwrap();
        assert_eq!(blocked.join().unwrap(), Ok(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_interrupted_get() {
        let variable = DataflowVariable::<u32>::new();
        let flag = Arc::new(AtomicBool::new(false));
        let (reader, raised) = (variable.clone(), flag.clone());
        let blocked = thread::spawn(move || crate::interruptible(raised, || reader.get()));
        thread::sleep(Duration::from_millis(50));

        flag.store(true, Ordering::SeqCst);
        blocked.thread().unpark();
        assert_eq!(blocked.join().unwrap(), Err(Error::Interrupted));
        assert_eq!(chain_len(&variable), 0);

        variable.bind(1).unwrap();
        assert_eq!(crate::interruptible(flag, || variable.get()), Ok(1));
    }

    #[tokio::test]
    async fn test_wait() {
        let variable = DataflowVariable::new();
        let writer = variable.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.bind(9u64).unwrap();
        });
        assert_eq!(variable.wait().await, 9);
    }
}
