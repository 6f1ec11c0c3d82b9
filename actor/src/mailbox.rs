// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailbox
//!
//! Lock-free multi-producer, single-consumer queue used as an actor's mailbox.
//!
//! Producers prepend nodes onto a shared input stack with compare-and-swap. The consumer owns a
//! private output list; when it runs dry the consumer takes the whole input stack in one swap and
//! relinks it in reverse, so letters come out in the order they were linked. A counter of pending
//! letters tells producers when an idle actor must be scheduled, and tells the running task
//! whether to resubmit itself once it is done.
//!
//! A letter is counted before it is linked. The counter therefore never drops below the number of
//! letters a consumer can see, and a positive count promises a letter even if its producer has
//! not linked it yet.
//!

use std::{
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, Thread},
    time::Instant,
};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

struct Shared<T> {
    input: AtomicPtr<Node<T>>,
    count: AtomicUsize,
    parked: AtomicBool,
    waiting: Mutex<Option<Thread>>,
    _letters: PhantomData<T>,
}

// The raw pointers are only dereferenced by the producer that owns a node before linking it,
// and by the single consumer after unlinking it.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Detaches the whole input stack, newest node first.
    fn take_input(&self) -> *mut Node<T> {
        self.input.swap(ptr::null_mut(), Ordering::SeqCst)
    }

    fn unpark_consumer(&self) {
        if self.parked.load(Ordering::SeqCst) {
            let waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(thread) = waiting.as_ref() {
                thread.unpark();
            }
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        free_chain(self.take_input());
    }
}

fn free_chain<T>(mut node: *mut Node<T>) {
    while !node.is_null() {
        // SAFETY: every node in a detached chain came from `Box::into_raw` and is owned here.
        let boxed = unsafe { Box::from_raw(node) };
        node = boxed.next;
    }
}

/// Creates a mailbox. The pending counter starts at `initial`.
pub(crate) fn mailbox<T>(initial: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(Shared {
        input: AtomicPtr::new(ptr::null_mut()),
        count: AtomicUsize::new(initial),
        parked: AtomicBool::new(false),
        waiting: Mutex::new(None),
        _letters: PhantomData,
    });
    (
        MailboxSender {
            shared: shared.clone(),
        },
        MailboxReceiver {
            shared,
            output: ptr::null_mut(),
        },
    )
}

/// Producer side of a mailbox. Cheap to clone, usable from any thread.
pub(crate) struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxSender<T> {
    fn link(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.shared.input.load(Ordering::Relaxed);
        loop {
            // SAFETY: the node is not reachable by anyone else until the exchange succeeds.
            unsafe { (*node).next = head };
            match self.shared.input.compare_exchange_weak(
                head,
                node,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Counts `value` and links it. Returns the pending count including this letter; `1` means
    /// the consumer was idle and must be scheduled.
    pub fn push(&self, value: T) -> usize {
        let count = self.shared.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.link(value);
        self.shared.unpark_consumer();
        count
    }

    /// Links `value` without counting it, for a letter already accounted for.
    pub fn push_uncounted(&self, value: T) {
        self.link(value);
        self.shared.unpark_consumer();
    }

    /// Marks one letter as fully processed. Returns how many are still pending.
    pub fn complete(&self) -> usize {
        self.shared.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Wakes the consumer if it is parked in [`MailboxReceiver::take`].
    pub fn wake(&self) {
        self.shared.unpark_consumer();
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Consumer side of a mailbox. Only the thread currently running the actor touches it.
pub(crate) struct MailboxReceiver<T> {
    shared: Arc<Shared<T>>,
    output: *mut Node<T>,
}

// The output list is owned by the receiver and moves with it.
unsafe impl<T: Send> Send for MailboxReceiver<T> {}

impl<T> MailboxReceiver<T> {
    /// Takes the oldest letter without blocking and without touching the counter.
    pub fn poll(&mut self) -> Option<T> {
        if self.output.is_null() {
            self.refill();
        }
        if self.output.is_null() {
            return None;
        }
        // SAFETY: nodes on the output list are owned by this receiver.
        let node = unsafe { Box::from_raw(self.output) };
        self.output = node.next;
        Some(node.value)
    }

    /// Reverses the detached input stack onto the output list.
    fn refill(&mut self) {
        let mut node = self.shared.take_input();
        let mut reversed = ptr::null_mut();
        while !node.is_null() {
            // SAFETY: the detached chain is no longer visible to producers.
            unsafe {
                let next = (*node).next;
                (*node).next = reversed;
                reversed = node;
                node = next;
            }
        }
        self.output = reversed;
    }

    /// Blocks until a letter arrives, the deadline passes or `cancelled` turns true. A letter
    /// taken here is counted as processed.
    pub fn take<F>(&mut self, deadline: Option<Instant>, cancelled: F) -> Option<T>
    where
        F: Fn() -> bool,
    {
        loop {
            if let Some(value) = self.poll() {
                self.shared.count.fetch_sub(1, Ordering::AcqRel);
                return Some(value);
            }
            if cancelled() {
                return None;
            }
            {
                let mut waiting = self
                    .shared
                    .waiting
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *waiting = Some(thread::current());
            }
            self.shared.parked.store(true, Ordering::SeqCst);
            let ready = !self.shared.input.load(Ordering::SeqCst).is_null() || cancelled();
            if !ready {
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            self.shared.parked.store(false, Ordering::SeqCst);
                            return None;
                        }
                        thread::park_timeout(deadline - now);
                    }
                    None => thread::park(),
                }
            }
            self.shared.parked.store(false, Ordering::SeqCst);
            if deadline.is_some_and(|deadline| Instant::now() >= deadline)
                && self.shared.input.load(Ordering::SeqCst).is_null()
            {
                return None;
            }
        }
    }

    /// Takes every letter still queued, without touching the counter.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.poll()).collect()
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        free_chain(self.output);
    }
}
