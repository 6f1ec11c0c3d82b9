// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Interruptible reads
//!
//! A thread can install an interrupt flag for the duration of a closure. Blocking reads made on
//! that thread (variables, queues, stream readers, select) check the flag every time they wake up
//! and fail with [`Error::Interrupted`](crate::Error::Interrupted) once it is raised. Whoever
//! raises the flag must also unpark the thread.
//!

use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

thread_local! {
    static INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Puts the previous flag back when the scope ends, even on panic.
struct Restore(Option<Arc<AtomicBool>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        let _ = INTERRUPT.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Runs `f` with `flag` as the interrupt flag of the current thread.
pub fn interruptible<R>(flag: Arc<AtomicBool>, f: impl FnOnce() -> R) -> R {
    let previous = INTERRUPT
        .try_with(|slot| slot.replace(Some(flag)))
        .unwrap_or_default();
    let _restore = Restore(previous);
    f()
}

/// True when the current thread runs under a raised interrupt flag.
pub fn is_interrupted() -> bool {
    INTERRUPT
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
        })
        .unwrap_or(false)
}
