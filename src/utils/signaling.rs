//! A minimalist, single-threaded observer.
//!
//! A [`Signaler`] broadcasts events of one type to every callback registered on it.
//! Registering a callback returns a [`SignalToken`], the callback stays registered for as long
//! as this token is alive.
//!
//! Sending an event from inside a callback is allowed: the event is queued and delivered once
//! the current one has been handed to every callback. Callbacks registered while an event is
//! being delivered only receive the following events.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

type Callback<S> = RefCell<dyn FnMut(&S)>;

struct SignalInner<S> {
    callbacks: RefCell<Vec<Weak<Callback<S>>>>,
    pending_callbacks: RefCell<Vec<Weak<Callback<S>>>>,
    pending_events: RefCell<VecDeque<S>>,
    sending: Cell<bool>,
}

/// An event broadcaster
pub struct Signaler<S> {
    inner: Rc<SignalInner<S>>,
}

impl<S> fmt::Debug for Signaler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signaler")
            .field("callbacks", &self.inner.callbacks.borrow().len())
            .field("sending", &self.inner.sending.get())
            .finish()
    }
}

impl<S> Clone for Signaler<S> {
    fn clone(&self) -> Signaler<S> {
        Signaler {
            inner: self.inner.clone(),
        }
    }
}

impl<S: 'static> Default for Signaler<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Signaler<S> {
    /// Create a new signaler with no registered callbacks
    pub fn new() -> Signaler<S> {
        Signaler {
            inner: Rc::new(SignalInner {
                callbacks: RefCell::new(Vec::new()),
                pending_callbacks: RefCell::new(Vec::new()),
                pending_events: RefCell::new(VecDeque::new()),
                sending: Cell::new(false),
            }),
        }
    }

    /// Register a new callback to this signaler
    ///
    /// The callback is removed as soon as the returned [`SignalToken`] is dropped.
    #[must_use]
    pub fn register<F: FnMut(&S) + 'static>(&self, f: F) -> SignalToken {
        let rc = Rc::new(RefCell::new(f));
        let callback: Rc<Callback<S>> = rc.clone();
        let weak = Rc::downgrade(&callback);
        if self.inner.sending.get() {
            self.inner.pending_callbacks.borrow_mut().push(weak);
        } else {
            self.inner.callbacks.borrow_mut().push(weak);
        }
        SignalToken { _signal: rc }
    }

    /// Signal the callbacks
    pub fn signal(&self, event: S) {
        self.inner.pending_events.borrow_mut().push_back(event);
        if self.inner.sending.replace(true) {
            // the outer invocation will deliver it
            return;
        }

        loop {
            let next = self.inner.pending_events.borrow_mut().pop_front();
            let Some(event) = next else {
                break;
            };

            let callbacks = {
                let mut callbacks = self.inner.callbacks.borrow_mut();
                callbacks.retain(|weak| weak.strong_count() > 0);
                callbacks.clone()
            };
            for callback in callbacks.iter().filter_map(Weak::upgrade) {
                match callback.try_borrow_mut() {
                    Ok(mut callback) => callback(&event),
                    Err(_) => tracing::warn!("Skipping reentrant signal callback"),
                }
            }

            let mut pending = self.inner.pending_callbacks.borrow_mut();
            self.inner.callbacks.borrow_mut().append(&mut pending);
        }

        self.inner.sending.set(false);
    }

    /// Number of currently registered callbacks
    pub fn callback_count(&self) -> usize {
        self.inner
            .callbacks
            .borrow()
            .iter()
            .chain(self.inner.pending_callbacks.borrow().iter())
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// A token associated with a callback registered to a [`Signaler`]
///
/// Dropping it unregisters the callback.
pub struct SignalToken {
    _signal: Rc<dyn Any>,
}

impl fmt::Debug for SignalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalToken").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_token_unregisters() {
        let signaler = Signaler::<u32>::new();
        let seen = Rc::new(Cell::new(0));

        let seen2 = seen.clone();
        let token = signaler.register(move |v| seen2.set(seen2.get() + *v));
        signaler.signal(3);
        drop(token);
        signaler.signal(4);

        assert_eq!(seen.get(), 3);
        assert_eq!(signaler.callback_count(), 0);
    }

    #[test]
    fn reentrant_signal_is_queued() {
        let signaler = Signaler::<u32>::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order2 = order.clone();
        let inner = signaler.clone();
        let _token = signaler.register(move |v| {
            order2.borrow_mut().push(*v);
            if *v == 1 {
                inner.signal(2);
                order2.borrow_mut().push(10);
            }
        });
        signaler.signal(1);

        assert_eq!(*order.borrow(), vec![1, 10, 2]);
    }
}
