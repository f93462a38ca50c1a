//! Registrable event callbacks for "writable", "readable" and "closed".

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// A channel event handler. Receives the channel the event fired on.
pub type ChannelListener<C> = Arc<dyn Fn(&C) + Send + Sync>;

/// A slot holding at most one listener for one kind of channel event.
///
/// Setting a new listener replaces the previous one.
pub struct ListenerSetter<C: ?Sized> {
    slot: Mutex<Option<ChannelListener<C>>>,
}

impl<C: ?Sized> ListenerSetter<C> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Register `listener`, replacing any previous one.
    pub fn set<F>(&self, listener: F)
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        *self.slot.lock() = Some(Arc::new(listener));
    }

    /// Register or clear a shared listener.
    pub fn set_listener(&self, listener: Option<ChannelListener<C>>) {
        *self.slot.lock() = listener;
    }

    /// Currently registered listener.
    pub fn get(&self) -> Option<ChannelListener<C>> {
        self.slot.lock().clone()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Invoke the registered listener (if any) for `channel`.
    ///
    /// The slot lock is released before the listener runs, so listeners may
    /// re-register themselves. Returns `true` if a listener ran to completion.
    pub fn invoke(&self, channel: &C) -> bool {
        let listener = self.get();
        invoke_listener(channel, listener.as_ref())
    }
}

impl<C: ?Sized> Default for ListenerSetter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> fmt::Debug for ListenerSetter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSetter")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Run `listener` against `channel`, containing panics.
///
/// A panicking listener is logged and reported as not run; it never unwinds
/// into the I/O path that fired the event.
pub fn invoke_listener<C: ?Sized>(channel: &C, listener: Option<&ChannelListener<C>>) -> bool {
    let Some(listener) = listener else {
        return false;
    };
    match catch_unwind(AssertUnwindSafe(|| listener(channel))) {
        Ok(()) => true,
        Err(_) => {
            warn!("channel listener panicked");
            false
        }
    }
}
