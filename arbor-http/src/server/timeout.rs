//! The per-request timeout controller.
//!
//! Handlers and decorators may reschedule or disable the request timeout
//! while the request is running; the dispatcher races the handler against
//! [`RequestTimeout::expired`]. Listeners observe every change.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

type TimeoutListener = Box<dyn Fn(Option<Duration>) + Send + Sync>;

/// A reschedulable deadline for one request.
pub struct RequestTimeout {
    deadline: watch::Sender<Option<Instant>>,
    listeners: Mutex<Vec<TimeoutListener>>,
}

impl RequestTimeout {
    /// Creates a controller; `None` or a zero duration starts disabled.
    pub fn new(timeout: Option<Duration>) -> Self {
        let (deadline, _) = watch::channel(Self::deadline_for(timeout));
        Self {
            deadline,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn deadline_for(timeout: Option<Duration>) -> Option<Instant> {
        match timeout {
            Some(d) if !d.is_zero() => Some(Instant::now() + d),
            _ => None,
        }
    }

    /// Reschedules the deadline to `timeout` from now. Zero disables.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.reschedule(if timeout.is_zero() { None } else { Some(timeout) });
    }

    /// Disables the timeout entirely.
    pub fn clear_request_timeout(&self) {
        self.reschedule(None);
    }

    fn reschedule(&self, timeout: Option<Duration>) {
        let _ = self.deadline.send(Self::deadline_for(timeout));
        for listener in self.listeners.lock().iter() {
            listener(timeout);
        }
    }

    /// Registers a listener observing every change.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(Option<Duration>) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn is_enabled(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    /// Resolves once the current deadline passes. Never resolves while
    /// disabled; rescheduling mid-wait is observed.
    pub async fn expired(&self) {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                None => {
                    if rx.changed().await.is_err() {
                        // Controller dropped while disabled: never fires.
                        futures::future::pending::<()>().await;
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep_until(at).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
