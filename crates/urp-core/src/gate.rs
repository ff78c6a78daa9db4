//! Backpressure gating over an arbitrary async byte sink.
//!
//! A [`BackpressureGate`] wraps the one write primitive a transport exposes.
//! Callers go through [`BackpressureGate::send`], which suspends while the
//! gate is paused, fails once the gate is shut down, and otherwise forwards
//! to the underlying sink. Sends are fully serialized, which gives the
//! stronger-than-required guarantee that writes resume in the exact order
//! they were issued.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A raw async write: take ownership of the bytes, attempt delivery.
pub type WriteFn =
    Box<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
enum GateState {
    Resumed,
    Paused,
    ShutDown(Arc<str>),
}

/// The gate failed to send because the transport is gone. One-way: once
/// shut down, a gate never returns to `Resumed` or `Paused`.
#[derive(Debug, Clone)]
pub struct GateError {
    pub cause: Arc<str>,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport shut down: {}", self.cause)
    }
}

impl std::error::Error for GateError {}

pub struct BackpressureGate {
    write: WriteFn,
    state: Mutex<GateState>,
    notify: Notify,
    // Serializes `send` so that writes actually reach the sink in call order,
    // even if paused/resumed toggles mid-flight.
    order: tokio::sync::Mutex<()>,
}

impl BackpressureGate {
    pub fn new(write: WriteFn) -> Self {
        BackpressureGate {
            write,
            state: Mutex::new(GateState::Resumed),
            notify: Notify::new(),
            order: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait until the gate is writable, then forward `bytes` to the sink.
    pub async fn send(&self, bytes: Bytes) -> Result<(), GateError> {
        let _ticket = self.order.lock().await;
        self.wait_writable().await?;
        (self.write)(bytes)
            .await
            .map_err(|e| self.shutdown(format!("write failed: {e}")))?;
        Ok(())
    }

    async fn wait_writable(&self) -> Result<(), GateError> {
        loop {
            let notified = self.notify.notified();
            match &*self.state.lock() {
                GateState::Resumed => return Ok(()),
                GateState::ShutDown(cause) => {
                    return Err(GateError {
                        cause: cause.clone(),
                    })
                }
                GateState::Paused => {}
            }
            notified.await;
        }
    }

    /// Suspend further sends. No-op once shut down.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if matches!(*state, GateState::Resumed) {
            *state = GateState::Paused;
        }
    }

    /// Release sends queued behind a pause. No-op once shut down.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if matches!(*state, GateState::Paused) {
            *state = GateState::Resumed;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Permanently disable the gate; every waiting and future `send` fails
    /// with `cause`. Returns `cause` as a `GateError` for convenient chaining
    /// from call sites that both shut down and need to report the error.
    pub fn shutdown(&self, cause: impl Into<Arc<str>>) -> GateError {
        let cause = cause.into();
        let mut state = self.state.lock();
        if !matches!(*state, GateState::ShutDown(_)) {
            *state = GateState::ShutDown(cause.clone());
        }
        drop(state);
        self.notify.notify_waiters();
        GateError { cause }
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(&*self.state.lock(), GateState::ShutDown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_writer(count: Arc<AtomicUsize>) -> WriteFn {
        Box::new(move |_bytes| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn send_goes_straight_through_when_resumed() {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = BackpressureGate::new(counting_writer(count.clone()));
        gate.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paused_send_waits_for_resume() {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(BackpressureGate::new(counting_writer(count.clone())));
        gate.pause();

        let gate2 = gate.clone();
        let sent = tokio::spawn(async move { gate2.send(Bytes::from_static(b"hi")).await });

        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "must not write while paused");

        gate.resume();
        sent.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_future_sends() {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(BackpressureGate::new(counting_writer(count.clone())));
        gate.pause();

        let gate2 = gate.clone();
        let pending = tokio::spawn(async move { gate2.send(Bytes::from_static(b"hi")).await });
        tokio::task::yield_now().await;

        gate.shutdown("peer hung up");
        assert!(pending.await.unwrap().is_err());

        let err = gate.send(Bytes::from_static(b"bye")).await.unwrap_err();
        assert_eq!(&*err.cause, "peer hung up");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_after_shutdown_is_a_no_op() {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = BackpressureGate::new(counting_writer(count));
        gate.shutdown("bye");
        gate.resume();
        assert!(gate.is_shut_down());
    }
}
