//! Per-stream cancellation and frame delivery.
//!
//! Every open streaming call owns a `StreamContext`. It is cancelled when the
//! peer goes away or the server shuts down, and every wait inside a session
//! observes it.

use tokio::sync::{mpsc, watch};
use tonic::Status;

/// Cancellation signal scoped to one streaming call (or to the process, for
/// background loops).
#[derive(Debug, Clone)]
pub struct StreamContext {
    done: watch::Receiver<bool>,
}

/// Handle that cancels the paired `StreamContext`.
#[derive(Debug)]
pub struct StreamCanceller {
    tx: watch::Sender<bool>,
}

impl StreamCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl StreamContext {
    pub fn new() -> (StreamCanceller, Self) {
        let (tx, rx) = watch::channel(false);
        (StreamCanceller { tx }, Self { done: rx })
    }

    /// Wrap an existing shutdown flag, e.g. the process-wide signal channel.
    pub fn from_signal(done: watch::Receiver<bool>) -> Self {
        Self { done }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the context is cancelled. Never resolves if the
    /// canceller is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.done.clone();
        if rx.wait_for(|&v| v).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Why a frame could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("stream cancelled")]
    Cancelled,

    #[error("peer closed the stream")]
    Closed,
}

/// Sending half of a server stream. Sends wait for room in the channel but
/// give up as soon as the stream is cancelled.
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: mpsc::Sender<Result<T, Status>>,
    ctx: StreamContext,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: Send> StreamSender<T> {
    pub fn new(tx: mpsc::Sender<Result<T, Status>>, ctx: StreamContext) -> Self {
        Self { tx, ctx }
    }

    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    pub async fn send(&self, item: T) -> Result<(), SendError> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(SendError::Cancelled),
            res = self.tx.send(Ok(item)) => res.map_err(|_| SendError::Closed),
        }
    }

    /// Deliver `status` as the final item of the stream.
    pub async fn send_error(&self, status: Status) -> Result<(), SendError> {
        self.tx.send(Err(status)).await.map_err(|_| SendError::Closed)
    }
}
