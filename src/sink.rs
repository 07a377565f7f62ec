//! Downstream delivery of fetched transactions.
//!
//! The coordinator hands every non-empty batch to a [`TransactionSink`]
//! before it advances the watermark. A sink that returns an error makes the
//! cycle fail, and the same transactions are offered again on the next one.
//!
//! [`channel`] builds the common case: a [`ChannelSink`] feeding a
//! [`TransactionStream`] that consumers poll as a `futures::Stream`.
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let (sink, mut stream) = spitetrack::sink::channel();
//! // ... spawn a coordinator with `sink` ...
//! while let Some(batch) = stream.next().await {
//!     for tx in batch {
//!         println!("{} wrote {} changes at {}", tx.author, tx.changes.len(), tx.timestamp);
//!     }
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::Transaction;

/// Receives batches of transactions, in timestamp order.
pub trait TransactionSink: Send + Sync {
    /// Accepts one batch. Returning an error asks for redelivery.
    fn deliver(&self, batch: &[Transaction]) -> Result<()>;
}

/// Discards everything. For authors that only write and clean.
impl TransactionSink for () {
    fn deliver(&self, _batch: &[Transaction]) -> Result<()> {
        Ok(())
    }
}

/// Creates a connected sink/stream pair.
pub fn channel() -> (ChannelSink, TransactionStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, TransactionStream { rx })
}

/// Pushes each batch into a tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<Transaction>>,
}

impl TransactionSink for ChannelSink {
    fn deliver(&self, batch: &[Transaction]) -> Result<()> {
        self.tx
            .send(batch.to_vec())
            .map_err(|_| Error::DeliveryFailed("transaction stream was dropped".to_string()))
    }
}

/// The receiving end of a [`ChannelSink`].
///
/// # Rust Pattern: Stream
///
/// Implements `futures::Stream`, so consumers can use `StreamExt`
/// combinators or `while let Some(batch) = stream.next().await`. The stream
/// ends when every sender (i.e. every coordinator holding the sink) is gone.
pub struct TransactionStream {
    rx: mpsc::UnboundedReceiver<Vec<Transaction>>,
}

impl TransactionStream {
    /// Waits for the next batch.
    pub async fn recv(&mut self) -> Option<Vec<Transaction>> {
        self.rx.recv().await
    }

    /// Returns a batch if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Vec<Transaction>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for TransactionStream {
    type Item = Vec<Transaction>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================
