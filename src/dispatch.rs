// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded background queues for work that must not block the caller.
//!
//! A [`Dispatcher`] owns one worker task that handles queued items in
//! submission order. When the queue is full new items are dropped and
//! counted; the caller never waits.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tiered_cache::dispatch::Dispatcher;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! let dispatcher = Dispatcher::spawn("demo", 16, move |n: usize| {
//!     let counter = counter.clone();
//!     async move { counter.fetch_add(n, Ordering::SeqCst); }
//! });
//!
//! assert!(dispatcher.try_dispatch(2));
//! assert!(dispatcher.try_dispatch(3));
//! dispatcher.flush().await;
//! assert_eq!(seen.load(Ordering::SeqCst), 5);
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Message<T> {
    Task(T),
    Barrier(oneshot::Sender<()>),
}

pub struct Dispatcher<T> {
    name: &'static str,
    tx: mpsc::Sender<Message<T>>,
    depth: Arc<AtomicUsize>,
    dropped: AtomicU64,
    worker: JoinHandle<()>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Start the worker. `handler` runs once per item, one at a time.
    pub fn spawn<F, Fut>(name: &'static str, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Message<T>>(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = depth.clone();

        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Task(item) => {
                        handler(item).await;
                        let remaining = worker_depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                        crate::metrics::set_dispatch_depth(name, remaining);
                    }
                    Message::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(queue = name, "Dispatcher worker stopped");
        });

        Self {
            name,
            tx,
            depth,
            dropped: AtomicU64::new(0),
            worker,
        }
    }

    /// Queue an item. Returns `false` if it was dropped.
    pub fn try_dispatch(&self, item: T) -> bool {
        // Count before sending so the worker's decrement cannot underflow
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        match self.tx.try_send(Message::Task(item)) {
            Ok(()) => {
                crate::metrics::set_dispatch_depth(self.name, depth);
                true
            }
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_dispatch_drop(self.name);
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(queue = self.name, "Dispatch queue full, dropping item");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        warn!(queue = self.name, "Dispatch worker gone, dropping item");
                    }
                }
                false
            }
        }
    }

    /// Wait until every item queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Barrier(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Items queued and not yet handled.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Stop the worker immediately, discarding queued items.
    pub fn abort(&self) {
        self.worker.abort();
    }
}
