//! Fan out calls and gather replies under a deadline.
//!
//! Each call runs on its own task. Replies land on a channel in completion
//! order. Closing (or dropping) the [`Multicast`] signals every still-running
//! call to stop; their replies, if any, are discarded.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub struct Multicast<K, T> {
    rx: mpsc::UnboundedReceiver<(K, T)>,
    closed: watch::Sender<bool>,
    pending: usize,
}

impl<K, T> Multicast<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    pub fn spawn<I, F>(calls: I) -> Self
    where
        I: IntoIterator<Item = (K, F)>,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let mut pending = 0;

        for (key, call) in calls {
            let tx = tx.clone();
            let mut closed_rx = closed.subscribe();
            pending += 1;
            tokio::spawn(async move {
                tokio::select! {
                    reply = call => {
                        let _ = tx.send((key, reply));
                    }
                    _ = closed_rx.changed() => {}
                }
            });
        }

        Self { rx, closed, pending }
    }

    /// Calls that have neither replied nor been abandoned.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Next reply, or `None` on timeout or when nothing is outstanding.
    pub async fn wait_one(&mut self, timeout: Duration) -> Option<(K, T)> {
        if self.pending == 0 {
            return None;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(reply)) => {
                self.pending -= 1;
                Some(reply)
            }
            Ok(None) => {
                // Every sender is gone; the remaining calls died.
                self.pending = 0;
                None
            }
            Err(_) => None,
        }
    }

    /// Replies that arrive before `timeout`, in arrival order.
    pub async fn wait_all(&mut self, timeout: Duration) -> Vec<(K, T)> {
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(reply)) => {
                    self.pending -= 1;
                    replies.push(reply);
                }
                Ok(None) => {
                    self.pending = 0;
                    break;
                }
                Err(_) => break,
            }
        }
        replies
    }

    /// Stops outstanding calls and drops anything they might still send.
    pub fn close(&mut self) {
        self.closed.send_replace(true);
        self.rx.close();
        self.pending = 0;
    }
}

impl<K, T> Drop for Multicast<K, T> {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}
