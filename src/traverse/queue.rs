use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Multi-producer/multi-consumer work queue with batch draining.
///
/// `push` never blocks; `drain_all` atomically takes everything queued,
/// waiting if nothing is there yet. Workers take whole batches instead of
/// popping one item at a time, which keeps contention on the lock low.
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a batch. Pushes after `close` are discarded.
    pub fn push<I: IntoIterator<Item = T>>(&self, items: I) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.items.extend(items);
        }
        self.notify.notify_waiters();
    }

    /// Take every queued item at once. Blocks while the queue is empty;
    /// returns an empty batch once the queue is closed or the token is
    /// cancelled.
    pub async fn drain_all(&self, cancel: &CancellationToken) -> Vec<T> {
        loop {
            // Arm the notification before checking state so a concurrent
            // push cannot slip between the check and the wait.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if !state.items.is_empty() {
                    return state.items.drain(..).collect();
                }
                if state.closed {
                    return Vec::new();
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Vec::new(),
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_returns_whole_batch() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.push([1, 2, 3]);
        queue.push([4]);
        assert_eq!(queue.drain_all(&cancel).await, vec![1, 2, 3, 4]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_drain_blocks_until_push() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();

        let q = queue.clone();
        let pusher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            q.push([7]);
        });

        let got = queue.drain_all(&cancel).await;
        assert_eq!(got, vec![7]);
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let cancel = CancellationToken::new();

        let q = queue.clone();
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q.drain_all(&cancel).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap().is_empty());

        // After close, drains return immediately and pushes are dropped.
        queue.push([1]);
        assert!(queue.drain_all(&cancel).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let cancel = CancellationToken::new();

        let q = queue.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { q.drain_all(&c).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_and_consumers() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        let total = 1000u32;

        let mut producers = Vec::new();
        for p in 0..4 {
            let q = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..(total / 4) {
                    q.push([p * (total / 4) + i]);
                }
            }));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let q = queue.clone();
            let c = cancel.clone();
            let s = seen.clone();
            consumers.push(tokio::spawn(async move {
                loop {
                    let batch = q.drain_all(&c).await;
                    if batch.is_empty() {
                        return;
                    }
                    s.lock().unwrap().extend(batch);
                }
            }));
        }

        for p in producers {
            p.await.unwrap();
        }
        // Give consumers a chance to drain the tail, then shut down.
        while queue.len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        for c in consumers {
            c.await.unwrap();
        }

        let mut got = seen.lock().unwrap().clone();
        got.sort();
        let want: Vec<u32> = (0..total).collect();
        assert_eq!(got, want);
    }
}
