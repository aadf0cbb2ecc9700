//! Keyed, latest-value-wins channel.
//!
//! Many senders, one receiver. Sending to a key that is already pending
//! replaces the pending value; the receiver always takes the whole pending
//! map at once. Memory is bounded by the number of distinct keys, no
//! matter how fast senders write.
//!
//! ```text
//!  send(a=1) send(b=2) send(a=3)        recv()
//!  ────────────────────────────────►  {a: 3, b: 2}
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// The receiver has been dropped or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("coalescing channel closed")]
pub struct Closed;

struct State<K, V> {
    pending: BTreeMap<K, V>,
    senders: usize,
    receiver_open: bool,
    next_seq: u64,
    replaced: u64,
}

struct Shared<K, V> {
    state: Mutex<State<K, V>>,
    notify: Notify,
}

/// Creates a coalescing channel.
#[must_use]
pub fn channel<K: Ord, V>() -> (CoalescingSender<K, V>, CoalescingReceiver<K, V>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            pending: BTreeMap::new(),
            senders: 1,
            receiver_open: true,
            next_seq: 0,
            replaced: 0,
        }),
        notify: Notify::new(),
    });
    (
        CoalescingSender {
            shared: Arc::clone(&shared),
        },
        CoalescingReceiver { shared },
    )
}

/// Sending half. Cheap to clone.
pub struct CoalescingSender<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Ord, V> CoalescingSender<K, V> {
    /// Stores `value` under `key`, replacing any pending value.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once the receiver is gone.
    pub fn send(&self, key: K, value: V) -> Result<u64, Closed> {
        self.send_with(key, |_| value)
    }

    /// Like [`send`](Self::send), building the value from the sequence
    /// number assigned to this send.
    ///
    /// Sequence numbers increase strictly per channel.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once the receiver is gone.
    pub fn send_with(&self, key: K, build: impl FnOnce(u64) -> V) -> Result<u64, Closed> {
        let seq = {
            let mut state = self.shared.state.lock();
            if !state.receiver_open {
                return Err(Closed);
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            if state.pending.insert(key, build(seq)).is_some() {
                state.replaced += 1;
            }
            seq
        };
        self.shared.notify.notify_one();
        Ok(seq)
    }

    /// Stores every entry of `batch` atomically: the receiver sees all of
    /// them or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once the receiver is gone.
    pub fn send_batch(&self, batch: impl IntoIterator<Item = (K, V)>) -> Result<(), Closed> {
        self.send_batch_with(|_| batch).map(|_| ())
    }

    /// Like [`send_batch`](Self::send_batch), building the entries from
    /// the one sequence number assigned to the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once the receiver is gone.
    pub fn send_batch_with<I>(&self, build: impl FnOnce(u64) -> I) -> Result<u64, Closed>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let seq = {
            let mut state = self.shared.state.lock();
            if !state.receiver_open {
                return Err(Closed);
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            for (key, value) in build(seq) {
                if state.pending.insert(key, value).is_some() {
                    state.replaced += 1;
                }
            }
            seq
        };
        self.shared.notify.notify_one();
        Ok(seq)
    }

    /// `true` once the receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.state.lock().receiver_open
    }
}

impl<K, V> Clone for CoalescingSender<K, V> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Drop for CoalescingSender<K, V> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.state.lock();
            state.senders -= 1;
            state.senders == 0
        };
        if last {
            self.shared.notify.notify_one();
        }
    }
}

/// Receiving half.
pub struct CoalescingReceiver<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Ord, V> CoalescingReceiver<K, V> {
    /// Waits until something is pending and takes all of it.
    ///
    /// Returns `None` once nothing is pending and every sender is gone.
    pub async fn recv(&mut self) -> Option<BTreeMap<K, V>> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if !state.pending.is_empty() {
                    return Some(std::mem::take(&mut state.pending));
                }
                if state.senders == 0 || !state.receiver_open {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Takes whatever is pending without waiting.
    pub fn try_recv(&mut self) -> Option<BTreeMap<K, V>> {
        let mut state = self.shared.state.lock();
        if state.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut state.pending))
        }
    }

    /// Number of keys currently pending.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Number of sends that replaced a pending value.
    #[must_use]
    pub fn replaced(&self) -> u64 {
        self.shared.state.lock().replaced
    }

    /// Refuses further sends. Pending entries can still be received.
    pub fn close(&mut self) {
        self.shared.state.lock().receiver_open = false;
    }
}

impl<K, V> Drop for CoalescingReceiver<K, V> {
    fn drop(&mut self) {
        self.shared.state.lock().receiver_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn latest_value_wins() {
        let (tx, mut rx) = channel::<&str, i32>();
        tx.send("a", 1).unwrap();
        tx.send("b", 2).unwrap();
        tx.send("a", 3).unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch["a"], 3);
        assert_eq!(batch["b"], 2);
        assert_eq!(rx.replaced(), 1);
        assert_eq!(rx.pending_len(), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let (tx, _rx) = channel::<&str, u64>();
        let a = tx.send_with("a", |seq| seq).unwrap();
        let b = tx.send_with("a", |seq| seq).unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn recv_wakes_on_send_from_another_task() {
        let (tx, mut rx) = channel::<String, i32>();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send("x".into(), 7).unwrap();
            tx
        });
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch["x"], 7);
        drop(handle.await.unwrap());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pending_survives_sender_drop() {
        let (tx, mut rx) = channel::<&str, i32>();
        tx.send("a", 1).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await.map(|b| b["a"]), Some(1));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn send_after_receiver_drop_fails() {
        let (tx, rx) = channel::<&str, i32>();
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send("a", 1), Err(Closed));
        assert_eq!(tx.send_batch([("a", 1)]), Err(Closed));
    }

    #[test]
    fn batch_is_taken_whole() {
        let (tx, mut rx) = channel::<&str, i32>();
        tx.send_batch([("a", 1), ("b", 2), ("c", 3)]).unwrap();
        assert_eq!(rx.try_recv().map(|b| b.len()), Some(3));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn batch_shares_one_sequence_number() {
        let (tx, mut rx) = channel::<&str, u64>();
        let before = tx.send_with("a", |seq| seq).unwrap();
        let seq = tx
            .send_batch_with(|seq| [("b", seq), ("c", seq)])
            .unwrap();
        assert!(seq > before);
        let batch = rx.try_recv().unwrap();
        assert_eq!((batch["b"], batch["c"]), (seq, seq));
    }

    #[test]
    fn clones_keep_channel_open() {
        let (tx, mut rx) = channel::<&str, i32>();
        let tx2 = tx.clone();
        drop(tx);
        tx2.send("a", 1).unwrap();
        assert!(rx.try_recv().is_some());
        rx.close();
        assert!(tx2.send("a", 2).is_err());
    }
}
