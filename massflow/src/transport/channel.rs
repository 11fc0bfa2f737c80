//! Bounded FIFO message channel with blocking and async endpoints.

use crate::errors::TransportError;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};

/// One encoded message travelling through a channel.
pub type Message = Vec<u8>;

/// Creates a bounded channel holding at most `capacity` queued messages.
///
/// A `capacity` of zero is treated as one.
#[must_use]
pub fn channel(capacity: usize) -> (PushSocket, PullSocket) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PushSocket { tx },
        PullSocket {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The sending end of a channel.
///
/// Clones push into the same queue; messages from one clone stay in order.
#[derive(Debug, Clone)]
pub struct PushSocket {
    tx: mpsc::Sender<Message>,
}

impl PushSocket {
    /// Enqueues a message, blocking the thread while the queue is full.
    ///
    /// Returning `Ok` is the acknowledgement that the message is queued.
    /// Must not be called from inside an async runtime.
    pub fn send_blocking(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .blocking_send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Enqueues a message, suspending the task while the queue is full.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Number of messages that can be queued right now without blocking.
    #[must_use]
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    /// Total queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Returns true once the receiving side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The receiving end of a channel.
///
/// Clones compete for messages: each message is delivered to exactly one of
/// them, in the order the clones asked.
#[derive(Clone)]
pub struct PullSocket {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl PullSocket {
    /// Waits for the next message, blocking the thread.
    ///
    /// Must not be called from inside an async runtime.
    pub fn receive_blocking(&self) -> Result<Message, TransportError> {
        self.rx
            .blocking_lock()
            .blocking_recv()
            .ok_or(TransportError::Closed)
    }

    /// Waits for the next message without blocking other tasks.
    pub async fn receive(&self) -> Result<Message, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    /// Takes the next message if one is queued and no other clone is
    /// waiting on the queue.
    pub fn try_receive(&self) -> Result<Option<Message>, TransportError> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Number of sockets sharing this queue.
    #[must_use]
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.rx)
    }
}

impl std::fmt::Debug for PullSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSocket")
            .field("share_count", &self.share_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_blocks_when_capacity_reached() {
        let capacity = 3;
        let (push, pull) = channel(capacity);

        for i in 0..capacity {
            tokio::time::timeout(Duration::from_millis(100), push.send(vec![i as u8]))
                .await
                .expect("send within capacity must not block")
                .unwrap();
        }
        assert_eq!(push.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), push.send(vec![99])).await;
        assert!(blocked.is_err(), "send beyond capacity must block");

        assert_eq!(pull.receive().await.unwrap(), vec![0]);

        tokio::time::timeout(Duration::from_millis(100), push.send(vec![99]))
            .await
            .expect("send must resume after a receive")
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_per_producer() {
        let (push, pull) = channel(10);
        for i in 1..=5u8 {
            push.send(vec![i]).await.unwrap();
        }
        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(pull.receive().await.unwrap()[0]);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cloned_pull_sockets_share_messages() {
        let (push, pull) = channel(4);
        let other = pull.clone();
        assert_eq!(pull.share_count(), 2);

        push.send(vec![1]).await.unwrap();
        push.send(vec![2]).await.unwrap();

        let first = pull.receive().await.unwrap();
        let second = other.receive().await.unwrap();
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
    }

    #[tokio::test]
    async fn test_receive_reports_closed_after_senders_drop() {
        let (push, pull) = channel(1);
        push.send(vec![7]).await.unwrap();
        drop(push);

        assert_eq!(pull.receive().await.unwrap(), vec![7]);
        assert_eq!(pull.receive().await, Err(TransportError::Closed));
    }

    #[test]
    fn test_blocking_endpoints_across_threads() {
        let (push, pull) = channel(1);
        let producer = std::thread::spawn(move || {
            for i in 0..3u8 {
                push.send_blocking(vec![i]).unwrap();
            }
        });

        let received: Vec<u8> = (0..3).map(|_| pull.receive_blocking().unwrap()[0]).collect();
        producer.join().unwrap();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[test]
    fn test_send_fails_when_receiver_dropped() {
        let (push, pull) = channel(1);
        drop(pull);
        assert!(push.is_closed());
        assert_eq!(push.send_blocking(vec![1]), Err(TransportError::Closed));
    }

    #[test]
    fn test_try_receive() {
        let (push, pull) = channel(2);
        assert_eq!(pull.try_receive(), Ok(None));

        push.send_blocking(vec![5]).unwrap();
        assert_eq!(pull.try_receive(), Ok(Some(vec![5])));

        drop(push);
        assert_eq!(pull.try_receive(), Err(TransportError::Closed));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (push, _pull) = channel(0);
        assert_eq!(push.capacity(), 1);
    }
}
