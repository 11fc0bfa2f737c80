//! Relay that forwards a stage's frontend queue into its backend queue.
//!
//! The relay owns the only receiver of the frontend queue and the only sender
//! of the backend queue. When it stops, producers see their sends fail and
//! replicas see their receives fail, which is how a frame shuts down.

use super::channel::{channel, PullSocket, PushSocket};
use super::registry::{ChannelPair, ChannelRegistry};
use crate::cancellation::CancellationToken;
use crate::errors::TransportError;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Capacity of the backend queue feeding the replicas.
///
/// Kept at one so pressure builds in the frontend queue, in front of the
/// producers, instead of downstream.
pub const BACKEND_CAPACITY: usize = 1;

/// Counters reported by a relay when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages forwarded from frontend to backend.
    pub forwarded: u64,
}

/// A bound relay for one stage.
#[derive(Debug)]
pub struct Relay {
    stage: String,
    pair: ChannelPair,
    inbound: PullSocket,
    outbound: PushSocket,
}

impl Relay {
    /// Creates both queues of a stage and binds their endpoints.
    ///
    /// The frontend queue holds `queue_size` messages, the backend queue
    /// holds [`BACKEND_CAPACITY`].
    pub fn bind(
        stage: impl Into<String>,
        pair: ChannelPair,
        queue_size: usize,
        registry: &ChannelRegistry,
    ) -> Result<Self, TransportError> {
        let (frontend_push, frontend_pull) = channel(queue_size);
        let (backend_push, backend_pull) = channel(BACKEND_CAPACITY);

        registry.bind_push(&pair.frontend, frontend_push)?;
        registry.bind_pull(&pair.backend, backend_pull)?;

        Ok(Self {
            stage: stage.into(),
            pair,
            inbound: frontend_pull,
            outbound: backend_push,
        })
    }

    /// The stage this relay serves.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The addresses this relay bound.
    #[must_use]
    pub fn pair(&self) -> &ChannelPair {
        &self.pair
    }

    /// Forwards messages until the token is cancelled or a queue closes.
    pub async fn run(self, token: Arc<CancellationToken>) -> RelayStats {
        let mut stats = RelayStats::default();

        loop {
            let message = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = self.inbound.receive() => match received {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                () = token.cancelled() => break,
                sent = self.outbound.send(message) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            stats.forwarded += 1;
        }

        debug!(
            stage = %self.stage,
            forwarded = stats.forwarded,
            "Relay stopped"
        );
        stats
    }

    /// Runs the relay on a dedicated thread with its own runtime.
    pub fn spawn(
        self,
        token: Arc<CancellationToken>,
    ) -> std::io::Result<JoinHandle<std::io::Result<RelayStats>>> {
        let name = format!("relay-{}", self.stage);
        info!(
            stage = %self.stage,
            frontend = %self.pair.frontend,
            backend = %self.pair.backend,
            "Starting relay"
        );

        std::thread::Builder::new().name(name).spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            Ok(runtime.block_on(self.run(token)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::AddressAllocator;
    use std::time::Duration;

    fn bound_relay(queue_size: usize) -> (Relay, ChannelRegistry) {
        let registry = ChannelRegistry::new();
        let pair = AddressAllocator::with_namespace("/tmp/test", "relay").allocate_pair();
        let relay = Relay::bind("stage", pair, queue_size, &registry).unwrap();
        (relay, registry)
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order() {
        let (relay, registry) = bound_relay(10);
        let producer = registry.connect_push(&relay.pair().frontend).unwrap();
        let consumer = registry.connect_pull(&relay.pair().backend).unwrap();

        let token = Arc::new(CancellationToken::new());
        let handle = tokio::spawn(relay.run(token.clone()));

        for i in 1..=3u8 {
            producer.send(vec![i]).await.unwrap();
        }
        for i in 1..=3u8 {
            assert_eq!(consumer.receive().await.unwrap(), vec![i]);
        }

        token.cancel("test done");
        let stats = handle.await.unwrap();
        assert_eq!(stats.forwarded, 3);
    }

    #[tokio::test]
    async fn test_relay_stop_closes_both_sides() {
        let (relay, registry) = bound_relay(2);
        let producer = registry.connect_push(&relay.pair().frontend).unwrap();
        let consumer = registry.connect_pull(&relay.pair().backend).unwrap();

        let token = Arc::new(CancellationToken::new());
        let handle = tokio::spawn(relay.run(token.clone()));
        token.cancel("shutdown");
        handle.await.unwrap();

        assert_eq!(consumer.receive().await, Err(TransportError::Closed));
        assert_eq!(producer.send(vec![1]).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_backpressure_reaches_producer() {
        let queue_size = 2;
        let (relay, registry) = bound_relay(queue_size);
        let producer = registry.connect_push(&relay.pair().frontend).unwrap();

        let token = Arc::new(CancellationToken::new());
        let handle = tokio::spawn(relay.run(token.clone()));

        // backend slot + message held by the relay + frontend queue
        let buffered = BACKEND_CAPACITY + 1 + queue_size;
        for i in 0..buffered {
            tokio::time::timeout(Duration::from_millis(200), producer.send(vec![i as u8]))
                .await
                .expect("buffered send must not block")
                .unwrap();
        }

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), producer.send(vec![0xff])).await;
        assert!(blocked.is_err(), "producer must block once every buffer is full");

        token.cancel("test done");
        handle.await.unwrap();
    }

    #[test]
    fn test_spawned_relay_thread() {
        let (relay, registry) = bound_relay(4);
        let producer = registry.connect_push(&relay.pair().frontend).unwrap();
        let consumer = registry.connect_pull(&relay.pair().backend).unwrap();

        let token = Arc::new(CancellationToken::new());
        let handle = relay.spawn(token.clone()).unwrap();

        producer.send_blocking(b"sample".to_vec()).unwrap();
        assert_eq!(consumer.receive_blocking().unwrap(), b"sample".to_vec());

        token.cancel("test done");
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.forwarded, 1);
    }
}
