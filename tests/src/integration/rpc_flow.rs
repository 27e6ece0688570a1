//! # End-to-End Call Flow
//!
//! Full client + worker + broker scenarios: the happy path, the
//! connection-down fast failure, and the slow-worker timeout with a late
//! reply.

#[cfg(test)]
mod tests {
    use crate::init_tracing;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use token_rpc::{
        InMemoryTokenStore, ProcessingError, RpcClient, RpcConfig, RpcError, RpcWorker,
        TokenStore, TokenValidator, UserId,
    };
    use shared_queue::QueueBroker;

    fn config(timeout: Duration) -> RpcConfig {
        RpcConfig {
            default_timeout: timeout,
            ..RpcConfig::default()
        }
    }

    /// Start a worker over a store holding `token-A -> 42`.
    fn start_worker(broker: &QueueBroker, cfg: RpcConfig) -> Arc<RpcWorker> {
        let store = Arc::new(InMemoryTokenStore::new());
        store.insert("token-A", 42);
        let worker = Arc::new(RpcWorker::new(broker, store, cfg).unwrap());
        let runner = Arc::clone(&worker);
        tokio::spawn(async move { runner.run().await });
        worker
    }

    /// A store that answers after a fixed delay.
    struct SlowStore {
        delay: Duration,
    }

    #[async_trait]
    impl TokenStore for SlowStore {
        async fn user_id_for_token(&self, _token: &str) -> Result<u64, ProcessingError> {
            tokio::time::sleep(self.delay).await;
            Ok(42)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_call_returns_worker_reply() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(1));
        let _worker = start_worker(&broker, cfg.clone());

        let client = RpcClient::connect(&broker, cfg).unwrap();

        let started = Instant::now();
        let reply = client
            .call(Bytes::from("token-A"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply, Bytes::from("42"));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validator_end_to_end() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(1));
        let _worker = start_worker(&broker, cfg.clone());

        let client = Arc::new(RpcClient::connect(&broker, cfg).unwrap());
        let validator = TokenValidator::new(client);

        assert_eq!(validator.validate("token-A").await, Some(UserId(42)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_down_fails_without_waiting() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(5));
        let client = RpcClient::connect(&broker, cfg).unwrap();

        client.close();

        let started = Instant::now();
        let result = client
            .call(Bytes::from("token-A"), Duration::from_secs(5))
            .await;

        assert_eq!(result, Err(RpcError::NotConnected));
        // No timeout wait: the failure is immediate.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_worker_times_out_and_late_reply_is_dropped() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_millis(200));

        // Worker twice as slow as the call deadline.
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(400),
        });
        let worker = Arc::new(RpcWorker::new(&broker, store, cfg.clone()).unwrap());
        let runner = Arc::clone(&worker);
        tokio::spawn(async move { runner.run().await });

        let client = RpcClient::connect(&broker, cfg).unwrap();

        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let result = client.call(Bytes::from("token-A"), timeout).await;
        let elapsed = started.elapsed();

        assert_eq!(result, Err(RpcError::Timeout(timeout)));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(400));

        // Let the late reply arrive; it must be discarded, not resurrect
        // the expired call.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.stats().resolved(), 0);
        assert_eq!(client.stats().expired(), 1);
    }
}
