//! # Fault Handling
//!
//! Duplicate and rogue replies, worker failures mid-stream, graceful
//! shutdown, and reconnection.

#[cfg(test)]
mod tests {
    use crate::init_tracing;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::future::join_all;
    use shared_queue::{Message, QueueBroker};
    use std::sync::Arc;
    use std::time::Duration;
    use token_rpc::{
        InMemoryTokenStore, ProcessingError, RpcClient, RpcConfig, RpcError, RpcWorker,
        TokenStore, TokenValidator, UserId,
    };

    fn config(timeout: Duration) -> RpcConfig {
        RpcConfig {
            default_timeout: timeout,
            ..RpcConfig::default()
        }
    }

    /// Every reply is sent twice; the duplicate must be discarded without
    /// touching any other pending call.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_replies_are_discarded() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(2));

        let responder = broker.connect();
        responder.declare_queue(&cfg.request_queue).unwrap();
        let mut requests = responder.consume(&cfg.request_queue, 0).unwrap();
        tokio::spawn(async move {
            while let Some(mut delivery) = requests.recv().await {
                delivery.ack();
                let request = delivery.into_message();
                let (Some(reply_to), Some(id)) = (request.reply_to, request.correlation_id)
                else {
                    continue;
                };
                for _ in 0..2 {
                    let _ = responder
                        .publish(&reply_to, Message::reply(request.body.clone(), id.clone()));
                }
            }
        });

        let client = Arc::new(RpcClient::connect(&broker, cfg).unwrap());

        let calls = (0..4u32).map(|i| {
            let client = Arc::clone(&client);
            async move {
                let payload = format!("call-{i}");
                let reply = client
                    .call(Bytes::from(payload.clone()), Duration::from_secs(2))
                    .await
                    .unwrap();
                (payload, reply)
            }
        });

        for (payload, reply) in join_all(calls).await {
            assert_eq!(reply, Bytes::from(payload));
        }

        // Each call resolved exactly once; the duplicates were no-ops.
        assert_eq!(client.stats().resolved(), 4);
        assert_eq!(client.pending_count(), 0);
    }

    /// A reply with a fabricated correlation id is dropped; the real reply
    /// still lands.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_rogue_correlation_id_is_ignored() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(2));

        let responder = broker.connect();
        responder.declare_queue(&cfg.request_queue).unwrap();
        let mut requests = responder.consume(&cfg.request_queue, 0).unwrap();
        tokio::spawn(async move {
            while let Some(mut delivery) = requests.recv().await {
                delivery.ack();
                let request = delivery.into_message();
                let (Some(reply_to), Some(id)) = (request.reply_to, request.correlation_id)
                else {
                    continue;
                };
                // Junk first: an unknown id, then a malformed one.
                let _ = responder.publish(
                    &reply_to,
                    Message::reply("junk", "00000000-0000-7000-8000-000000000000"),
                );
                let _ = responder.publish(&reply_to, Message::reply("junk", "not-a-uuid"));
                let _ = responder.publish(&reply_to, Message::reply(request.body, id));
            }
        });

        let client = RpcClient::connect(&broker, cfg).unwrap();

        let reply = client
            .call(Bytes::from("real-payload"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from("real-payload"));
        assert_eq!(client.pending_count(), 0);
    }

    /// A stream mixing unknown and known tokens: the worker must answer
    /// every known token even when failures are interleaved.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_survives_interleaved_failures() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_millis(150));

        let store = Arc::new(InMemoryTokenStore::new());
        store.insert("good", 9);
        let worker = Arc::new(RpcWorker::new(&broker, store, cfg.clone()).unwrap());
        let runner = Arc::clone(&worker);
        tokio::spawn(async move { runner.run().await });

        let client = Arc::new(RpcClient::connect(&broker, cfg).unwrap());
        let validator = TokenValidator::new(Arc::clone(&client));

        for round in 0..3 {
            assert_eq!(validator.validate("bad").await, None, "round {round}");
            assert_eq!(
                validator.validate("good").await,
                Some(UserId(9)),
                "round {round}"
            );
        }
    }

    /// Shutdown lets the message in flight finish before the loop exits.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_drains_in_flight_work_on_shutdown() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(2));

        struct SlowStore;

        #[async_trait]
        impl TokenStore for SlowStore {
            async fn user_id_for_token(&self, _token: &str) -> Result<u64, ProcessingError> {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(1)
            }
        }

        let worker = Arc::new(RpcWorker::new(&broker, Arc::new(SlowStore), cfg.clone()).unwrap());
        let runner = Arc::clone(&worker);
        let run_handle = tokio::spawn(async move { runner.run().await });

        let client = Arc::new(RpcClient::connect(&broker, cfg).unwrap());
        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move {
            caller
                .call(Bytes::from("anything"), Duration::from_secs(2))
                .await
        });

        // Let the worker pick the request up, then ask it to stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown();

        // The in-flight request is still answered.
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply, Bytes::from("1"));

        let run_result = tokio::time::timeout(Duration::from_secs(1), run_handle)
            .await
            .expect("run loop should exit after drain")
            .unwrap();
        assert!(run_result.is_ok());

        worker.close();
    }

    /// Reconnection fails in-flight calls but restores service.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnect_restores_service() {
        init_tracing();
        let broker = QueueBroker::new();
        let cfg = config(Duration::from_secs(1));

        let client = Arc::new(RpcClient::connect(&broker, cfg.clone()).unwrap());

        // No worker yet: this call would hang until its deadline.
        let caller = Arc::clone(&client);
        let doomed = tokio::spawn(async move {
            caller
                .call(Bytes::from("token-A"), Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.reconnect(&broker).await.unwrap();
        assert_eq!(doomed.await.unwrap(), Err(RpcError::ConnectionLost));
        assert!(client.is_connected());

        // Bring up a worker; the fresh channel serves calls normally.
        let store = Arc::new(InMemoryTokenStore::new());
        store.insert("token-A", 42);
        let worker = Arc::new(RpcWorker::new(&broker, store, cfg).unwrap());
        let runner = Arc::clone(&worker);
        tokio::spawn(async move { runner.run().await });

        let reply = client
            .call(Bytes::from("token-A"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from("42"));
    }
}
