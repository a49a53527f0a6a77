mod common;

use bytes::Bytes;
use common::{connect, wait_for_event, MockBroker, Mode};
use kafkalink_client::protocol::api_key;
use kafkalink_client::*;
use std::time::Duration;

fn fetch(body: &'static str) -> EncodedRequest {
    EncodedRequest::new(api_key::FETCH, 0, Bytes::from_static(body.as_bytes()))
}

#[tokio::test]
async fn test_one_channel_per_seed_broker() {
    let first = MockBroker::start(&[("orders", 1)]).await;
    let second = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&first, &second]).await;

    assert_eq!(client.pool().len(), 2);
    for broker in [&first, &second] {
        let key = BrokerKey::new("127.0.0.1", broker.port);
        let channel = client.pool().channel(&key).expect("seed channel");
        channel.wait_ready().await.unwrap();
        assert_eq!(broker.accepted(), 1);
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_to_missing_topic_is_topology_unavailable() {
    let broker = MockBroker::start(&[]).await;
    let client = connect(&[&broker]).await;
    let refreshes_before = broker.received(api_key::METADATA);

    let err = client
        .dispatch("orders", 1, fetch("ping"), RawResponse)
        .await
        .unwrap_err();
    assert!(matches!(err, KafkalinkClientError::TopologyUnavailable { .. }));
    assert_eq!(broker.received(api_key::METADATA), refreshes_before + 1);
    assert_eq!(broker.received(api_key::FETCH), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_routes_to_partition_leader() {
    let broker = MockBroker::start(&[("orders", 2)]).await;
    let client = connect(&[&broker]).await;
    client.remove_topic_metadata(&["orders"]);
    assert_eq!(client.leader_for("orders", 1), None);

    let response = client
        .dispatch("orders", 1, fetch("ping"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"ping");

    let key = BrokerKey::new("127.0.0.1", broker.port);
    assert_eq!(client.leader_for("orders", 1), Some(key));
    assert_eq!(client.partitions_for("orders"), Some(vec![0, 1]));
    assert_eq!(broker.received(api_key::FETCH), 1);

    let metrics = client.metrics();
    assert!(metrics.responses_received >= 2);
    assert!(metrics.metadata_refreshes >= 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_leader_on_departed_broker_is_refreshed() {
    let departed = MockBroker::start(&[("orders", 1)]).await;
    let seed = MockBroker::start(&[("orders", 1), ("payments", 1)]).await;
    let client = connect(&[&seed]).await;
    let seed_key = BrokerKey::new("127.0.0.1", seed.port);
    let departed_key = BrokerKey::new("127.0.0.1", departed.port);

    seed.advertise(Some(departed.port));
    client.refresh_topology(&["orders"]).await.unwrap();
    assert_eq!(client.leader_for("orders", 0), Some(departed_key.clone()));

    // a refresh of another topic reports that the leader has left
    seed.advertise(None);
    client.refresh_topology(&["payments"]).await.unwrap();
    assert!(!client.topology().knows_broker(&departed_key));
    assert_eq!(client.leader_for("orders", 0), None);

    let response = client
        .dispatch("orders", 0, fetch("rerouted"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"rerouted");
    assert_eq!(client.leader_for("orders", 0), Some(seed_key));
    assert_eq!(departed.received(api_key::FETCH), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_overlong_topic_name_fails_without_touching_the_channel() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    let key = BrokerKey::new("127.0.0.1", broker.port);
    let channel_id = client.pool().channel(&key).unwrap().id();
    let refreshes_before = broker.received(api_key::METADATA);

    let topic = "t".repeat(40_000);
    let err = client
        .dispatch(&topic, 0, fetch("x"), RawResponse)
        .await
        .unwrap_err();
    assert!(matches!(err, KafkalinkClientError::ProtocolViolation { .. }), "{:?}", err);
    assert_eq!(broker.received(api_key::METADATA), refreshes_before);

    let response = client
        .dispatch("orders", 0, fetch("still fine"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"still fine");
    assert_eq!(client.pool().channel(&key).unwrap().id(), channel_id);

    client.shutdown().await;
}

#[tokio::test]
async fn test_topic_exists_reports_missing_topics() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;

    let missing = client.topic_exists(&["orders", "payments"]).await.unwrap();
    assert_eq!(missing, vec!["payments".to_string()]);
    assert!(client.topology().contains_topic("orders"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_decoded_responses_use_the_callers_decoder() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;

    let length = client
        .dispatch("orders", 0, fetch("twelve bytes"), |body: Bytes| {
            Ok::<_, KafkalinkClientError>(body.len())
        })
        .await
        .unwrap();
    assert_eq!(length, 12);

    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_leaves_exactly_one_entry() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    let key = BrokerKey::new("127.0.0.1", broker.port);
    let original = client.pool().channel(&key).unwrap().id();
    let mut events = client.subscribe();

    for round in 0..3 {
        broker.wait_for_accepted(round + 1).await;
        broker.drop_connections();
        wait_for_event(&mut events, |e| matches!(e, ClientEvent::Closed { broker } if *broker == key)).await;
        wait_for_event(&mut events, |e| matches!(e, ClientEvent::Connected { broker } if *broker == key)).await;
    }

    assert_eq!(client.pool().len(), 1);
    assert_eq!(client.pool().keys(), vec![key.clone()]);
    let current = client.pool().channel(&key).unwrap();
    assert_ne!(current.id(), original);
    assert_eq!(current.state(), ChannelState::Ready);

    let response = client
        .dispatch("orders", 0, fetch("after"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"after");
    assert!(client.metrics().reconnects >= 3);

    client.shutdown().await;
}

#[tokio::test]
async fn test_tls_broker_is_cached_once_across_reconnects() {
    let broker = MockBroker::start_tls(&[("orders", 1)]).await;
    common::init_tracing();
    let config = ClientConfig {
        tls: Some(TlsOptions::insecure()),
        ..common::config(&[&broker])
    };
    let client = KafkalinkClient::connect(config).await.unwrap();
    let key = BrokerKey::new("127.0.0.1", broker.port);

    let channel = client.pool().channel(&key).unwrap();
    assert!(channel.profile().secure);
    assert_eq!(channel.profile().dial_target(), ("127.0.0.1", broker.port + 1));
    assert_eq!(client.leader_for("orders", 0), Some(key.clone()));

    let mut events = client.subscribe();
    broker.wait_for_accepted(1).await;
    broker.drop_connections();
    wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::Error { broker, .. } | ClientEvent::Closed { broker } if *broker == key)
    })
    .await;
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Connected { broker } if *broker == key)).await;

    assert_eq!(client.pool().keys(), vec![key.clone()]);
    assert_ne!(client.pool().channel(&key).unwrap().id(), channel.id());
    let response = client
        .dispatch("orders", 0, fetch("secure"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"secure");
    assert_eq!(client.pool().keys(), vec![key]);

    client.shutdown().await;
}

#[tokio::test]
async fn test_pending_requests_fail_on_disconnect_then_recover() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    broker.set_mode(Mode::Silent);

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.dispatch("orders", 0, fetch("x"), RawResponse).await })
        })
        .collect();
    broker.wait_for_requests(api_key::FETCH, 3).await;
    broker.drop_connections();

    for handle in pending {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_connection_error(), "unexpected error {:?}", err);
    }
    assert_eq!(client.metrics().requests_failed, 3);

    broker.set_mode(Mode::Echo);
    let mut recovered = false;
    for _ in 0..50 {
        if client
            .dispatch("orders", 0, fetch("again"), RawResponse)
            .await
            .is_ok()
        {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(recovered);
    assert_eq!(client.pool().len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_keeps_channel_usable() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    common::init_tracing();
    let config = ClientConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..common::config(&[&broker])
    };
    let client = KafkalinkClient::connect(config).await.unwrap();
    let key = BrokerKey::new("127.0.0.1", broker.port);
    let channel_id = client.pool().channel(&key).unwrap().id();

    broker.set_mode(Mode::Silent);
    let err = client
        .dispatch("orders", 0, fetch("slow"), RawResponse)
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    broker.set_mode(Mode::Echo);
    let response = client
        .dispatch("orders", 0, fetch("fast"), RawResponse)
        .await
        .unwrap();
    assert_eq!(&response[..], b"fast");
    assert_eq!(client.pool().channel(&key).unwrap().id(), channel_id);
    assert_eq!(client.metrics().request_timeouts, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_response_is_reported() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    let mut events = client.subscribe();
    broker.set_mode(Mode::WrongCorrelation);

    let err = client
        .dispatch("orders", 0, fetch("x"), RawResponse)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());

    let event = wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::ProtocolViolation { .. })
    })
    .await;
    if let ClientEvent::ProtocolViolation { message, .. } = event {
        assert!(message.contains("unmatched correlation id"));
    }
    assert_eq!(client.metrics().protocol_violations, 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_fire_and_forget_requests() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    broker.set_mode(Mode::Silent);

    let produce = EncodedRequest::new(api_key::PRODUCE, 0, Bytes::from_static(b"acks=0"));
    client
        .dispatch_without_response("orders", 0, produce)
        .await
        .unwrap();
    broker.wait_for_requests(api_key::PRODUCE, 1).await;

    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_requests() {
    let broker = MockBroker::start(&[("orders", 1)]).await;
    let client = connect(&[&broker]).await;
    broker.set_mode(Mode::Silent);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.dispatch("orders", 0, fetch("x"), RawResponse).await })
    };
    broker.wait_for_requests(api_key::FETCH, 1).await;
    client.shutdown().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, KafkalinkClientError::Shutdown), "{:?}", err);
    assert!(client.pool().is_empty());
    assert!(matches!(
        client.refresh_all_topology().await,
        Err(KafkalinkClientError::Shutdown)
    ));
}

#[tokio::test]
async fn test_invalid_identity_never_dials() {
    let broker = MockBroker::start(&[]).await;
    let config = ClientConfig {
        client_id: "myClientId:12345".to_string(),
        ..common::config(&[&broker])
    };

    let err = KafkalinkClient::new(config).unwrap_err();
    assert!(matches!(err, KafkalinkClientError::InvalidIdentity { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.accepted(), 0);
}

#[tokio::test]
async fn test_ready_times_out_without_brokers() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ClientConfig::builder()
        .brokers(vec![format!("127.0.0.1:{}", port)])
        .connection_timeout(Duration::from_millis(200))
        .metadata_refresh_interval(None)
        .build();
    let client = KafkalinkClient::new(config).unwrap();
    assert!(client.ready().await.unwrap_err().is_timeout());
    assert!(!client.is_ready());

    client.shutdown().await;
}
