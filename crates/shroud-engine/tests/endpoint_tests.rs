//! Endpoint Tests
//!
//! Whole-stack scenarios: negotiate, stream and reassemble between two
//! endpoints over the in-memory network and over loopback UDP.

use bytes::Bytes;
use shroud_core::{Ack, ChunkBuilder, MediaStreamType};
use shroud_engine::{
    ArrivalEvent, EngineConfig, ForwardingFactory, MediaResult, ReceiverConfig, StreamerState,
};
use shroud_test_utils::{
    wait_for, EventCollector, TestPeers, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};
use shroud_transport::Channel;
use std::sync::Arc;
use tokio::time::timeout;

// ============================================================================
// Utilities
// ============================================================================

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.receiver = ReceiverConfig::immediate();
    config
}

fn results(peers: &TestPeers) -> Arc<EventCollector<MediaResult>> {
    let collector = EventCollector::new();
    collector.subscribe(peers.b.context().media_results());
    collector
}

// ============================================================================
// In-Memory
// ============================================================================

#[tokio::test]
async fn test_memory_round_trip_in_order() {
    let peers = TestPeers::memory(config());
    let results = results(&peers);

    let streamer = peers
        .a
        .open_stream(MediaStreamType::Text, 100, peers.b_addr())
        .await
        .unwrap();
    streamer.start().unwrap();
    for i in 0..10 {
        streamer.send(format!("message {}", i)).await.unwrap();
    }
    streamer.drain().await.unwrap();

    assert!(results.wait_for_count(10, DEFAULT_TIMEOUT).await);
    let payloads: Vec<String> = results
        .events()
        .into_iter()
        .map(|r| String::from_utf8(r.payload.to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("message {}", i)).collect();
    assert_eq!(payloads, expected);

    peers.shutdown().await;
}

#[tokio::test]
async fn test_lost_chunk_is_resent_when_acks_are_required() {
    let mut engine = config();
    engine.streamer.max_chunk_payload = 4;
    engine.streamer.delivery.ack_required = true;
    engine.streamer.delivery.ack_timeout_ms = 100;
    let peers = TestPeers::memory(engine);
    let network = peers.network.clone().unwrap();
    let results = results(&peers);

    let streamer = peers
        .a
        .open_stream(MediaStreamType::Binary, 101, peers.b_addr())
        .await
        .unwrap();

    // Lose the very next datagram (the first chunk), then heal the link
    network.set_drop_every(network.sent_count() + 1);
    streamer.start().unwrap();
    streamer.send("lossy-link").await.unwrap();

    let net = &network;
    assert!(
        wait_for(
            || async { net.dropped_count() >= 1 },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
    network.set_drop_every(0);

    streamer.drain().await.unwrap();
    assert!(results.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(results.events()[0].payload.as_ref(), b"lossy-link");

    let delivery = streamer.delivery().unwrap();
    let stats = delivery.stats();
    assert_eq!(stats.chunks_sent(), 3);
    assert!(stats.retransmits() >= 1);
    assert_eq!(stats.acked(), 3);
    assert_eq!(stats.unacked(), 0);

    peers.shutdown().await;
}

#[tokio::test]
async fn test_two_streams_stay_separate() {
    let peers = TestPeers::memory(config());
    let results = results(&peers);

    let text = peers
        .a
        .open_stream(MediaStreamType::Text, 1, peers.b_addr())
        .await
        .unwrap();
    let binary = peers
        .a
        .open_stream(MediaStreamType::Binary, 2, peers.b_addr())
        .await
        .unwrap();
    text.start().unwrap();
    binary.start().unwrap();

    text.send("words").await.unwrap();
    binary.send(vec![0u8, 1, 2]).await.unwrap();
    text.drain().await.unwrap();
    binary.drain().await.unwrap();

    assert!(results.wait_for_count(2, DEFAULT_TIMEOUT).await);
    let text_results = results.matching(|r| r.media_hash == 1);
    let binary_results = results.matching(|r| r.media_hash == 2);
    assert_eq!(text_results.len(), 1);
    assert_eq!(text_results[0].media_type, MediaStreamType::Text);
    assert_eq!(text_results[0].payload.as_ref(), b"words");
    assert_eq!(binary_results[0].payload.as_ref(), &[0u8, 1, 2]);

    peers.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagrams_are_dropped() {
    let peers = TestPeers::memory(config());
    let results = results(&peers);
    let arrivals = EventCollector::<ArrivalEvent>::new();
    arrivals.subscribe(peers.b.context().arrivals());

    let a = peers.a.channel();
    // Too short for any packet, a header claiming more bytes than sent,
    // and an ack nobody waits for
    a.send_to(Bytes::from_static(b"\x01\x02"), peers.b_addr())
        .await
        .unwrap();
    let mut oversized = ChunkBuilder::new(MediaStreamType::Text, 102, 1)
        .data(b"x".to_vec())
        .encode()
        .unwrap()
        .to_vec();
    oversized[4..6].copy_from_slice(&i16::MAX.to_be_bytes());
    a.send_to(Bytes::from(oversized), peers.b_addr())
        .await
        .unwrap();
    a.send_to(Ack::new(5, 5).encode(), peers.b_addr())
        .await
        .unwrap();

    // The endpoint keeps working afterwards
    let streamer = peers
        .a
        .open_stream(MediaStreamType::Text, 102, peers.b_addr())
        .await
        .unwrap();
    streamer.start().unwrap();
    streamer.send("still alive").await.unwrap();
    streamer.drain().await.unwrap();

    assert!(results.wait_for_count(1, DEFAULT_TIMEOUT).await);
    peers.b.context().flush().await;
    // Only the chunk and its footer made it onto the bus
    assert_eq!(arrivals.count(), 2);

    peers.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processor_sees_last_messages_before_destroy() {
    // Default finalize delay, so the termination footer finalizes the tail
    let peers = TestPeers::memory(EngineConfig::default());
    let (factory, mut delivered) = ForwardingFactory::new(vec![MediaStreamType::Text]);
    peers.b.set_processor_factory(Arc::new(factory));

    let streamer = peers
        .a
        .open_stream(MediaStreamType::Text, 105, peers.b_addr())
        .await
        .unwrap();
    streamer.start().unwrap();
    for i in 0..3 {
        streamer.send(format!("part {}", i)).await.unwrap();
    }
    streamer.drain().await.unwrap();
    streamer.destroy().await;

    for i in 0..3 {
        let result = timeout(DEFAULT_TIMEOUT, delivered.recv())
            .await
            .expect("result delivered before the processor detached")
            .unwrap();
        assert_eq!(result.payload, Bytes::from(format!("part {}", i)));
    }

    let b = &peers.b;
    assert!(
        wait_for(
            || async { b.receiver(105).is_none() },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );

    peers.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_everything() {
    let peers = TestPeers::memory(config());

    let streamer = peers
        .a
        .open_stream(MediaStreamType::Audio, 103, peers.b_addr())
        .await
        .unwrap();
    streamer.start().unwrap();
    let local = peers
        .a
        .create_receiver(MediaStreamType::Video, 104, None)
        .unwrap();

    peers.a.shutdown().await;
    assert_eq!(streamer.state(), StreamerState::Destroyed);
    assert!(local.is_destroyed());
    assert!(peers.a.streamers().is_empty());
    assert!(!peers.a.channel().is_open());

    // The termination footer reached the acceptor
    let b = &peers.b;
    assert!(
        wait_for(
            || async { b.receiver(103).is_none() },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );

    // Shutting down twice is harmless
    peers.shutdown().await;
}

// ============================================================================
// UDP
// ============================================================================

#[tokio::test]
async fn test_udp_end_to_end() {
    let peers = TestPeers::udp(config()).await;
    let results = results(&peers);

    let streamer = peers
        .a
        .open_stream(MediaStreamType::Text, 200, peers.b_addr())
        .await
        .unwrap();
    streamer.set_ack_required(true).unwrap();
    streamer.start().unwrap();
    streamer.send("hello over udp").await.unwrap();
    streamer.drain().await.unwrap();

    assert!(results.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let result = &results.events()[0];
    assert_eq!(result.payload.as_ref(), b"hello over udp");
    assert_eq!(result.remote_address, Some(peers.a_addr()));
    assert_eq!(streamer.delivery().unwrap().stats().acked(), 1);

    peers.shutdown().await;
}
