//! Delivery Pipe Tests (shroud-transport)
//!
//! Tests for paced delivery including:
//! - Rate pacing over a multi-second run
//! - Application-level acknowledgement
//! - Retransmission on a lossy link

use bytes::Bytes;
use shroud_core::{Ack, Footer, MediaStreamType, Packet};
use shroud_transport::{
    AckTracker, Channel, ChannelReceiver, DeliveryConfig, DeliveryPipe, MemoryNetwork,
    MemoryReceiver, OutboundChunk, Pacing, TransportEvent,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn chunk(sequence: i64, ack_required: bool) -> OutboundChunk {
    OutboundChunk {
        bytes: Bytes::from(format!("chunk {}", sequence)),
        media_hash: 7,
        sequence,
        ack_required,
    }
}

/// Answer every data datagram with an ack for `sequence` parsed from the text
fn spawn_acker(channel: Arc<dyn Channel>, mut rx: MemoryReceiver) {
    tokio::spawn(async move {
        while let Some((TransportEvent::Data(data), from)) = rx.recv_from().await {
            if let Ok(text) = std::str::from_utf8(&data) {
                if let Some(seq) = text.strip_prefix("chunk ").and_then(|s| s.parse().ok()) {
                    let _ = channel.send_to(Ack::new(7, seq).encode(), from).await;
                }
            }
        }
    });
}

/// Forward acks arriving at the sender into the tracker
fn spawn_ack_reader(tracker: Arc<AckTracker>, mut rx: MemoryReceiver) {
    tokio::spawn(async move {
        while let Some((TransportEvent::Data(data), _)) = rx.recv_from().await {
            if let Ok(Packet::Ack(ack)) = Packet::decode(data) {
                tracker.complete(ack);
            }
        }
    });
}

// ============================================================================
// Pacing Tests
// ============================================================================

#[tokio::test]
async fn test_rate_pacing_over_multi_second_run() {
    let network = MemoryNetwork::new();
    let (a, _a_rx) = network.bind(addr(1)).unwrap();
    let (_b, mut b_rx) = network.bind(addr(2)).unwrap();

    let rate = 20u32;
    let config = DeliveryConfig {
        pacing: Pacing::ChunksPerSecond { rate },
        ..Default::default()
    };
    let pipe = Arc::new(DeliveryPipe::new(
        Arc::new(a),
        addr(2),
        config,
        Arc::new(AckTracker::new()),
    ));

    let sender = {
        let pipe = pipe.clone();
        tokio::spawn(async move {
            for seq in 0..50 {
                pipe.send_chunk(chunk(seq, false)).await.unwrap();
            }
        })
    };

    let mut arrivals = Vec::new();
    while arrivals.len() < 50 {
        match tokio::time::timeout(Duration::from_secs(5), b_rx.recv_from()).await {
            Ok(Some((TransportEvent::Data(_), _))) => arrivals.push(Instant::now()),
            _ => panic!("pipe stalled after {} chunks", arrivals.len()),
        }
    }
    sender.await.unwrap();

    // Allow a little scheduler jitter at the window edge
    let window = Duration::from_millis(950);
    for (i, first) in arrivals.iter().enumerate() {
        let count = arrivals[i..]
            .iter()
            .take_while(|t| t.duration_since(*first) < window)
            .count();
        assert!(count <= rate as usize, "{} chunks inside one second", count);
    }
}

#[tokio::test]
async fn test_fixed_delay_spacing() {
    let network = MemoryNetwork::new();
    let (a, _a_rx) = network.bind(addr(1)).unwrap();
    let (_b, _b_rx) = network.bind(addr(2)).unwrap();

    let config = DeliveryConfig {
        pacing: Pacing::FixedDelay { delay_ms: 30 },
        ..Default::default()
    };
    let pipe = DeliveryPipe::new(Arc::new(a), addr(2), config, Arc::new(AckTracker::new()));

    let start = Instant::now();
    for seq in 0..5 {
        pipe.send_chunk(chunk(seq, false)).await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn test_runtime_pacing_change() {
    let network = MemoryNetwork::new();
    let (a, _a_rx) = network.bind(addr(1)).unwrap();
    let (_b, _b_rx) = network.bind(addr(2)).unwrap();

    let config = DeliveryConfig {
        pacing: Pacing::FixedDelay { delay_ms: 1000 },
        ..Default::default()
    };
    let pipe = DeliveryPipe::new(Arc::new(a), addr(2), config, Arc::new(AckTracker::new()));
    pipe.set_pacing(Pacing::Unthrottled).await;

    let start = Instant::now();
    for seq in 0..20 {
        pipe.send_chunk(chunk(seq, false)).await.unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(pipe.config().pacing, Pacing::Unthrottled);
}

// ============================================================================
// Acknowledgement Tests
// ============================================================================

#[tokio::test]
async fn test_acked_delivery() {
    let network = MemoryNetwork::new();
    let (a, a_rx) = network.bind(addr(1)).unwrap();
    let (b, b_rx) = network.bind(addr(2)).unwrap();

    let tracker = Arc::new(AckTracker::new());
    spawn_acker(Arc::new(b), b_rx);
    spawn_ack_reader(tracker.clone(), a_rx);

    let config = DeliveryConfig {
        concurrency: 4,
        ..Default::default()
    };
    let pipe = DeliveryPipe::new(Arc::new(a), addr(2), config, tracker.clone());

    for seq in 0..10 {
        pipe.send_chunk(chunk(seq, true)).await.unwrap();
    }
    pipe.flush().await;

    assert_eq!(pipe.stats().acked(), 10);
    assert_eq!(pipe.stats().retransmits(), 0);
    assert_eq!(tracker.pending(), 0);
}

#[tokio::test]
async fn test_retransmit_on_lossy_link() {
    let network = MemoryNetwork::new();
    // Every third datagram (chunks and acks alike) is lost
    network.set_drop_every(3);
    let (a, a_rx) = network.bind(addr(1)).unwrap();
    let (b, b_rx) = network.bind(addr(2)).unwrap();

    let tracker = Arc::new(AckTracker::new());
    spawn_acker(Arc::new(b), b_rx);
    spawn_ack_reader(tracker.clone(), a_rx);

    let config = DeliveryConfig {
        ack_timeout_ms: 50,
        max_retries: 5,
        ..Default::default()
    };
    let pipe = DeliveryPipe::new(Arc::new(a), addr(2), config, tracker);

    for seq in 0..6 {
        pipe.send_chunk(chunk(seq, true)).await.unwrap();
    }
    pipe.flush().await;

    assert_eq!(pipe.stats().acked(), 6);
    assert!(pipe.stats().retransmits() > 0);
    assert_eq!(pipe.stats().unacked(), 0);
}

#[tokio::test]
async fn test_unacked_gives_up() {
    let network = MemoryNetwork::new();
    let (a, _a_rx) = network.bind(addr(1)).unwrap();
    // Peer never answers
    let (_b, _b_rx) = network.bind(addr(2)).unwrap();

    let tracker = Arc::new(AckTracker::new());
    let config = DeliveryConfig {
        ack_timeout_ms: 20,
        max_retries: 2,
        ..Default::default()
    };
    let pipe = DeliveryPipe::new(Arc::new(a), addr(2), config, tracker.clone());

    pipe.send_chunk(chunk(1, true)).await.unwrap();
    pipe.flush().await;

    assert_eq!(pipe.stats().retransmits(), 2);
    assert_eq!(pipe.stats().unacked(), 1);
    assert_eq!(tracker.pending(), 0);
    // One original send plus two resends
    assert_eq!(network.sent_count(), 3);
}

#[tokio::test]
async fn test_footer_follows_message() {
    let network = MemoryNetwork::new();
    let (a, _a_rx) = network.bind(addr(1)).unwrap();
    let (_b, mut b_rx) = network.bind(addr(2)).unwrap();

    let pipe = DeliveryPipe::new(
        Arc::new(a),
        addr(2),
        DeliveryConfig::default(),
        Arc::new(AckTracker::new()),
    );
    pipe.send_message(
        vec![chunk(1, false), chunk(2, false)],
        Footer::new(MediaStreamType::Binary, 7),
    )
    .await
    .unwrap();

    let mut last = None;
    for _ in 0..3 {
        if let Some((TransportEvent::Data(data), _)) = b_rx.recv_from().await {
            last = Some(data);
        }
    }
    let last = last.expect("no datagrams");
    assert_eq!(
        Footer::decode(&last).unwrap(),
        Footer::new(MediaStreamType::Binary, 7)
    );
}
