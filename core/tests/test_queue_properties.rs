// Property tests for the codec, backoff and bounded queues

use lifeline_core::hybrid::{HybridMessage, MessagePriority, MessageSource, RetryQueue};
use lifeline_core::message::codec::{self, HEADER_SIZE, MAX_PACKET_SIZE};
use lifeline_core::message::{Envelope, MessageKind, PacketType, SourceToken, BROADCAST};
use lifeline_core::retry::RetryBackoff;
use lifeline_core::store::{Lane, MemoryStore, PriorityLanes, QueuedPacket};
use lifeline_core::transport::{Advertisement, MeshTransport, SimulatedAir};
use lifeline_core::{MeshConfig, StaticIdentity};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn arb_packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Sos),
        Just(PacketType::Status),
        Just(PacketType::Text),
        Just(PacketType::Ping),
        Just(PacketType::Ack),
        Just(PacketType::Location),
        Just(PacketType::EmergencyBeacon),
        Just(PacketType::FamilySearch),
        Just(PacketType::RescueSignal),
    ]
}

fn arb_lane() -> impl Strategy<Value = Lane> {
    prop_oneof![
        Just(Lane::Critical),
        Just(Lane::High),
        Just(Lane::Normal),
        Just(Lane::Relay),
    ]
}

fn arb_priority() -> impl Strategy<Value = MessagePriority> {
    prop_oneof![
        Just(MessagePriority::Critical),
        Just(MessagePriority::High),
        Just(MessagePriority::Normal),
        Just(MessagePriority::Low),
    ]
}

fn queued(lane: Lane, id: u32) -> QueuedPacket {
    QueuedPacket {
        packet_type: PacketType::Text,
        payload: vec![1, 2, 3],
        ttl: 3,
        lane,
        message_id: id,
        source: None,
        queued_at: id as u64,
    }
}

fn hybrid(id: usize, priority: MessagePriority) -> HybridMessage {
    let env = Envelope::new(
        format!("m-{}", id),
        "a",
        BROADCAST,
        MessageKind::Chat,
        "x",
        id as u64,
    );
    let mut message = HybridMessage::from_envelope(env, MessageSource::Hybrid);
    message.priority = priority;
    message
}

proptest! {
    #[test]
    fn proptest_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
        if let Some(packet) = codec::deserialize(&bytes) {
            prop_assert!(bytes.len() >= HEADER_SIZE && bytes.len() <= MAX_PACKET_SIZE);
            prop_assert_eq!(packet.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn proptest_header_survives_encoding(
        packet_type in arb_packet_type(),
        source in any::<u32>(),
        ttl in any::<u8>(),
        score in 0u8..4,
        id in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..(MAX_PACKET_SIZE - HEADER_SIZE)),
    ) {
        let frame = codec::serialize(packet_type, SourceToken(source), &payload, ttl, score, id).unwrap();
        let packet = codec::deserialize(&frame).unwrap();
        prop_assert_eq!(packet.packet_type, packet_type);
        prop_assert_eq!(packet.source, SourceToken(source));
        prop_assert_eq!(packet.ttl, ttl);
        prop_assert_eq!(packet.message_id, id);
        prop_assert_eq!(packet.payload, payload);
    }

    #[test]
    fn proptest_oversized_payload_rejected(extra in 1usize..64) {
        let payload = vec![0u8; MAX_PACKET_SIZE - HEADER_SIZE + extra];
        prop_assert!(codec::serialize(PacketType::Text, SourceToken(1), &payload, 1, 0, 1).is_err());
    }

    #[test]
    fn proptest_backoff_never_shrinks(attempt in 0u32..64, initial_ms in 1u64..5_000) {
        let backoff = RetryBackoff {
            initial: Duration::from_millis(initial_ms),
            ..Default::default()
        };
        prop_assert!(backoff.base_delay(attempt) <= backoff.base_delay(attempt + 1));
        prop_assert!(backoff.base_delay(attempt) <= backoff.max);

        let base = backoff.base_delay(attempt).as_secs_f64();
        let jittered = backoff.delay(attempt).as_secs_f64();
        prop_assert!(jittered >= base * 0.5 - 1e-6);
        prop_assert!(jittered < base * 1.5 + 1e-6);
    }

    #[test]
    fn proptest_lanes_never_evict_critical(
        lanes in proptest::collection::vec(arb_lane(), 1..80),
        capacity in 1usize..20,
    ) {
        let mut queue = PriorityLanes::new(capacity);
        let mut critical = 0usize;
        for (i, lane) in lanes.into_iter().enumerate() {
            match queue.enqueue(queued(lane, i as u32)) {
                Ok(evicted) => {
                    if lane == Lane::Critical {
                        critical += 1;
                    }
                    if let Some(evicted) = evicted {
                        prop_assert_ne!(evicted.lane, Lane::Critical);
                    }
                }
                Err(_) => {
                    // Full only when nothing but critical traffic remains.
                    prop_assert_eq!(queue.lane_len(Lane::Critical), queue.len());
                }
            }
            prop_assert!(queue.len() <= capacity);
            prop_assert_eq!(queue.lane_len(Lane::Critical), critical);
        }
    }

    #[test]
    fn proptest_retry_queue_never_evicts_critical(
        priorities in proptest::collection::vec(arb_priority(), 1..60),
        capacity in 1usize..15,
    ) {
        let mut queue = RetryQueue::new(capacity, 10);
        let mut critical = 0usize;
        for (i, priority) in priorities.into_iter().enumerate() {
            match queue.push(hybrid(i, priority)) {
                Ok(evicted) => {
                    if priority == MessagePriority::Critical {
                        critical += 1;
                    }
                    if let Some(evicted) = evicted {
                        prop_assert_ne!(evicted.priority, MessagePriority::Critical);
                    }
                }
                Err(_) => prop_assert_eq!(critical, queue.len()),
            }
            prop_assert!(queue.len() <= capacity);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn proptest_relay_decrements_ttl(ttl in 0u8..8, source in 1u32..u32::MAX, id in any::<u32>()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async move {
            let air = SimulatedAir::new();
            let mesh = MeshTransport::new(
                MeshConfig::default(),
                Arc::new(air.radio("relay")),
                Arc::new(MemoryStore::new()),
                Arc::new(StaticIdentity::new("relay", "relay", "Relay")),
            );
            let env = Envelope::new("m", "origin", BROADCAST, MessageKind::Chat, "hi", 1);
            let frame = codec::serialize(
                PacketType::Text,
                SourceToken(source),
                &env.to_bytes().unwrap(),
                ttl,
                1,
                id,
            )
            .unwrap();
            mesh.handle_advertisement(Advertisement {
                id: "neighbor".into(),
                rssi: -50,
                manufacturer_data: frame,
            })
            .await;

            if ttl <= 1 {
                assert_eq!(mesh.lane_len(Lane::Relay), 0);
                return;
            }
            assert_eq!(mesh.lane_len(Lane::Relay), 1);
            assert_eq!(mesh.process_queues().await, 1);

            let advertised = air.advertised_by("relay");
            let relayed = codec::deserialize(advertised.last().unwrap()).unwrap();
            assert_eq!(relayed.ttl, ttl - 1);
            assert_eq!(relayed.source, SourceToken(source));
            assert_eq!(relayed.message_id, id);
        });
    }
}
