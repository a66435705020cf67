// Property-based tests for the relay protocol
// Dedup idempotence and read-receipt parsing

use chat_mesh::control::{parse_acknowledgement, parse_read_receipt};
use chat_mesh::{
    Airspace, ConnectionManager, DropReason, Frame, Inbound, Message, MessageRouter,
    SeenMessageCache,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Feeding the same frame N times yields exactly one delivery or relay;
    /// every later copy is dropped as a duplicate.
    #[test]
    fn prop_dedup_idempotence(
        id in any::<u32>(),
        copies in 1usize..12,
        addressed_to_self in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();

        rt.block_on(async {
            let airspace = Airspace::new();
            let radio = airspace.radio("bob#0002");
            let connections = Arc::new(ConnectionManager::new());
            let router = MessageRouter::new(
                "bob#0002".into(),
                Arc::new(SeenMessageCache::new(Duration::from_secs(300), 1000)),
                connections.clone(),
                Arc::new(radio.clone()),
            );

            let mut links = Vec::new();
            for name in ["alice#0001", "carol#0003"] {
                let (link, _) = airspace.connect(&radio, &airspace.radio(name)).await.unwrap();
                connections.link_established(link).await;
                links.push(link);
            }

            let receiver = if addressed_to_self { "bob#0002" } else { "dave#0004" };
            let mut message = Message::regular("alice#0001".into(), receiver.into(), "x");
            message.id = id;
            let frame = Frame::Message(message).encode().unwrap();

            let mut acted = 0;
            let mut duplicates = 0;
            for copy in 0..copies {
                match router.handle_frame(links[copy % links.len()], &frame).await {
                    Inbound::Delivered(_) | Inbound::Relayed { .. } => acted += 1,
                    Inbound::Dropped(DropReason::Duplicate(dropped)) => {
                        assert_eq!(dropped, id);
                        duplicates += 1;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }

            assert_eq!(acted, 1);
            assert_eq!(duplicates, copies - 1);
            assert!(router.relay_count() <= 1);
        });
    }

    /// Any list of ids written as `READ/<id>/.../` parses back to the same list
    #[test]
    fn prop_read_receipt_lists_every_id(ids in prop::collection::vec(any::<u32>(), 0..20)) {
        let mut text = String::from("READ/");
        for id in &ids {
            text.push_str(&format!("{}/", id));
        }

        prop_assert_eq!(parse_read_receipt(&text).unwrap(), ids);
    }

    /// Text that does not start with the READ token is never a read receipt
    #[test]
    fn prop_non_read_prefix_rejected(prefix in "[A-Za-z]{0,6}", id in any::<u32>()) {
        prop_assume!(prefix != "READ");
        let text = format!("{}/{}/", prefix, id);
        prop_assert!(parse_read_receipt(&text).is_err());
    }

    /// Acknowledgements accept exactly two fields
    #[test]
    fn prop_acknowledgement_field_count(id in any::<u32>(), extra in 1usize..4) {
        prop_assert_eq!(parse_acknowledgement(&format!("ACK/{}", id)).unwrap(), id);

        let mut text = format!("ACK/{}", id);
        for _ in 0..extra {
            text.push_str("/1");
        }
        prop_assert!(parse_acknowledgement(&text).is_err());
    }
}
