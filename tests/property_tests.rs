//! Property-based tests: allocator uniqueness under arbitrary
//! release patterns, frame codec round trips, decoder robustness on
//! arbitrary bytes, and resolver chain inverses.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tether_core::{
    ContextId, IdAllocator, Kind, Origin, ProtocolMessage, RemoteFailure, RequestId, ServiceId,
    ServiceInfo, StreamId,
};
use tether_marshal::{
    Item, MarkerKind, MarshalError, Marshaller, MarshallerConfig, ObjectResolver, ResolverChain,
};
use tether_transport::{encode_frame, FrameDecoder};

fn arb_item() -> impl Strategy<Value = Item> {
    let leaf = prop_oneof![
        Just(Item::Null),
        any::<bool>().prop_map(Item::Bool),
        any::<i64>().prop_map(Item::I64),
        // finite values only; NaN breaks equality-based round-trip checks
        any::<i32>().prop_map(|v| Item::F64(f64::from(v))),
        "[a-z0-9 ]{0,12}".prop_map(Item::Text),
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(Item::Bytes),
        (any::<bool>(), any::<u32>()).prop_map(|(stream, id)| Item::Marker {
            kind: if stream { MarkerKind::Stream } else { MarkerKind::Proxy },
            id,
        }),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Item::Seq),
            proptest::collection::vec((inner.clone(), inner), 0..3).prop_map(Item::Map),
        ]
    })
}

fn arb_origin() -> impl Strategy<Value = Origin> + Clone {
    any::<bool>().prop_map(|local| if local { Origin::Local } else { Origin::Remote })
}

fn arb_message() -> impl Strategy<Value = ProtocolMessage> {
    let context = (arb_origin(), 0..1024u32).prop_map(|(o, v)| ContextId::from_parts(o, v));
    let request = (arb_origin(), 0..1024u32).prop_map(|(o, v)| RequestId::from_parts(o, v));
    let service = (arb_origin(), 0..1024u32).prop_map(|(o, v)| ServiceId::from_parts(o, v));
    let stream = (arb_origin(), 0..1024u32).prop_map(|(o, v)| StreamId::from_parts(o, v));
    prop_oneof![
        (service.clone(), "[A-Za-z]{1,8}", "[A-Za-z]{1,8}").prop_map(|(service, req, rep)| {
            ProtocolMessage::OpenService { service, info: ServiceInfo::new(req, rep) }
        }),
        (context.clone(), service).prop_map(|(context, service)| ProtocolMessage::OpenContext {
            context,
            service
        }),
        (context.clone(), request.clone(), arb_item()).prop_map(|(context, request, payload)| {
            ProtocolMessage::Request { context, request, payload }
        }),
        (context.clone(), request.clone(), arb_item()).prop_map(|(context, request, payload)| {
            ProtocolMessage::Reply { context, request, payload }
        }),
        (context.clone(), request, "[a-z ]{0,24}").prop_map(|(context, request, message)| {
            ProtocolMessage::ExceptionReply { context, request, failure: RemoteFailure::new(message) }
        }),
        (stream.clone(), arb_item())
            .prop_map(|(stream, payload)| ProtocolMessage::StreamData { stream, payload }),
        (stream, context).prop_map(|(stream, context)| ProtocolMessage::OpenStream {
            stream,
            context
        }),
        Just(ProtocolMessage::Ping),
        Just(ProtocolMessage::CloseSession),
    ]
}

proptest! {
    #[test]
    fn prop_allocator_uniqueness_under_release_patterns(
        release_mask in proptest::collection::vec(any::<bool>(), 32..96),
    ) {
        let alloc = IdAllocator::new();
        let mut held = Vec::new();
        for &release in &release_mask {
            let id = alloc.allocate(Kind::Request).unwrap();
            if release {
                alloc.release(id);
            } else {
                held.push(id);
            }
        }
        // Every value allocated again after the releases must avoid the
        // held set.
        let held_values: HashSet<u32> = held.iter().map(|id| id.value()).collect();
        for _ in 0..16 {
            let id = alloc.allocate(Kind::Request).unwrap();
            prop_assert!(!held_values.contains(&id.value()));
            alloc.release(id);
        }
        prop_assert_eq!(alloc.live_count(Kind::Request), held.len() as u32);
    }

    #[test]
    fn prop_frame_round_trip(msg in arb_message()) {
        let frame = encode_frame(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        prop_assert_eq!(decoder.next_frame().unwrap(), Some(msg));
        prop_assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn prop_frame_round_trip_survives_arbitrary_splits(
        msg in arb_message(),
        split in 0..64usize,
    ) {
        let frame = encode_frame(&msg).unwrap();
        let cut = split.min(frame.len());
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..cut]);
        let early = decoder.next_frame().unwrap();
        if cut < frame.len() {
            prop_assert_eq!(early, None);
            decoder.extend(&frame[cut..]);
        }
        prop_assert_eq!(decoder.next_frame().unwrap(), Some(msg));
    }

    #[test]
    fn prop_decoder_never_panics_on_garbage(
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        // Any outcome is acceptable except a panic.
        loop {
            match decoder.next_frame() {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }

    #[test]
    fn prop_resolver_chain_is_its_own_inverse(items in proptest::collection::vec(arb_item(), 0..6)) {
        // Shift-then-mask does not commute with mask-then-shift, so the
        // round trip only holds because reads run the chain in reverse.
        struct IntShifter;
        impl ObjectResolver for IntShifter {
            fn substitute_on_write(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::I64(v) => Ok(Item::I64(v.wrapping_add(1))),
                    other => Ok(other),
                }
            }
            fn restore_on_read(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::I64(v) => Ok(Item::I64(v.wrapping_sub(1))),
                    other => Ok(other),
                }
            }
        }
        struct IntMasker;
        impl ObjectResolver for IntMasker {
            fn substitute_on_write(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::I64(v) => Ok(Item::I64(v ^ 0x5A5A)),
                    other => Ok(other),
                }
            }
            fn restore_on_read(&self, item: Item) -> Result<Item, MarshalError> {
                match item {
                    Item::I64(v) => Ok(Item::I64(v ^ 0x5A5A)),
                    other => Ok(other),
                }
            }
        }

        let chain = ResolverChain::new()
            .with(Arc::new(IntShifter))
            .with(Arc::new(IntMasker));
        let marshaller = Marshaller::new(MarshallerConfig::default(), chain);

        let original = Item::Seq(items);
        let written = marshaller.apply_write(original.clone()).unwrap();
        let restored = marshaller.apply_read(written).unwrap();
        prop_assert_eq!(restored, original);
    }
}
