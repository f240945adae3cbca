//! Property tests for the frame codec and the pending-call table
//!
//! - decode(encode(frame)) reproduces the frame for any id, action and payload
//! - decode never panics on arbitrary input
//! - every registered call resolves exactly once, whatever mix of replies,
//!   timeouts and close hits it

use std::time::Duration;

use ocpp_rpc::frame::{decode, encode_call, encode_error, encode_result};
use ocpp_rpc::{CallIdGenerator, CallIdStrategy, Frame, FrameError, Outcome, PendingTable};
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::time::Instant;

// ============================================================================
// Strategies
// ============================================================================

fn message_id() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,36}"
}

fn action() -> impl Strategy<Value = String> {
    "[A-Z][A-Za-z]{0,30}"
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// ============================================================================
// Codec
// ============================================================================

proptest! {
    #[test]
    fn call_survives_the_wire(id in message_id(), action in action(), payload in json_value()) {
        let frame = decode(&encode_call(&id, &action, &payload)).unwrap();
        prop_assert_eq!(frame, Frame::Call { message_id: id, action, payload });
    }

    #[test]
    fn result_survives_the_wire(id in message_id(), payload in json_value()) {
        let frame = decode(&encode_result(&id, &payload)).unwrap();
        prop_assert_eq!(frame, Frame::CallResult { message_id: id, payload });
    }

    #[test]
    fn error_survives_the_wire(
        id in message_id(),
        code in "[A-Za-z]{1,32}",
        description in "[ -~]{0,64}",
        details in json_value()
    ) {
        let frame = decode(&encode_error(&id, &code, &description, &details)).unwrap();
        prop_assert_eq!(frame, Frame::CallError { message_id: id, code, description, details });
    }

    /// Arbitrary text yields a frame or an error, never a panic
    #[test]
    fn decode_is_total(text in ".{0,128}") {
        let _ = decode(&text);
    }

    /// Type ids outside 2..=4 are reported as such
    #[test]
    fn unknown_type_ids_rejected(type_id in any::<i64>().prop_filter("known", |t| !(2..=4).contains(t))) {
        let text = json!([type_id, "id", {}]).to_string();
        prop_assert_eq!(decode(&text), Err(FrameError::UnknownMessageTypeId(type_id)));
    }
}

// ============================================================================
// Pending table
// ============================================================================

#[derive(Debug, Clone)]
enum Event {
    Reply(usize),
    Expire,
    Cancel(usize),
    Close,
}

fn event(calls: usize) -> impl Strategy<Value = Event> {
    prop_oneof![
        4 => (0..calls).prop_map(Event::Reply),
        1 => Just(Event::Expire),
        1 => (0..calls).prop_map(Event::Cancel),
        1 => Just(Event::Close),
    ]
}

proptest! {
    /// Every receiver sees at most one outcome, and cancelled calls see none
    #[test]
    fn calls_resolve_at_most_once(
        events in (1usize..12).prop_flat_map(|n| (Just(n), prop::collection::vec(event(n), 0..40)))
    ) {
        let (calls, events) = events;
        let table = PendingTable::new();
        let ids = CallIdGenerator::new(CallIdStrategy::Counter);
        let now = Instant::now();

        let mut registered = Vec::new();
        for i in 0..calls {
            // Half the calls are already past their deadline
            let deadline = if i % 2 == 0 { now } else { now + Duration::from_secs(60) };
            registered.push(table.register_next(&ids, "Heartbeat", deadline).unwrap());
        }

        let mut fired = vec![0usize; calls];
        let mut cancelled = vec![false; calls];
        for event in events {
            match event {
                Event::Reply(i) => {
                    if table.resolve(&registered[i].0, Outcome::Result(json!({}))) {
                        fired[i] += 1;
                    }
                }
                Event::Expire => {
                    for id in table.evict_expired(now) {
                        let i = registered.iter().position(|(r, _)| *r == id).unwrap();
                        fired[i] += 1;
                    }
                }
                Event::Cancel(i) => {
                    if table.cancel(&registered[i].0) {
                        cancelled[i] = true;
                    }
                }
                Event::Close => {
                    for (i, (id, _)) in registered.iter().enumerate() {
                        if table.contains(id) {
                            fired[i] += 1;
                        }
                    }
                    let before = table.len();
                    prop_assert_eq!(table.evict_all("closed"), before);
                    prop_assert!(table.is_empty());
                }
            }
        }

        for (i, (id, rx)) in registered.iter_mut().enumerate() {
            prop_assert!(fired[i] <= 1, "{} fired {} times", id, fired[i]);
            if cancelled[i] {
                prop_assert_eq!(fired[i], 0);
            }
            if fired[i] == 1 {
                prop_assert!(rx.try_recv().is_ok());
            }
        }
    }
}
