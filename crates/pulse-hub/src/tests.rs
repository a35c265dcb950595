//! Unit tests for the event hub and shared-state registries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::{
    EventHub, EventPreprocessor, Extension, ExtensionApi, HubError, Resolution,
    SharedStateStatus, StateNamespace,
};
use pulse_types::{Event, EventSource, EventType};

/// Polls `predicate` every 10 ms until it returns true or `timeout` elapses.
async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

/// Extension that records delivered seqs and hands its api to the test.
struct TestExtension {
    name: &'static str,
    api_slot: Arc<Mutex<Option<ExtensionApi>>>,
    seen: Arc<Mutex<Vec<u64>>>,
    ready: Arc<AtomicBool>,
    handler_delay: Duration,
}

impl TestExtension {
    fn new(name: &'static str) -> (Self, Arc<Mutex<Option<ExtensionApi>>>, Arc<Mutex<Vec<u64>>>) {
        let api_slot = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                name,
                api_slot: Arc::clone(&api_slot),
                seen: Arc::clone(&seen),
                ready: Arc::new(AtomicBool::new(true)),
                handler_delay: Duration::ZERO,
            },
            api_slot,
            seen,
        )
    }
}

impl Extension for TestExtension {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn on_registered(&mut self, api: &ExtensionApi) {
        *self.api_slot.lock().unwrap() = Some(api.clone());
        let seen = Arc::clone(&self.seen);
        let delay = self.handler_delay;
        // Lifecycle-only so the hub's own state-change events stay out of
        // the recorded stream.
        api.register_listener(EventType::Lifecycle, EventSource::Wildcard, move |event| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            seen.lock().unwrap().push(event.seq());
        });
    }

    fn ready_for_event(&self, _event: &Event) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

fn lifecycle_event(n: u32) -> Event {
    Event::new(
        format!("event-{n}"),
        EventType::Lifecycle,
        EventSource::ResponseContent,
    )
}

// ── Delivery and ordering ────────────────────────────────────────────

#[tokio::test]
async fn events_deliver_in_dispatch_order_per_extension() {
    let hub = EventHub::new();
    let (ext, _api, seen) = TestExtension::new("orderly");
    let ext = TestExtension {
        handler_delay: Duration::from_millis(3),
        ..ext
    };
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    hub.start();

    for n in 0..10 {
        hub.dispatch(lifecycle_event(n)).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(3), || seen.lock().unwrap().len() >= 10).await,
        "all events should deliver"
    );
    let seqs = seen.lock().unwrap().clone();
    let expected_sorted: Vec<u64> = {
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted
    };
    assert_eq!(seqs, expected_sorted, "delivery must follow seq order");
}

#[tokio::test]
async fn delivery_waits_for_start() {
    let hub = EventHub::new();
    let (ext, _api, seen) = TestExtension::new("gated");
    hub.register_extension(move || Box::new(ext)).await.unwrap();

    hub.dispatch(lifecycle_event(0)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(seen.lock().unwrap().is_empty(), "no delivery before start");

    hub.start();
    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "queued event should deliver after start"
    );
}

#[tokio::test]
async fn listeners_match_on_type_and_source() {
    let hub = EventHub::new();
    let matched = Arc::new(Mutex::new(Vec::<String>::new()));

    struct SelectiveExtension {
        matched: Arc<Mutex<Vec<String>>>,
    }
    impl Extension for SelectiveExtension {
        fn name(&self) -> &str {
            "selective"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn on_registered(&mut self, api: &ExtensionApi) {
            let exact = Arc::clone(&self.matched);
            api.register_listener(
                EventType::Lifecycle,
                EventSource::ResponseContent,
                move |e| exact.lock().unwrap().push(format!("exact:{}", e.name())),
            );
            let any_source = Arc::clone(&self.matched);
            api.register_listener(EventType::Configuration, EventSource::Wildcard, move |e| {
                any_source
                    .lock()
                    .unwrap()
                    .push(format!("config:{}", e.name()))
            });
        }
    }

    let slot = Arc::clone(&matched);
    hub.register_extension(move || Box::new(SelectiveExtension { matched: slot }))
        .await
        .unwrap();
    hub.start();

    hub.dispatch(lifecycle_event(1)).unwrap();
    hub.dispatch(Event::new(
        "cfg",
        EventType::Configuration,
        EventSource::RequestContent,
    ))
    .unwrap();
    // Matches neither listener.
    hub.dispatch(Event::new(
        "sig",
        EventType::Signal,
        EventSource::RequestContent,
    ))
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || matched.lock().unwrap().len() >= 2).await,
        "matching events should deliver"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    let matched = matched.lock().unwrap().clone();
    assert_eq!(matched, vec!["exact:event-1", "config:cfg"]);
}

#[tokio::test]
async fn panicking_listener_is_isolated() {
    let hub = EventHub::new();
    let survived = Arc::new(Mutex::new(Vec::<u64>::new()));

    struct PanickyExtension {
        survived: Arc<Mutex<Vec<u64>>>,
    }
    impl Extension for PanickyExtension {
        fn name(&self) -> &str {
            "panicky"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn on_registered(&mut self, api: &ExtensionApi) {
            api.register_listener(EventType::Wildcard, EventSource::Wildcard, |_| {
                panic!("listener blew up")
            });
            let survived = Arc::clone(&self.survived);
            api.register_listener(EventType::Wildcard, EventSource::Wildcard, move |e| {
                survived.lock().unwrap().push(e.seq())
            });
        }
    }

    let slot = Arc::clone(&survived);
    hub.register_extension(move || Box::new(PanickyExtension { survived: slot }))
        .await
        .unwrap();
    hub.start();

    hub.dispatch(lifecycle_event(1)).unwrap();
    hub.dispatch(lifecycle_event(2)).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || survived.lock().unwrap().len() >= 2).await,
        "the sibling listener should keep receiving events"
    );
}

#[tokio::test]
async fn stop_events_pauses_one_extension_only() {
    let hub = EventHub::new();
    let (slow, slow_api, slow_seen) = TestExtension::new("paused");
    let (fast, _fast_api, fast_seen) = TestExtension::new("flowing");
    hub.register_extension(move || Box::new(slow)).await.unwrap();
    hub.register_extension(move || Box::new(fast)).await.unwrap();
    hub.start();

    let api = slow_api.lock().unwrap().clone().unwrap();
    api.stop_events();

    hub.dispatch(lifecycle_event(1)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || !fast_seen.lock().unwrap().is_empty()).await,
        "unpaused extension keeps flowing"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(slow_seen.lock().unwrap().is_empty(), "paused extension holds");

    api.start_events();
    assert!(
        wait_until(Duration::from_secs(2), || !slow_seen.lock().unwrap().is_empty()).await,
        "held event should deliver on resume"
    );
}

// ── Extension lifecycle ──────────────────────────────────────────────

#[tokio::test]
async fn duplicate_registration_fails() {
    let hub = EventHub::new();
    let (ext, _, _) = TestExtension::new("twin");
    hub.register_extension(move || Box::new(ext)).await.unwrap();

    let (again, _, _) = TestExtension::new("twin");
    let err = hub
        .register_extension(move || Box::new(again))
        .await
        .expect_err("duplicate name should fail");
    assert!(matches!(err, HubError::AlreadyRegistered(name) if name == "twin"));
}

#[tokio::test]
async fn unregister_removes_state_and_stops_delivery() {
    let hub = EventHub::new();
    let (ext, api_slot, seen) = TestExtension::new("leaving");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    hub.start();

    let api = api_slot.lock().unwrap().clone().unwrap();
    api.create_shared_state(object(json!({"key": "value"})), None)
        .unwrap();
    assert_eq!(
        hub.get_shared_state(StateNamespace::Standard, "leaving", None, Resolution::Any)
            .status,
        SharedStateStatus::Set
    );

    hub.unregister_extension("leaving").await.unwrap();

    assert_eq!(
        hub.get_shared_state(StateNamespace::Standard, "leaving", None, Resolution::Any)
            .status,
        SharedStateStatus::None,
        "unregistered owner reads as none"
    );

    let before = seen.lock().unwrap().len();
    hub.dispatch(lifecycle_event(9)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(seen.lock().unwrap().len(), before, "no delivery after unregister");

    let err = hub
        .unregister_extension("leaving")
        .await
        .expect_err("second unregister should fail");
    assert!(matches!(err, HubError::NotRegistered(_)));
}

#[tokio::test]
async fn hub_publishes_extension_registry_as_shared_state() {
    let hub = EventHub::new();
    let (ext, _, _) = TestExtension::new("listed");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    hub.start();

    let result = hub.get_shared_state(
        StateNamespace::Standard,
        pulse_types::EVENT_HUB_OWNER,
        None,
        Resolution::Any,
    );
    assert_eq!(result.status, SharedStateStatus::Set);
    let value = result.value.unwrap();
    let listed = value
        .get("extensions")
        .and_then(|e| e.get("listed"))
        .expect("registered extension should be listed");
    assert_eq!(listed.get("version"), Some(&json!("1.0.0")));
}

// ── Shared state ─────────────────────────────────────────────────────

#[tokio::test]
async fn shared_state_reads_greatest_seq_at_or_before() {
    let hub = EventHub::new();
    let (ext, api_slot, _) = TestExtension::new("owner");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    let api = api_slot.lock().unwrap().clone().unwrap();

    let mut at2 = lifecycle_event(2);
    at2.assign_seq(2);
    let mut at5 = lifecycle_event(5);
    at5.assign_seq(5);
    api.create_shared_state(object(json!({"v": 2})), Some(&at2))
        .unwrap();
    api.create_shared_state(object(json!({"v": 5})), Some(&at5))
        .unwrap();

    let mut probe = lifecycle_event(0);
    for (seq, expected) in [(1, None), (2, Some(2)), (4, Some(2)), (5, Some(5)), (9, Some(5))] {
        probe.assign_seq(seq);
        let result = api.get_shared_state("owner", Some(&probe), Resolution::Any);
        match expected {
            Some(v) => {
                assert_eq!(result.status, SharedStateStatus::Set);
                assert_eq!(result.value.unwrap().get("v"), Some(&json!(v)));
            }
            None => assert_eq!(result.status, SharedStateStatus::None),
        }
    }
}

#[tokio::test]
async fn shared_state_rejects_out_of_order_writes() {
    let hub = EventHub::new();
    let (ext, api_slot, _) = TestExtension::new("strict");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    let api = api_slot.lock().unwrap().clone().unwrap();

    let mut at4 = lifecycle_event(4);
    at4.assign_seq(4);
    api.create_shared_state(object(json!({})), Some(&at4)).unwrap();

    // Same seq again.
    let err = api
        .create_shared_state(object(json!({})), Some(&at4))
        .expect_err("duplicate seq should fail");
    assert!(matches!(err, HubError::DuplicateSeq { seq: 4, .. }));

    // Earlier seq: histories are append-only.
    let mut at3 = lifecycle_event(3);
    at3.assign_seq(3);
    let err = api
        .create_shared_state(object(json!({})), Some(&at3))
        .expect_err("earlier seq should fail");
    assert!(matches!(err, HubError::DuplicateSeq { .. }));
}

#[tokio::test]
async fn pending_state_resolves_exactly_once() {
    let hub = EventHub::new();
    let (ext, api_slot, _) = TestExtension::new("pending");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    let api = api_slot.lock().unwrap().clone().unwrap();

    let mut at1 = lifecycle_event(1);
    at1.assign_seq(1);
    let resolver = api.create_pending_shared_state(Some(&at1)).unwrap();

    let read = api.get_shared_state("pending", Some(&at1), Resolution::Any);
    assert_eq!(read.status, SharedStateStatus::Pending);
    assert!(read.value.is_none());

    resolver.resolve(object(json!({"done": true}))).unwrap();
    let read = api.get_shared_state("pending", Some(&at1), Resolution::Any);
    assert_eq!(read.status, SharedStateStatus::Set);
    assert_eq!(read.value.unwrap().get("done"), Some(&json!(true)));
}

#[tokio::test]
async fn barrier_read_surfaces_earlier_pending() {
    let hub = EventHub::new();
    let (ext, api_slot, _) = TestExtension::new("barrier");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    let api = api_slot.lock().unwrap().clone().unwrap();

    let mut at2 = lifecycle_event(2);
    at2.assign_seq(2);
    let resolver = api.create_pending_shared_state(Some(&at2)).unwrap();

    let mut at4 = lifecycle_event(4);
    at4.assign_seq(4);
    api.create_shared_state(object(json!({"v": 4})), Some(&at4))
        .unwrap();

    let mut probe = lifecycle_event(0);
    probe.assign_seq(5);

    // Any: the governing entry at seq 4 is set.
    let read = api.get_shared_state("barrier", Some(&probe), Resolution::Any);
    assert_eq!(read.status, SharedStateStatus::Set);

    // Barrier: the unresolved entry at seq 2 wins.
    let read = api.get_shared_state("barrier", Some(&probe), Resolution::Barrier);
    assert_eq!(read.status, SharedStateStatus::Pending);

    resolver.resolve(object(json!({"v": 2}))).unwrap();
    let read = api.get_shared_state("barrier", Some(&probe), Resolution::Barrier);
    assert_eq!(read.status, SharedStateStatus::Set);
    assert_eq!(read.value.unwrap().get("v"), Some(&json!(4)));
}

#[tokio::test]
async fn xdm_and_standard_registries_are_parallel() {
    let hub = EventHub::new();
    let (ext, api_slot, _) = TestExtension::new("dual");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    let api = api_slot.lock().unwrap().clone().unwrap();

    let mut at1 = lifecycle_event(1);
    at1.assign_seq(1);
    api.create_shared_state(object(json!({"ns": "standard"})), Some(&at1))
        .unwrap();
    api.create_xdm_shared_state(object(json!({"ns": "xdm"})), Some(&at1))
        .unwrap();

    let standard = api.get_shared_state("dual", Some(&at1), Resolution::Any);
    let xdm = api.get_xdm_shared_state("dual", Some(&at1), Resolution::Any);
    assert_eq!(standard.value.unwrap().get("ns"), Some(&json!("standard")));
    assert_eq!(xdm.value.unwrap().get("ns"), Some(&json!("xdm")));
}

// ── Readiness gate ───────────────────────────────────────────────────

#[tokio::test]
async fn unready_extension_holds_events_until_state_changes() {
    let hub = EventHub::new();
    let (ext, _api, seen) = TestExtension::new("waiting");
    let ready = Arc::clone(&ext.ready);
    ready.store(false, Ordering::SeqCst);
    hub.register_extension(move || Box::new(ext)).await.unwrap();

    let (other, other_api, _) = TestExtension::new("provider");
    hub.register_extension(move || Box::new(other)).await.unwrap();
    hub.start();

    hub.dispatch(lifecycle_event(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(seen.lock().unwrap().is_empty(), "held while not ready");

    // Becoming ready plus any shared-state commit releases the hold.
    ready.store(true, Ordering::SeqCst);
    let api = other_api.lock().unwrap().clone().unwrap();
    api.create_shared_state(object(json!({"now": "ready"})), None)
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "held event should deliver once ready"
    );
}

// ── Response listeners ───────────────────────────────────────────────

#[tokio::test]
async fn response_listener_fires_on_matching_response() {
    let hub = EventHub::new();
    let (ext, _, _) = TestExtension::new("responder");
    hub.register_extension(move || Box::new(ext)).await.unwrap();
    hub.start();

    let trigger = Event::new("ask", EventType::Identity, EventSource::RequestContent);
    let answer = Arc::new(Mutex::new(None::<Option<String>>));

    let slot = Arc::clone(&answer);
    hub.register_response_listener(&trigger, Duration::from_secs(5), move |response| {
        *slot.lock().unwrap() = Some(response.map(|e| e.name().to_string()));
    });

    let response = Event::new("answer", EventType::Identity, EventSource::ResponseContent)
        .response_to(&trigger);
    hub.dispatch(trigger).unwrap();
    hub.dispatch(response).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || answer.lock().unwrap().is_some()).await,
        "response listener should fire"
    );
    assert_eq!(
        answer.lock().unwrap().clone(),
        Some(Some("answer".to_string()))
    );
}

#[tokio::test]
async fn response_listener_times_out_with_none() {
    let hub = EventHub::new();
    hub.start();

    let trigger = Event::new("ask", EventType::Identity, EventSource::RequestContent);
    let answer = Arc::new(Mutex::new(None::<Option<String>>));

    let slot = Arc::clone(&answer);
    hub.register_response_listener(&trigger, Duration::from_millis(50), move |response| {
        *slot.lock().unwrap() = Some(response.map(|e| e.name().to_string()));
    });

    assert!(
        wait_until(Duration::from_secs(2), || answer.lock().unwrap().is_some()).await,
        "timeout should fire the handler"
    );
    assert_eq!(answer.lock().unwrap().clone(), Some(None));
}

#[tokio::test]
async fn response_listener_fires_once_for_first_response() {
    let hub = EventHub::new();
    hub.start();

    let trigger = Event::new("ask", EventType::Identity, EventSource::RequestContent);
    let calls = Arc::new(Mutex::new(0usize));

    let slot = Arc::clone(&calls);
    hub.register_response_listener(&trigger, Duration::from_secs(5), move |_| {
        *slot.lock().unwrap() += 1;
    });

    let first = Event::new("a1", EventType::Identity, EventSource::ResponseContent)
        .response_to(&trigger);
    let second = Event::new("a2", EventType::Identity, EventSource::ResponseContent)
        .response_to(&trigger);
    hub.dispatch(first).unwrap();
    hub.dispatch(second).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || *calls.lock().unwrap() >= 1).await,
        "listener should fire"
    );
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(*calls.lock().unwrap(), 1, "one-shot listener fires once");
}

// ── Pre-processors ───────────────────────────────────────────────────

#[tokio::test]
async fn preprocessor_rewrites_event_data_before_delivery() {
    struct Stamper;
    impl EventPreprocessor for Stamper {
        fn process(&self, mut event: Event) -> Event {
            let mut data = event.data().clone();
            pulse_types::data::merge(&mut data, &json!({"stamped": true}), true);
            event.replace_data(data);
            event
        }
    }

    let hub = EventHub::new();
    hub.register_preprocessor(Arc::new(Stamper));

    let stamped = Arc::new(Mutex::new(Vec::<bool>::new()));
    struct Observer {
        stamped: Arc<Mutex<Vec<bool>>>,
    }
    impl Extension for Observer {
        fn name(&self) -> &str {
            "observer"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn on_registered(&mut self, api: &ExtensionApi) {
            let stamped = Arc::clone(&self.stamped);
            api.register_listener(EventType::Lifecycle, EventSource::Wildcard, move |e| {
                stamped
                    .lock()
                    .unwrap()
                    .push(e.data().get("stamped") == Some(&json!(true)));
            });
        }
    }

    let slot = Arc::clone(&stamped);
    hub.register_extension(move || Box::new(Observer { stamped: slot }))
        .await
        .unwrap();
    hub.start();

    hub.dispatch(lifecycle_event(1)).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || !stamped.lock().unwrap().is_empty()).await,
        "event should deliver"
    );
    assert_eq!(*stamped.lock().unwrap(), vec![true]);
}
