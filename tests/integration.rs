//! Integration tests for the message bus.

use crossbeam_channel::unbounded;
use messagebus::{
    AnyMessage, BusConfig, Class, DeadMessage, DispatchMode, Handler, HandlerResult, Handoff,
    Listener, Message, MessageBus, ReferenceMode,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_bus(workers: usize) -> MessageBus {
    MessageBus::with_config(BusConfig {
        worker_threads: workers,
        queue_capacity: 64,
        thread_name_prefix: "it-bus".into(),
        ..Default::default()
    })
    .unwrap()
}

fn wait_until_idle(bus: &MessageBus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while bus.has_pending_messages() {
        assert!(Instant::now() < deadline, "bus never became idle");
        thread::sleep(Duration::from_millis(1));
    }
}

// --- Message types ---

struct Animal;
struct Dog;

impl Message for Animal {}
impl Message for Dog {
    fn supertypes() -> Vec<Class> {
        vec![Class::of::<Animal>()]
    }
}

// --- Listeners ---

#[derive(Default)]
struct TextListener {
    received: Mutex<Vec<String>>,
}

impl Listener for TextListener {
    fn handlers() -> Vec<Handler<Self>> {
        vec![Handler::on::<String>("on_text", |l: &TextListener, text| {
            l.received.lock().push(text.clone())
        })]
    }
}

#[derive(Default)]
struct AnythingListener {
    received: Mutex<Vec<Class>>,
}

impl Listener for AnythingListener {
    fn handlers() -> Vec<Handler<Self>> {
        vec![Handler::new(
            "on_anything",
            vec![Class::object()],
            |l: &AnythingListener, args: &[AnyMessage]| -> HandlerResult {
                l.received.lock().push(args[0].class());
                Ok(())
            },
        )]
    }
}

#[derive(Default)]
struct DeadLetters {
    received: Mutex<Vec<DeadMessage>>,
}

impl Listener for DeadLetters {
    fn handlers() -> Vec<Handler<Self>> {
        vec![Handler::on::<DeadMessage>("on_dead", |l: &DeadLetters, dead| {
            l.received.lock().push(dead.clone())
        })]
    }
}

#[derive(Default)]
struct CountingListener {
    calls: AtomicUsize,
}

impl Listener for CountingListener {
    fn handlers() -> Vec<Handler<Self>> {
        vec![
            Handler::on::<u64>("count", |l: &CountingListener, _| {
                l.calls.fetch_add(1, Ordering::SeqCst);
            }),
            Handler::new(
                "count_any",
                vec![Class::object()],
                |l: &CountingListener, _: &[AnyMessage]| -> HandlerResult {
                    l.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ),
        ]
    }
}

// --- End-to-end Scenarios ---

#[test]
fn test_sync_publish_invokes_handler_before_returning() {
    let bus = test_bus(1);
    let listener = Arc::new(TextListener::default());
    bus.subscribe(&listener);

    bus.publish(String::from("hello"));

    assert_eq!(*listener.received.lock(), vec!["hello".to_string()]);
}

#[test]
fn test_supertype_and_exact_handlers() {
    let bus = test_bus(1);
    let anything = Arc::new(AnythingListener::default());
    let text = Arc::new(TextListener::default());
    bus.subscribe(&anything);
    bus.subscribe(&text);

    bus.publish(String::from("x"));
    assert_eq!(text.received.lock().len(), 1);
    assert_eq!(*anything.received.lock(), vec![Class::of::<String>()]);

    bus.publish(42i32);
    assert_eq!(text.received.lock().len(), 1);
    assert_eq!(
        *anything.received.lock(),
        vec![Class::of::<String>(), Class::of::<i32>()]
    );
}

#[test]
fn test_unhandled_message_reaches_dead_letters() {
    let bus = test_bus(1);
    let text = Arc::new(TextListener::default());
    let dead = Arc::new(DeadLetters::default());
    bus.subscribe(&text);
    bus.subscribe(&dead);

    bus.publish(42i32);

    let received = dead.received.lock();
    assert_eq!(received.len(), 1);
    let wrapped = received[0].messages();
    assert_eq!(wrapped.len(), 1);
    assert_eq!(wrapped[0].downcast_ref::<i32>(), Some(&42));
    assert!(text.received.lock().is_empty());
}

#[test]
fn test_handled_message_is_not_dead() {
    let bus = test_bus(1);
    let text = Arc::new(TextListener::default());
    let dead = Arc::new(DeadLetters::default());
    bus.subscribe(&text);
    bus.subscribe(&dead);

    bus.publish(String::from("handled"));
    assert!(dead.received.lock().is_empty());
}

#[test]
fn test_async_publish_from_many_threads() {
    const THREADS: usize = 4;
    const PER_THREAD: u64 = 2_500;

    let bus = Arc::new(test_bus(4));
    let listener = Arc::new(CountingListener::default());
    bus.subscribe(&listener);

    let publishers: Vec<_> = (0..THREADS)
        .map(|_| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    bus.publish_async(i).unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    wait_until_idle(&bus);

    // Two handlers match every u64.
    let expected = THREADS * PER_THREAD as usize * 2;
    assert_eq!(listener.calls.load(Ordering::SeqCst), expected);
}

// --- Delivery Semantics ---

#[test]
fn test_handlers_run_in_registration_order() {
    struct First(Arc<Mutex<Vec<&'static str>>>);
    struct Second(Arc<Mutex<Vec<&'static str>>>);

    impl Listener for First {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<u8>("first", |l: &First, _| l.0.lock().push("first"))]
        }
    }
    impl Listener for Second {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<u8>("second", |l: &Second, _| l.0.lock().push("second"))]
        }
    }

    let bus = test_bus(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(&Arc::new(First(Arc::clone(&log))));
    bus.subscribe(&Arc::new(Second(Arc::clone(&log))));

    bus.publish(1u8);
    bus.publish(2u8);

    assert_eq!(*log.lock(), vec!["first", "second", "first", "second"]);
}

#[test]
fn test_subscribe_twice_delivers_once() {
    let bus = test_bus(1);
    let listener = Arc::new(TextListener::default());
    bus.subscribe(&listener);
    bus.subscribe(&listener);

    bus.publish(String::from("once"));
    assert_eq!(listener.received.lock().len(), 1);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let bus = test_bus(1);
    let listener = Arc::new(TextListener::default());
    let other = Arc::new(TextListener::default());
    bus.subscribe(&listener);
    bus.subscribe(&other);

    bus.publish(String::from("both"));
    bus.unsubscribe(&listener);
    bus.publish(String::from("other only"));

    assert_eq!(listener.received.lock().len(), 1);
    assert_eq!(other.received.lock().len(), 2);

    // Unknown listeners are ignored.
    bus.unsubscribe(&Arc::new(TextListener::default()));
}

#[test]
fn test_supertype_handler_receives_subtype() {
    struct Zoo {
        seen: AtomicUsize,
    }

    impl Listener for Zoo {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::new(
                "on_animal",
                vec![Class::of::<Animal>()],
                |zoo: &Zoo, _: &[AnyMessage]| -> HandlerResult {
                    zoo.seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )]
        }
    }

    let bus = test_bus(1);
    let zoo = Arc::new(Zoo {
        seen: AtomicUsize::new(0),
    });
    bus.subscribe(&zoo);

    bus.publish(Animal);
    bus.publish(Dog);
    bus.publish(String::from("not an animal"));

    assert_eq!(zoo.seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_multi_argument_publication() {
    struct Pair {
        pairs: Mutex<Vec<(String, i32)>>,
    }

    impl Listener for Pair {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::new(
                "on_pair",
                vec![Class::of::<String>(), Class::of::<i32>()],
                |pair: &Pair, args: &[AnyMessage]| -> HandlerResult {
                    let name = args[0].downcast_ref::<String>().ok_or("not a string")?;
                    let value = args[1].downcast_ref::<i32>().ok_or("not an i32")?;
                    pair.pairs.lock().push((name.clone(), *value));
                    Ok(())
                },
            )]
        }
    }

    let bus = test_bus(1);
    let pair = Arc::new(Pair {
        pairs: Mutex::new(Vec::new()),
    });
    bus.subscribe(&pair);

    bus.publish_multi(&[AnyMessage::new(String::from("a")), AnyMessage::new(1i32)]);
    // Wrong order does not match.
    bus.publish_multi(&[AnyMessage::new(1i32), AnyMessage::new(String::from("b"))]);

    assert_eq!(*pair.pairs.lock(), vec![("a".to_string(), 1)]);
}

#[test]
fn test_vararg_publication() {
    struct Kennel {
        sizes: Mutex<Vec<usize>>,
    }

    impl Listener for Kennel {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::new(
                "on_animals",
                vec![Class::of::<u32>(), Class::of::<Animal>().array()],
                |kennel: &Kennel, args: &[AnyMessage]| -> HandlerResult {
                    let animals = args[1].as_array().ok_or("expected an array")?;
                    kennel.sizes.lock().push(animals.len());
                    Ok(())
                },
            )
            .accept_varargs()]
        }
    }

    let bus = test_bus(1);
    let kennel = Arc::new(Kennel {
        sizes: Mutex::new(Vec::new()),
    });
    bus.subscribe(&kennel);

    bus.publish_multi(&[
        AnyMessage::new(7u32),
        AnyMessage::new(Dog),
        AnyMessage::new(Animal),
        AnyMessage::new(Dog),
    ]);
    bus.publish_multi(&[AnyMessage::new(7u32), AnyMessage::array(vec![Dog, Dog])]);
    bus.publish_multi(&[AnyMessage::new(7u32)]);

    assert_eq!(*kennel.sizes.lock(), vec![3, 2, 0]);
}

#[test]
fn test_exact_dispatch_mode_ignores_supertypes() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        dispatch_mode: DispatchMode::Exact,
        ..Default::default()
    })
    .unwrap();
    let anything = Arc::new(AnythingListener::default());
    let text = Arc::new(TextListener::default());
    bus.subscribe(&anything);
    bus.subscribe(&text);

    bus.publish(String::from("exact"));

    assert_eq!(text.received.lock().len(), 1);
    assert!(anything.received.lock().is_empty());
}

#[test]
fn test_synchronized_handler_is_serialized() {
    struct Critical {
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Listener for Critical {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<u16>("critical", |c: &Critical, _| {
                let now = c.inside.fetch_add(1, Ordering::SeqCst) + 1;
                c.max_inside.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
                c.inside.fetch_sub(1, Ordering::SeqCst);
                c.calls.fetch_add(1, Ordering::SeqCst);
            })
            .synchronized()]
        }
    }

    let bus = test_bus(4);
    let critical = Arc::new(Critical {
        inside: AtomicUsize::new(0),
        max_inside: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    bus.subscribe(&critical);

    for i in 0..200u16 {
        bus.publish_async(i).unwrap();
    }
    wait_until_idle(&bus);

    assert_eq!(critical.calls.load(Ordering::SeqCst), 200);
    assert_eq!(critical.max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_runs_on_worker_threads() {
    struct ThreadNames {
        names: crossbeam_channel::Sender<String>,
    }

    impl Listener for ThreadNames {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<u64>("record", |l: &ThreadNames, _| {
                let name = thread::current().name().unwrap_or_default().to_string();
                let _ = l.names.send(name);
            })]
        }
    }

    let bus = test_bus(2);
    let (tx, rx) = unbounded();
    bus.subscribe(&Arc::new(ThreadNames { names: tx }));

    for i in 0..20u64 {
        bus.publish_async(i).unwrap();
    }

    for _ in 0..20 {
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.starts_with("it-bus-"), "unexpected thread {}", name);
    }
}

#[test]
fn test_transfer_handoff_delivers_everything() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 2,
        queue_capacity: 4,
        handoff: Handoff::Transfer,
        ..Default::default()
    })
    .unwrap();
    let listener = Arc::new(CountingListener::default());
    bus.subscribe(&listener);

    for i in 0..500u64 {
        bus.publish_async(i).unwrap();
    }
    wait_until_idle(&bus);

    assert_eq!(listener.calls.load(Ordering::SeqCst), 1_000);
}

#[test]
fn test_shutdown_drains_queued_publications() {
    let bus = test_bus(2);
    let listener = Arc::new(CountingListener::default());
    bus.subscribe(&listener);

    for i in 0..1_000u64 {
        bus.publish_async(i).unwrap();
    }
    bus.shutdown();

    assert_eq!(listener.calls.load(Ordering::SeqCst), 2_000);
    assert!(!bus.has_pending_messages());

    // Synchronous publication keeps working.
    bus.publish(1u64);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 2_002);
}

// --- Reference Modes ---

#[test]
fn test_weak_mode_does_not_keep_listeners_alive() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        subscription_mode: ReferenceMode::Weak,
        ..Default::default()
    })
    .unwrap();

    let listener = Arc::new(TextListener::default());
    let dead = Arc::new(DeadLetters::default());
    bus.subscribe(&listener);
    bus.subscribe(&dead);

    bus.publish(String::from("alive"));
    assert_eq!(listener.received.lock().len(), 1);

    let weak = Arc::downgrade(&listener);
    drop(listener);
    assert!(weak.upgrade().is_none());

    bus.publish(String::from("gone"));
    assert_eq!(dead.received.lock().len(), 1);
}

#[test]
fn test_listener_can_pin_strong_mode() {
    struct Pinned {
        calls: Arc<AtomicUsize>,
    }

    impl Listener for Pinned {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<i16>("pinned", |p: &Pinned, _| {
                p.calls.fetch_add(1, Ordering::SeqCst);
            })]
        }

        fn reference_mode() -> Option<ReferenceMode> {
            Some(ReferenceMode::Strong)
        }
    }

    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        subscription_mode: ReferenceMode::Weak,
        ..Default::default()
    })
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe(&Arc::new(Pinned {
        calls: Arc::clone(&calls),
    }));

    bus.publish(3i16);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// --- Shared Executor ---

#[test]
fn test_shared_executor_routes_to_own_listeners() {
    let bus = test_bus(2);
    let shared = bus.clone_with_shared_executor();

    let on_bus = Arc::new(CountingListener::default());
    let on_shared = Arc::new(CountingListener::default());
    bus.subscribe(&on_bus);
    shared.subscribe(&on_shared);

    for i in 0..100u64 {
        bus.publish_async(i).unwrap();
        shared.publish_async(i).unwrap();
    }
    wait_until_idle(&bus);
    wait_until_idle(&shared);

    assert_eq!(on_bus.calls.load(Ordering::SeqCst), 200);
    assert_eq!(on_shared.calls.load(Ordering::SeqCst), 200);

    shared.shutdown();
    assert!(matches!(
        shared.publish_async(1u64),
        Err(messagebus::BusError::ShutDown)
    ));
    assert!(bus.publish_async(1u64).is_ok());
}
