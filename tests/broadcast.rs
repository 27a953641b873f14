//! Broadcast sink: ordering, serialization, and subscription lifecycle.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::*};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hypha::sync::Broadcast;

#[test]
fn slots_run_in_subscription_order() {
    let sink = Broadcast::<u32>::new();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let l1 = log.clone();
    let _first = sink.connect(move |n: &u32| l1.lock().push(("first", *n)));
    let l2 = log.clone();
    let _second = sink.connect(move |n: &u32| l2.lock().push(("second", *n)));

    sink.notify(&1);
    sink.notify(&2);

    assert_eq!(
        *log.lock(),
        [("first", 1), ("second", 1), ("first", 2), ("second", 2)]
    );
}

#[test]
fn concurrent_notifies_never_interleave() {
    let sink = Arc::new(Broadcast::<u32>::new());

    // slot one records the event, slot two checks it saw the same event
    // with nothing in between; interleaved notifications would trip the
    // asserts
    let current = Arc::new(parking_lot::Mutex::new(None));
    let c1 = current.clone();
    let _first = sink.connect(move |n: &u32| {
        let mut cur = c1.lock();
        assert!(cur.is_none(), "two notifications ran their slots at once");
        *cur = Some(*n);
        thread::sleep(Duration::from_micros(50));
    });
    let c2 = current.clone();
    let _second = sink.connect(move |n: &u32| {
        assert_eq!(c2.lock().take(), Some(*n));
    });

    let threads: Vec<_> = (0..4_u32)
        .map(|t| {
            let sink = sink.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    sink.notify(&(t * 100 + i));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn token_drop_disconnects_immediately() {
    let sink = Broadcast::<()>::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let token = sink.connect(move |_| {
        h.fetch_add(1, SeqCst);
    });

    sink.notify(&());
    assert_eq!(hits.load(SeqCst), 1);

    token.disconnect();
    sink.notify(&());
    assert_eq!(hits.load(SeqCst), 1);
}

#[test]
fn slot_connected_during_notify_runs_next_time() {
    // a unique event type keeps this test's global instance to itself
    struct Connected(#[allow(dead_code)] u32);

    let sink = Broadcast::<Connected>::global();
    let added_calls = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let once = Arc::new(AtomicBool::new(false));
    let calls = added_calls.clone();
    let tokens2 = tokens.clone();
    let _outer = sink.connect(move |_| {
        if !once.swap(true, SeqCst) {
            let calls = calls.clone();
            tokens2
                .lock()
                .push(sink.connect(move |_| {
                    calls.fetch_add(1, SeqCst);
                }));
        }
    });

    sink.notify(&Connected(1));
    // the slot added above was not run by the notify that added it
    assert_eq!(added_calls.load(SeqCst), 0);

    sink.notify(&Connected(2));
    assert_eq!(added_calls.load(SeqCst), 1);
}

#[test]
fn panicking_slot_skips_the_rest_of_that_call_only() {
    let sink = Broadcast::<()>::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let armed = Arc::new(AtomicBool::new(true));
    let a = armed.clone();
    let _bomb = sink.connect(move |_| {
        if a.swap(false, SeqCst) {
            panic!("slot failure");
        }
    });
    let h = hits.clone();
    let _counter = sink.connect(move |_| {
        h.fetch_add(1, SeqCst);
    });

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| sink.notify(&())));
    assert!(result.is_err());
    // the second slot of the panicking call was skipped
    assert_eq!(hits.load(SeqCst), 0);

    // later notifications are unaffected
    sink.notify(&());
    assert_eq!(hits.load(SeqCst), 1);
}

#[test]
fn global_instances_are_shared_across_threads() {
    struct Ping;

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _token = Broadcast::<Ping>::global().connect(move |_| {
        h.fetch_add(1, SeqCst);
    });

    let threads: Vec<_> = (0..3)
        .map(|_| thread::spawn(|| Broadcast::<Ping>::global().notify(&Ping)))
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(hits.load(SeqCst), 3);
}
