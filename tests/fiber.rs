//! Scheduler and fiber lifecycle behavior.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn run_returns_the_main_value() {
    trace_init();
    assert_eq!(hypha::run(|| 41 + 1), 42);
}

#[test]
fn spawn_and_join() {
    trace_init();
    let value = hypha::run(|| {
        let handle = hypha::spawn(|| String::from("hello"));
        handle.join()
    });
    assert_eq!(value, "hello");
}

#[test]
fn join_after_completion_does_not_suspend() {
    trace_init();
    hypha::run(|| {
        let handle = hypha::spawn(|| 7);
        hypha::yield_now(); // the fiber runs to completion
        assert!(handle.is_finished());
        assert_eq!(handle.join(), 7);
    });
}

#[test]
fn detached_fibers_run_to_completion() {
    trace_init();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    hypha::run(move || {
        hypha::spawn(move || {
            hypha::sleep_for(Duration::from_millis(10));
            done2.store(true, Ordering::SeqCst);
        })
        .detach();
    });
    // run() only returns once every fiber has terminated
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn ready_fibers_resume_in_fifo_order() {
    trace_init();
    hypha::run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                hypha::spawn(move || order.borrow_mut().push(i))
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(*order.borrow(), [0, 1, 2, 3, 4]);
    });
}

#[test]
fn yield_now_round_robins() {
    trace_init();
    hypha::run(|| {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let log = log.clone();
                hypha::spawn(move || {
                    for _ in 0..3 {
                        log.borrow_mut().push(name);
                        hypha::yield_now();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(*log.borrow(), ["a", "b", "a", "b", "a", "b"]);
    });
}

#[test]
fn sleepers_wake_in_deadline_order() {
    trace_init();
    hypha::run(|| {
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let slow = hypha::spawn(move || {
            hypha::sleep_for(Duration::from_millis(30));
            o1.borrow_mut().push("slow");
        });
        let o2 = order.clone();
        let fast = hypha::spawn(move || {
            hypha::sleep_for(Duration::from_millis(10));
            o2.borrow_mut().push("fast");
        });

        slow.join();
        fast.join();
        assert_eq!(*order.borrow(), ["fast", "slow"]);
    });
}

#[test]
fn sleep_for_lasts_at_least_the_duration() {
    trace_init();
    hypha::run(|| {
        let before = Instant::now();
        hypha::sleep_for(Duration::from_millis(20));
        assert!(before.elapsed() >= Duration::from_millis(20));
    });
}

#[test]
fn builder_configures_name_and_stack() {
    trace_init();
    hypha::run(|| {
        let handle = hypha::Builder::new()
            .name("worker")
            .stack_size(128 * 1024)
            .spawn(|| 3)
            .expect("failed to allocate a fiber stack");
        assert_eq!(handle.join(), 3);
    });
}

#[test]
fn join_handle_crosses_schedulers() {
    trace_init();
    let (handle_tx, handle_rx) = std::sync::mpsc::channel();

    let owner = thread::spawn(move || {
        hypha::run(move || {
            let handle = hypha::spawn(|| {
                hypha::sleep_for(Duration::from_millis(20));
                7
            });
            handle_tx.send(handle).unwrap();
        })
    });

    // join a fiber that lives on the other thread's scheduler
    let got = hypha::run(move || handle_rx.recv().unwrap().join());
    owner.join().unwrap();
    assert_eq!(got, 7);
}

#[test]
#[should_panic(expected = "already running")]
fn nested_run_panics() {
    hypha::run(|| hypha::run(|| ()));
}

#[test]
#[should_panic(expected = "requires a running scheduler")]
fn yield_outside_runtime_panics() {
    hypha::yield_now();
}

#[test]
#[should_panic(expected = "requires a running scheduler")]
fn spawn_outside_runtime_panics() {
    hypha::spawn(|| ()).detach();
}
