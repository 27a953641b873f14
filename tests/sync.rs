//! Mutex and condition-variable behavior.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hypha::sync::{Condvar, Mutex};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn mutex_excludes_across_suspension_points() {
    trace_init();
    hypha::run(|| {
        let data = Arc::new(Mutex::new(0_u32));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let data = data.clone();
                hypha::spawn(move || {
                    for _ in 0..10 {
                        let mut guard = data.lock();
                        let v = *guard;
                        // hold the lock across a suspension point; nobody
                        // else may observe the intermediate state
                        hypha::yield_now();
                        *guard = v + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(*data.lock(), 50);
    });
}

#[test]
fn try_lock_respects_ownership() {
    trace_init();
    hypha::run(|| {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    });
}

#[test]
fn notify_one_wakes_exactly_one() {
    trace_init();
    hypha::run(|| {
        let woken = Rc::new(Cell::new(0));
        let pair = Arc::new((Mutex::new(()), Condvar::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pair = pair.clone();
                let woken = woken.clone();
                hypha::spawn(move || {
                    let (lock, cv) = &*pair;
                    let guard = lock.lock();
                    let _guard = cv.wait(guard);
                    woken.set(woken.get() + 1);
                })
            })
            .collect();
        hypha::yield_now(); // all three are now waiting

        pair.1.notify_one();
        hypha::yield_now();
        assert_eq!(woken.get(), 1);

        pair.1.notify_all();
        for h in handles {
            h.join();
        }
        assert_eq!(woken.get(), 3);
    });
}

#[test]
fn notify_all_wakes_in_fifo_order() {
    trace_init();
    hypha::run(|| {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let pair = pair.clone();
                let order = order.clone();
                hypha::spawn(move || {
                    let (lock, cv) = &*pair;
                    let mut go = lock.lock();
                    while !*go {
                        go = cv.wait(go);
                    }
                    drop(go);
                    order.borrow_mut().push(i);
                })
            })
            .collect();
        hypha::yield_now(); // all five enqueue, in spawn order

        let (lock, cv) = &*pair;
        *lock.lock() = true;
        cv.notify_all();

        for h in handles {
            h.join();
        }
        assert_eq!(*order.borrow(), [0, 1, 2, 3, 4]);
    });
}

#[test]
fn wait_for_times_out() {
    trace_init();
    hypha::run(|| {
        let lock = Mutex::new(());
        let cv = Condvar::new();

        let guard = lock.lock();
        let (guard, result) = cv.wait_for(guard, Duration::from_millis(10));
        assert!(result.timed_out());
        drop(guard);
    });
}

#[test]
fn timed_out_waiter_does_not_steal_notifies() {
    trace_init();
    hypha::run(|| {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let woken = Rc::new(Cell::new(false));

        let p1 = pair.clone();
        let timed = hypha::spawn(move || {
            let (lock, cv) = &*p1;
            let guard = lock.lock();
            let (_guard, result) = cv.wait_for(guard, Duration::from_millis(10));
            result.timed_out()
        });

        let p2 = pair.clone();
        let woken2 = woken.clone();
        let waiter = hypha::spawn(move || {
            let (lock, cv) = &*p2;
            let mut go = lock.lock();
            while !*go {
                go = cv.wait(go);
            }
            woken2.set(true);
        });

        hypha::sleep_for(Duration::from_millis(30)); // let the first expire
        assert!(timed.join());

        // the expired waiter unlinked itself; this must reach the live one
        let (lock, cv) = &*pair;
        *lock.lock() = true;
        cv.notify_one();

        waiter.join();
        assert!(woken.get());
    });
}

#[test]
fn concurrent_notify_one_wakes_two_distinct_waiters() {
    trace_init();
    hypha::run(|| {
        let pair = Arc::new((Mutex::new(()), Condvar::new()));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let pair = pair.clone();
                hypha::spawn(move || {
                    let (lock, cv) = &*pair;
                    let guard = lock.lock();
                    let _guard = cv.wait(guard);
                    i
                })
            })
            .collect();
        hypha::yield_now(); // both waiters are queued

        // two foreign threads notify at once; if both notifications landed
        // on the same waiter, the other join below would hang
        let notifiers: Vec<_> = (0..2)
            .map(|_| {
                let pair = pair.clone();
                thread::spawn(move || pair.1.notify_one())
            })
            .collect();
        for n in notifiers {
            n.join().unwrap();
        }

        let woken: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        assert_eq!(woken, [0, 1]);
    });
}
