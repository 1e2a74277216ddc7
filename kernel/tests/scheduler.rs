//! Scheduler and synchronization scenarios: priority scheduling,
//! priority donation (single lock and chained), semaphore wakeup
//! order, condition variables, and the mlfqs policy.

use std::sync::{Arc, Mutex};

use pyrite_kernel::sched::thread;
use pyrite_kernel::userprog::process;
use pyrite_kernel::{timer, BootArgs, Kernel, Lock, Semaphore, ThreadState};

type EventLog = Arc<Mutex<Vec<String>>>;

fn boot(mlfqs: bool) -> Arc<Kernel> {
    let args = BootArgs {
        mlfqs,
        ..BootArgs::default()
    };
    let kernel = Kernel::boot(&args);
    kernel.adopt_boot_thread("main");
    kernel.start();
    kernel
}

fn log_event(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

#[test]
fn test_exactly_one_running_thread() {
    let kernel = boot(false);
    let gate = Semaphore::new(0);

    for i in 0..2 {
        let gate = gate.clone();
        thread::spawn(&format!("waiter{}", i), 10, move || gate.down()).unwrap();
    }

    let running: Vec<_> = kernel
        .threads()
        .iter()
        .filter(|t| t.state() == ThreadState::Running)
        .map(|t| t.name().to_owned())
        .collect();
    assert_eq!(running, vec!["main".to_owned()]);

    gate.up();
    gate.up();
}

#[test]
fn test_foreach_visits_every_live_thread() {
    let _kernel = boot(false);
    let gate = Semaphore::new(0);
    for i in 0..2 {
        let gate = gate.clone();
        thread::spawn(&format!("sleepy{}", i), 10, move || gate.down()).unwrap();
    }

    let mut names = Vec::new();
    thread::foreach(&mut |t| names.push(t.name().to_owned()));
    for expected in ["main", "idle", "sleepy0", "sleepy1"] {
        assert!(names.iter().any(|n| n == expected), "missing {}", expected);
    }

    gate.up();
    gate.up();
}

#[test]
fn test_donation_single_lock() {
    let kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let lock = Lock::new();
    let ready = Semaphore::new(0);
    let hold = Semaphore::new(0);

    thread::set_priority(40);

    let t10 = {
        let (lock, ready, hold, log) = (lock.clone(), ready.clone(), hold.clone(), log.clone());
        thread::spawn("p10", 10, move || {
            lock.acquire();
            ready.up();
            hold.down();
            lock.release();
            log_event(&log, format!("p10 released at {}", thread::get_priority()));
        })
        .unwrap()
    };
    ready.down();

    // Let p20 block on the lock before p30 exists.
    let t20 = {
        let (lock, log) = (lock.clone(), log.clone());
        thread::spawn("p20", 20, move || {
            lock.acquire();
            log_event(&log, "p20 got lock");
            lock.release();
        })
        .unwrap()
    };
    thread::set_priority(15);

    assert_eq!(kernel.thread_by_tid(t10).unwrap().priority(), 20);

    let t30 = {
        let (lock, log) = (lock.clone(), log.clone());
        thread::spawn("p30", 30, move || {
            lock.acquire();
            log_event(&log, "p30 got lock");
            lock.release();
        })
        .unwrap()
    };

    // Both donations are active; the holder carries the highest.
    assert_eq!(kernel.thread_by_tid(t10).unwrap().priority(), 30);
    assert_eq!(kernel.thread_by_tid(t20).unwrap().priority(), 20);
    assert_eq!(kernel.thread_by_tid(t30).unwrap().priority(), 30);

    hold.up();
    assert_eq!(process::wait(t30), 0);
    assert_eq!(process::wait(t20), 0);
    assert_eq!(process::wait(t10), 0);

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "p30 got lock".to_owned(),
            "p20 got lock".to_owned(),
            "p10 released at 10".to_owned(),
        ]
    );
}

#[test]
fn test_donation_chain() {
    let kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let lock_a = Lock::new();
    let lock_b = Lock::new();
    let ready10 = Semaphore::new(0);
    let ready20 = Semaphore::new(0);
    let hold20 = Semaphore::new(0);

    thread::set_priority(40);

    let t20 = {
        let (b, ready20, hold20, log) =
            (lock_b.clone(), ready20.clone(), hold20.clone(), log.clone());
        thread::spawn("p20", 20, move || {
            b.acquire();
            ready20.up();
            hold20.down();
            b.release();
            log_event(&log, "p20 released b");
        })
        .unwrap()
    };
    ready20.down();

    let t10 = {
        let (a, b, ready10, log) =
            (lock_a.clone(), lock_b.clone(), ready10.clone(), log.clone());
        thread::spawn("p10", 10, move || {
            a.acquire();
            ready10.up();
            b.acquire();
            b.release();
            a.release();
            log_event(&log, "p10 released a");
        })
        .unwrap()
    };
    ready10.down();

    // Let p10 proceed into b.acquire and block there.
    thread::set_priority(5);

    let t30 = {
        let (a, log) = (lock_a.clone(), log.clone());
        thread::spawn("p30", 30, move || {
            a.acquire();
            log_event(&log, "p30 got a");
            a.release();
        })
        .unwrap()
    };

    // The chain walk boosted both the direct holder and the holder it
    // waits on.
    assert_eq!(kernel.thread_by_tid(t10).unwrap().priority(), 30);
    assert_eq!(kernel.thread_by_tid(t20).unwrap().priority(), 30);

    hold20.up();
    assert_eq!(process::wait(t30), 0);
    assert_eq!(process::wait(t20), 0);
    assert_eq!(process::wait(t10), 0);

    // p30 runs as soon as `a` is released; p20 and p10 drain their
    // post-release logging afterwards in priority order.
    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "p30 got a".to_owned(),
            "p20 released b".to_owned(),
            "p10 released a".to_owned(),
        ]
    );
}

#[test]
fn test_priority_ping_pong() {
    let _kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sema = Semaphore::new(0);

    let t40 = {
        let (sema, log) = (sema.clone(), log.clone());
        thread::spawn("p40", 40, move || {
            sema.down();
            log_event(&log, "p40 done");
        })
        .unwrap()
    };

    let t30 = {
        let (sema, log) = (sema.clone(), log.clone());
        thread::spawn("p30", 30, move || {
            sema.up();
            log_event(&log, "p30 resumed");
        })
        .unwrap()
    };

    thread::set_priority(5);
    assert_eq!(process::wait(t40), 0);
    assert_eq!(process::wait(t30), 0);

    let events = log.lock().unwrap().clone();
    assert_eq!(events, vec!["p40 done".to_owned(), "p30 resumed".to_owned()]);
}

#[test]
fn test_sema_ping_pong_self_test() {
    let _kernel = boot(false);
    let s0 = Semaphore::new(0);
    let s1 = Semaphore::new(0);

    let child = {
        let (s0, s1) = (s0.clone(), s1.clone());
        thread::spawn("pong", 31, move || {
            for _ in 0..10 {
                s0.down();
                s1.up();
            }
        })
        .unwrap()
    };

    for _ in 0..10 {
        s0.up();
        s1.down();
    }
    assert_eq!(process::wait(child), 0);
}

#[test]
fn test_sema_up_wakes_highest_priority_waiter() {
    let _kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sema = Semaphore::new(0);

    thread::set_priority(50);
    let mut tids = Vec::new();
    for &priority in &[10, 30, 20] {
        let (sema, log) = (sema.clone(), log.clone());
        let tid = thread::spawn(&format!("w{}", priority), priority, move || {
            sema.down();
            log_event(&log, format!("w{}", priority));
        })
        .unwrap();
        tids.push(tid);
    }
    // Let all three block on the semaphore.
    thread::set_priority(5);
    thread::set_priority(50);

    sema.up();
    sema.up();
    sema.up();
    thread::set_priority(5);

    for tid in tids {
        assert_eq!(process::wait(tid), 0);
    }
    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["w30".to_owned(), "w20".to_owned(), "w10".to_owned()]
    );
}

#[test]
fn test_condvar_signals_in_priority_order() {
    let _kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let lock = Lock::new();
    let cond = pyrite_kernel::Condvar::new();

    thread::set_priority(50);
    let mut tids = Vec::new();
    for &priority in &[10, 20, 30] {
        let (lock, cond, log) = (lock.clone(), cond.clone(), log.clone());
        let tid = thread::spawn(&format!("w{}", priority), priority, move || {
            lock.acquire();
            cond.wait(&lock);
            log_event(&log, format!("w{}", priority));
            lock.release();
        })
        .unwrap();
        tids.push(tid);
    }
    // Let every waiter enqueue on the condition.
    thread::set_priority(5);
    thread::set_priority(50);

    lock.acquire();
    cond.broadcast(&lock);
    lock.release();
    thread::set_priority(5);

    for tid in tids {
        assert_eq!(process::wait(tid), 0);
    }
    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["w30".to_owned(), "w20".to_owned(), "w10".to_owned()]
    );
}

#[test]
fn test_set_priority_respects_active_donations() {
    let kernel = boot(false);
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let lock = Lock::new();
    let ready = Semaphore::new(0);
    let step = Semaphore::new(0);

    thread::set_priority(50);

    let holder = {
        let (lock, ready, step, log) = (lock.clone(), ready.clone(), step.clone(), log.clone());
        thread::spawn("holder", 20, move || {
            lock.acquire();
            ready.up();
            step.down();
            // Base priority changes while a 40-donation is active.
            thread::set_priority(35);
            log_event(&log, format!("effective {}", thread::get_priority()));
            lock.release();
            log_event(&log, format!("after release {}", thread::get_priority()));
        })
        .unwrap()
    };
    ready.down();

    let donor = {
        let lock = lock.clone();
        thread::spawn("donor", 40, move || {
            lock.acquire();
            lock.release();
        })
        .unwrap()
    };
    // Let the donor block on the lock (and the holder reach step.down).
    thread::set_priority(5);
    assert_eq!(kernel.thread_by_tid(holder).unwrap().priority(), 40);

    step.up();

    assert_eq!(process::wait(donor), 0);
    assert_eq!(process::wait(holder), 0);

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["effective 40".to_owned(), "after release 35".to_owned()]
    );
}

#[test]
fn test_mlfqs_priority_drifts_down_with_cpu_use() {
    let kernel = boot(true);

    // A fresh thread with nice 0 starts at the top.
    assert_eq!(thread::get_priority(), 63);

    timer::advance(&kernel, 200);
    let drifted = thread::get_priority();
    assert!(drifted < 63, "priority did not drift: {}", drifted);
    assert!(drifted >= 0);

    // Raising nice lowers priority within one recomputation.
    let before = thread::get_priority();
    thread::set_nice(10);
    let after = thread::get_priority();
    assert!(
        after <= before - 10,
        "nice 10 should cost ~20 levels: {} -> {}",
        before,
        after
    );
}

#[test]
fn test_mlfqs_load_average_tracks_ready_threads() {
    let kernel = boot(true);
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut tids = Vec::new();
    for i in 0..2 {
        let done = done.clone();
        let tid = thread::spawn(&format!("busy{}", i), 31, move || {
            // Stay well below the driving thread so the tick loop is
            // never starved.
            thread::set_nice(20);
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                thread::yield_now();
            }
        })
        .unwrap();
        tids.push(tid);
    }

    assert_eq!(thread::get_load_avg(), 0);
    timer::advance(&kernel, 100);
    let early = thread::get_load_avg();
    timer::advance(&kernel, 300);
    let late = thread::get_load_avg();

    assert!(early > 0, "load average never rose: {}", early);
    assert!(late >= early, "load average fell: {} -> {}", early, late);

    done.store(true, std::sync::atomic::Ordering::Release);
    for tid in tids {
        assert_eq!(process::wait(tid), 0);
    }
}

#[test]
fn test_tick_statistics_accumulate() {
    let kernel = boot(false);
    timer::advance(&kernel, 10);
    let (_idle, kernel_ticks, _user) = kernel.tick_stats();
    assert_eq!(kernel_ticks, 10);
    assert_eq!(kernel.ticks(), 10);
}
