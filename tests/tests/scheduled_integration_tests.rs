//! Integration tests for the scheduled executor: one-shot delays,
//! fixed-rate and fixed-delay discipline, and the shared completion counter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ergane::{ConfigBuilder, ContextRegistry, ManagedScheduledExecutor};

fn scheduled(name: &str) -> ManagedScheduledExecutor {
    let config = ConfigBuilder::new(name)
        .core_size(2)
        .max_size(4)
        .build()
        .unwrap();
    ManagedScheduledExecutor::new(config, Arc::new(ContextRegistry::new())).unwrap()
}

#[test]
fn test_one_shot_delay_counts_down_then_fires() {
    let exec = scheduled("one-shot");
    let scheduled_at = Instant::now();
    let handle = exec
        .schedule(move || scheduled_at.elapsed(), Duration::from_millis(40))
        .unwrap();

    assert!(!handle.is_periodic());
    assert!(handle.delay() <= Duration::from_millis(40));
    let elapsed = handle.get().unwrap();
    assert!(elapsed >= Duration::from_millis(35), "fired after {elapsed:?}");
    assert_eq!(handle.delay(), Duration::ZERO);
    exec.shutdown();
}

#[test]
fn test_fixed_rate_counter_band() {
    let exec = scheduled("rate-band");
    let handle = exec
        .schedule_at_fixed_rate(|| (), Duration::from_millis(5), Duration::from_millis(10))
        .unwrap();
    assert!(handle.is_periodic());

    // A zero-cost body on a 10 ms period: after roughly four periods the
    // shared counter sits inside a jitter-tolerant band, never at an exact
    // value.
    thread::sleep(Duration::from_millis(45));
    handle.cancel(false);
    let completed = exec.executor().completed_task_count();
    assert!(
        (2..=6).contains(&completed),
        "completed {completed} firings"
    );
    assert!(handle.run_count() >= 2);
    exec.shutdown();
}

#[test]
fn test_fixed_rate_firings_never_overlap() {
    let exec = scheduled("no-overlap");
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let firings = Arc::new(AtomicUsize::new(0));

    let flag = in_flight.clone();
    let bad = overlapped.clone();
    let counter = firings.clone();
    let handle = exec
        .schedule_at_fixed_rate(
            move || {
                if flag.swap(true, Ordering::SeqCst) {
                    bad.store(true, Ordering::SeqCst);
                }
                // Body deliberately slower than the period.
                thread::sleep(Duration::from_millis(25));
                flag.store(false, Ordering::SeqCst);
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();

    while firings.load(Ordering::SeqCst) < 4 {
        thread::sleep(Duration::from_millis(5));
    }
    handle.cancel(false);
    assert!(!overlapped.load(Ordering::SeqCst), "firings overlapped");
    exec.shutdown();
}

#[test]
fn test_fixed_delay_spacing_measured_from_completion() {
    let exec = scheduled("delay-spacing");
    let starts = Arc::new(Mutex::new(Vec::new()));
    let firings = Arc::new(AtomicUsize::new(0));

    let log = starts.clone();
    let counter = firings.clone();
    let handle = exec
        .schedule_with_fixed_delay(
            move || {
                log.lock().unwrap().push(Instant::now());
                thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(15),
        )
        .unwrap();

    while firings.load(Ordering::SeqCst) < 3 {
        thread::sleep(Duration::from_millis(5));
    }
    handle.cancel(false);

    let starts = starts.lock().unwrap();
    for gap in starts.windows(2) {
        let spacing = gap[1].duration_since(gap[0]);
        // 20 ms body + 15 ms delay: start-to-start must exceed both.
        assert!(
            spacing >= Duration::from_millis(30),
            "firings only {spacing:?} apart"
        );
    }
    exec.shutdown();
}

#[test]
fn test_each_firing_bumps_the_shared_counter_once() {
    let exec = scheduled("counter");
    let firings = Arc::new(AtomicUsize::new(0));
    let counter = firings.clone();
    let handle = exec
        .schedule_with_fixed_delay(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();

    while firings.load(Ordering::SeqCst) < 3 {
        thread::sleep(Duration::from_millis(2));
    }
    handle.cancel(false);
    thread::sleep(Duration::from_millis(30));

    let fired = firings.load(Ordering::SeqCst) as u64;
    let completed = exec.executor().completed_task_count();
    // One completion per firing, give or take the firing racing the cancel.
    assert!(
        completed >= fired.saturating_sub(1) && completed <= fired + 1,
        "fired {fired}, counted {completed}"
    );
    exec.shutdown();
}

#[test]
fn test_scheduled_executor_still_accepts_direct_submissions() {
    let exec = scheduled("direct");
    let handle = exec.submit(|| "direct").unwrap();
    assert_eq!(handle.get().unwrap(), "direct");
    assert_eq!(exec.executor().task_count(), 1);
    exec.shutdown();
    assert!(exec.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_cancelled_periodic_handle_reports_terminal_state() {
    let exec = scheduled("cancelled");
    let handle = exec
        .schedule_at_fixed_rate(|| (), Duration::from_millis(5), Duration::from_millis(10))
        .unwrap();
    thread::sleep(Duration::from_millis(25));
    assert!(handle.cancel(true));
    assert!(handle.is_done());
    assert!(handle.is_cancelled());
    let runs_at_cancel = handle.run_count();
    thread::sleep(Duration::from_millis(40));
    assert!(handle.run_count() <= runs_at_cancel + 1);
    exec.shutdown();
}
