//! Integration tests for execution-context propagation: ambient data set on
//! the submitting thread becomes visible on the worker for one task only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ergane::{ConfigBuilder, ExecutorRegistry};
use ergane_tests::{request_tag, set_request_tag, RequestTagService};

fn single_worker(registry: &ExecutorRegistry, name: &str, with_service: bool) -> ergane::ManagedExecutor {
    let config = ConfigBuilder::new(name)
        .core_size(1)
        .max_size(1)
        .build()
        .unwrap();
    let services = if with_service {
        vec![RequestTagService::shared()]
    } else {
        Vec::new()
    };
    registry.new_executor(name, config, services).unwrap()
}

#[test]
fn test_no_service_means_no_ambient_data() {
    let registry = ExecutorRegistry::new();
    let exec = single_worker(&registry, "bare", false);

    set_request_tag(Some("req-1"));
    let handle = exec.submit(request_tag).unwrap();
    assert_eq!(handle.get().unwrap(), None);
    set_request_tag(None);
    registry.shutdown_all();
}

#[test]
fn test_task_observes_submitter_context_without_leakage() {
    let registry = ExecutorRegistry::new();
    let exec = single_worker(&registry, "tagged", true);

    set_request_tag(Some("req-42"));
    let tagged = exec.submit(request_tag).unwrap();
    assert_eq!(tagged.get().unwrap(), Some("req-42".to_owned()));

    // A second submission with no ambient value set must observe none,
    // even though it reuses the worker thread the first task ran on.
    set_request_tag(None);
    let untagged = exec.submit(request_tag).unwrap();
    assert_eq!(untagged.get().unwrap(), None);
    registry.shutdown_all();
}

#[test]
fn test_context_restored_after_failing_task() {
    let registry = ExecutorRegistry::new();
    let exec = single_worker(&registry, "unwind", true);

    set_request_tag(Some("req-boom"));
    let failing = exec
        .submit(|| -> () { panic!("task failure must not leak context") })
        .unwrap();
    assert!(failing.get().is_err());

    set_request_tag(None);
    let probe = exec.submit(request_tag).unwrap();
    assert_eq!(probe.get().unwrap(), None);
    registry.shutdown_all();
}

#[test]
fn test_unregistering_service_affects_subsequent_submissions_only() {
    let registry = ExecutorRegistry::new();
    let exec = single_worker(&registry, "live", true);

    set_request_tag(Some("early"));
    let early = exec.submit(request_tag).unwrap();
    assert_eq!(early.get().unwrap(), Some("early".to_owned()));

    assert!(exec.context_registry().unregister("request-tag"));
    let late = exec.submit(request_tag).unwrap();
    assert_eq!(late.get().unwrap(), None);

    set_request_tag(None);
    registry.shutdown_all();
}

#[test]
fn test_snapshots_are_per_submission_not_shared() {
    let registry = ExecutorRegistry::new();
    let exec = single_worker(&registry, "per-task", true);

    set_request_tag(Some("first"));
    let first = exec.submit(request_tag).unwrap();
    set_request_tag(Some("second"));
    let second = exec.submit(request_tag).unwrap();
    set_request_tag(None);

    assert_eq!(first.get().unwrap(), Some("first".to_owned()));
    assert_eq!(second.get().unwrap(), Some("second".to_owned()));
    registry.shutdown_all();
}

#[test]
fn test_periodic_firings_reapply_schedule_time_context() {
    let registry = ExecutorRegistry::new();
    let config = ConfigBuilder::new("periodic-ctx")
        .core_size(1)
        .max_size(1)
        .build()
        .unwrap();
    let scheduled = registry
        .new_scheduled_executor("periodic-ctx", config, vec![RequestTagService::shared()])
        .unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let firings = Arc::new(AtomicUsize::new(0));

    set_request_tag(Some("cron-7"));
    let sink = observed.clone();
    let counter = firings.clone();
    let handle = scheduled
        .schedule_at_fixed_rate(
            move || {
                sink.lock().unwrap().push(request_tag());
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();
    set_request_tag(None);

    while firings.load(Ordering::SeqCst) < 3 {
        std::thread::sleep(Duration::from_millis(2));
    }
    handle.cancel(false);

    let seen = observed.lock().unwrap();
    assert!(seen.len() >= 3);
    for firing in seen.iter() {
        assert_eq!(firing.as_deref(), Some("cron-7"));
    }
    registry.shutdown_all();
}
