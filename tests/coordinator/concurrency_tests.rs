//! Background passes, request coalescing and concurrent readers

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parser_state::{
    Actor, CoordinatorConfig, ExecutionMode, LineScanPipeline, ModuleId, ParseRequestOutcome,
    ParseStatus, ParserStateCoordinator, ParserStateError, QualifiedName,
};

use crate::common::{
    gated_coordinator, gated_inline_coordinator, two_module_project, RecordingListener, MODULE2,
    MODULE2_RENAMED,
};

const IDLE: Duration = Duration::from_secs(10);

fn member(module: &str, name: &str) -> QualifiedName {
    QualifiedName::member(ModuleId::new(module), name)
}

// ============================================================================
// COALESCING
// ============================================================================

#[test]
fn test_requests_during_pass_coalesce_into_one_follow_up() {
    let project = two_module_project();
    let (coordinator, gate) = gated_coordinator(&project);
    gate.hold();

    let editor = Actor::new("editor");
    assert_eq!(
        coordinator.on_parse_requested(&editor),
        ParseRequestOutcome::Started
    );
    assert!(gate.wait_entered(1, IDLE));

    // Two callers racing while the first pass is held in its syntax stage
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let coordinator = coordinator.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.on_parse_requested(&Actor::new(format!("caller-{}", i)))
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(outcomes
        .iter()
        .all(|o| *o == ParseRequestOutcome::Coalesced));

    gate.release();
    assert!(coordinator.wait_until_idle(IDLE));

    let stats = coordinator.stats();
    assert_eq!(stats.passes_started, 2);
    assert_eq!(stats.passes_completed, 2);
    assert_eq!(stats.requests_started, 1);
    assert_eq!(stats.requests_coalesced, 2);
    assert_eq!(coordinator.status(), ParseStatus::Ready);
    assert_eq!(coordinator.current_index().generation(), 2);
}

#[test]
fn test_request_from_listener_is_coalesced() {
    let project = two_module_project();
    let coordinator = ParserStateCoordinator::new(
        LineScanPipeline::new(),
        Arc::new(project.clone()),
        &CoordinatorConfig::inline(),
    )
    .unwrap();

    let trigger = coordinator.clone();
    let fired = Arc::new(AtomicBool::new(false));
    let seen_outcome = Arc::new(parking_lot::Mutex::new(None));
    let (fired_in, outcome_in) = (Arc::clone(&fired), Arc::clone(&seen_outcome));
    let id = coordinator.subscribe_fn(move |event| {
        if event.current == ParseStatus::ResolvingDeclarations && !fired_in.swap(true, Ordering::SeqCst) {
            *outcome_in.lock() = Some(trigger.on_parse_requested(&Actor::new("listener")));
        }
        Ok(())
    });

    coordinator.on_parse_requested(&Actor::new("editor"));
    coordinator.unsubscribe(id);

    assert_eq!(*seen_outcome.lock(), Some(ParseRequestOutcome::Coalesced));
    assert_eq!(coordinator.stats().passes_started, 2);
    assert_eq!(coordinator.status(), ParseStatus::Ready);
}

// ============================================================================
// EVENT ORDERING
// ============================================================================

#[test]
fn test_background_events_are_totally_ordered() {
    let project = two_module_project();
    let (coordinator, _gate) = gated_coordinator(&project);
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());

    let editor = Actor::new("editor");
    for _ in 0..5 {
        coordinator.on_parse_requested(&editor);
        thread::sleep(Duration::from_millis(2));
    }
    assert!(coordinator.wait_until_idle(IDLE));

    let events = recorder.events();
    assert!(!events.is_empty());
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64 + 1);
        assert_ne!(event.previous, event.current);
    }
    assert!(events
        .windows(2)
        .all(|pair| pair[0].current == pair[1].previous));
    assert_eq!(events.last().map(|e| e.current), Some(ParseStatus::Ready));
}

// ============================================================================
// CONCURRENT READERS
// ============================================================================

#[test]
fn test_readers_never_see_partial_index() {
    let project = two_module_project();
    let (coordinator, _gate) = gated_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    assert!(coordinator.wait_until_idle(IDLE));

    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let done = Arc::clone(&done);
            let reads = Arc::clone(&reads);
            thread::spawn(move || {
                let mut last_generation = 0;
                while !done.load(Ordering::SeqCst) {
                    let (status, index) = coordinator.snapshot();
                    assert!(index.generation() >= last_generation);
                    last_generation = index.generation();

                    assert!(index.get(&member("Module1", "Foo")).is_some());
                    let old = index.get(&member("Module2", "Helper")).is_some();
                    let new = index.get(&member("Module2", "Helper2")).is_some();
                    assert!(old ^ new, "index mixes two versions of Module2");
                    if status == ParseStatus::Ready {
                        assert!(index.generation() >= 1);
                    }
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let module2 = ModuleId::new("Module2");
    for i in 0..40 {
        let text = if i % 2 == 0 { MODULE2_RENAMED } else { MODULE2 };
        project.set_text(&module2, text);
        coordinator.on_modules_changed(&editor, [module2.clone()]);
        thread::sleep(Duration::from_millis(1));
    }
    assert!(coordinator.wait_until_idle(IDLE));
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }

    assert!(reads.load(Ordering::Relaxed) > 0);
    assert_eq!(coordinator.status(), ParseStatus::Ready);
    // The last edit restored the original text
    assert!(coordinator
        .current_index()
        .get(&member("Module2", "Helper"))
        .is_some());
}

#[test]
fn test_no_pass_runs_while_suspended() {
    let project = two_module_project();
    let (coordinator, gate) = gated_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    assert!(coordinator.wait_until_idle(IDLE));

    let done = Arc::new(AtomicBool::new(false));
    let requester = {
        let coordinator = coordinator.clone();
        let done = Arc::clone(&done);
        let project = project.clone();
        thread::spawn(move || {
            let module2 = ModuleId::new("Module2");
            let mut flip = false;
            while !done.load(Ordering::SeqCst) {
                flip = !flip;
                project.set_text(&module2, if flip { MODULE2_RENAMED } else { MODULE2 });
                coordinator.on_modules_changed(&Actor::new("editor"), [module2.clone()]);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut granted = 0;
    for _ in 0..20 {
        let inner = coordinator.clone();
        let gate = Arc::clone(&gate);
        let result = coordinator.suspend_parser(&Actor::new("rename"), move |_| {
            let before = gate.entered();
            thread::sleep(Duration::from_millis(3));
            assert_eq!(inner.status(), ParseStatus::Busy);
            Ok::<_, ParserStateError>(gate.entered() - before)
        });
        match result {
            Ok(builds) => {
                granted += 1;
                assert_eq!(builds, 0, "a syntax build ran during the suspension");
            }
            Err(e) => assert!(e.rejection().is_some_and(|r| r.is_recoverable())),
        }
        thread::sleep(Duration::from_millis(1));
    }

    done.store(true, Ordering::SeqCst);
    requester.join().unwrap();
    assert!(coordinator.wait_until_idle(IDLE));
    assert!(!coordinator.is_suspended());
    assert_eq!(coordinator.status(), ParseStatus::Ready);
    // Suspensions are only refused while a pass is running; at least some
    // attempts land between passes
    assert!(granted > 0);
}

#[test]
fn test_wait_until_idle_with_pass_started_from_listener() {
    let project = two_module_project();
    let (coordinator, gate) = gated_inline_coordinator(&project);
    gate.hold();

    let trigger = coordinator.clone();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_in = Arc::clone(&fired);
    coordinator.subscribe_fn(move |event| {
        if event.current == ParseStatus::Error && !fired_in.swap(true, Ordering::SeqCst) {
            trigger.on_parse_requested(&Actor::new("listener"));
        }
        Ok(())
    });

    // The inline pass runs inside the listener, under the setter's transition
    let setter = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.set_status(&Actor::new("host"), ParseStatus::Error))
    };
    assert!(gate.wait_entered(1, IDLE));

    let waiter = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.wait_until_idle(IDLE))
    };
    thread::sleep(Duration::from_millis(100));
    gate.release();

    assert!(waiter.join().unwrap());
    assert!(setter.join().unwrap().is_ok());
    assert_eq!(coordinator.status(), ParseStatus::Ready);
    assert_eq!(coordinator.stats().passes_completed, 1);
}

#[test]
fn test_background_mode_reports_execution() {
    let project = two_module_project();
    let (coordinator, _gate) = gated_coordinator(&project);
    assert_eq!(coordinator.execution(), ExecutionMode::Background);
}
