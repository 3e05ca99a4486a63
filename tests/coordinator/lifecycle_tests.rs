//! Status sequences, index publishing and pipeline failures

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parser_state::{
    Actor, CoordinatorConfig, LineScanPipeline, ModuleId, ModuleProvider, ParseRequestOutcome,
    ParseStatus, ParserStateCoordinator, ParserStateError, PassFailure, QualifiedName,
    SourceModule,
};

use crate::common::{
    inline_coordinator, two_module_project, RecordingListener, MODULE1, MODULE2_RENAMED,
    UNTERMINATED,
};

use ParseStatus::*;

fn member(module: &str, name: &str) -> QualifiedName {
    QualifiedName::member(ModuleId::new(module), name)
}

// ============================================================================
// INITIAL STATE
// ============================================================================

#[test]
fn test_initial_state_is_pending_with_empty_index() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);

    assert_eq!(coordinator.status(), Pending);
    assert!(coordinator.module_statuses().is_empty());
    let index = coordinator.current_index();
    assert_eq!(index.generation(), 0);
    assert!(index.is_empty());
    assert!(coordinator.last_error().is_none());
}

// ============================================================================
// STATUS SEQUENCES
// ============================================================================

#[test]
fn test_first_pass_event_sequence() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());

    let outcome = coordinator.on_parse_requested(&Actor::new("editor"));

    assert_eq!(outcome, ParseRequestOutcome::Started);
    assert_eq!(
        recorder.statuses(),
        vec![Parsing, ResolvingDeclarations, ResolvingReferences, Ready]
    );
    assert_eq!(recorder.sequences(), vec![1, 2, 3, 4]);
    assert_eq!(coordinator.status(), Ready);
}

#[test]
fn test_reparse_passes_through_pending() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);

    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());
    coordinator.on_modules_changed(&editor, [ModuleId::new("Module2")]);

    assert_eq!(
        recorder.statuses(),
        vec![Pending, Parsing, ResolvingDeclarations, ResolvingReferences, Ready]
    );
    // Sequence numbers continue across passes
    assert_eq!(recorder.sequences(), vec![5, 6, 7, 8, 9]);
    assert!(recorder
        .events()
        .windows(2)
        .all(|pair| pair[0].current == pair[1].previous));
}

#[test]
fn test_events_carry_the_causing_actor() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());
    coordinator.on_parse_requested(&Actor::new("editor"));

    let events = recorder.events();
    assert!(events.iter().all(|e| e.actor == *coordinator.parser_actor()));

    recorder.clear();
    let rename = Actor::new("rename");
    let _ = coordinator.suspend_parser(&rename, |_| Ok::<_, ParserStateError>(()));
    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].current, Busy);
    assert_eq!(events[0].actor, rename);
    assert_eq!(events[1].current, Ready);
    assert_eq!(events[1].actor, rename);
}

// ============================================================================
// INDEX PUBLISHING
// ============================================================================

#[test]
fn test_index_resolves_cross_module_references() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));

    let index = coordinator.current_index();
    assert_eq!(index.generation(), 1);
    assert!(index.get(&member("Module1", "Foo")).is_some());
    let helper = member("Module2", "Helper");
    assert!(index.get(&helper).is_some());
    assert!(index
        .references_to(&helper)
        .iter()
        .any(|r| r.module == ModuleId::new("Module1")));
}

#[test]
fn test_identical_reparse_keeps_symbol_content() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    let first = coordinator.current_index();

    coordinator.on_parse_requested(&editor);
    let second = coordinator.current_index();

    assert_eq!(second.generation(), first.generation() + 1);
    assert!(second.same_symbols(&first));
    // Sources did not change, so every tree came from the cache
    let pass = coordinator.last_pass().unwrap();
    assert_eq!(pass.modules_parsed, 0);
    assert_eq!(pass.modules_reused, 2);
}

#[test]
fn test_changed_module_is_reflected_after_reparse() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    let before = coordinator.current_index();

    let module2 = ModuleId::new("Module2");
    project.set_text(&module2, MODULE2_RENAMED);
    coordinator.on_modules_changed(&editor, [module2]);

    let after = coordinator.current_index();
    assert!(after.get(&member("Module2", "Helper")).is_none());
    assert!(after.get(&member("Module2", "Helper2")).is_some());
    // Readers holding the old snapshot are unaffected
    assert!(before.get(&member("Module2", "Helper")).is_some());

    let pass = coordinator.last_pass().unwrap();
    assert_eq!(pass.modules_parsed, 1);
}

#[test]
fn test_removed_module_leaves_index() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);

    project.remove_module(&ModuleId::new("Module2"));
    coordinator.on_parse_requested(&editor);

    let index = coordinator.current_index();
    assert_eq!(index.declarations_in(&ModuleId::new("Module2")).count(), 0);
    assert!(coordinator.module_status(&ModuleId::new("Module2")).is_none());
    assert_eq!(coordinator.status(), Ready);
}

#[test]
fn test_added_module_is_parsed_on_module_request() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);

    project.set_module(SourceModule::new(
        "Module3",
        parser_state::ModuleKind::Standard,
        "Public Sub Baz()\nEnd Sub\n",
    ));
    coordinator.on_modules_changed(&editor, [ModuleId::new("Module3")]);

    assert_eq!(coordinator.module_status(&ModuleId::new("Module3")), Some(Ready));
    assert!(coordinator
        .current_index()
        .get(&member("Module3", "Baz"))
        .is_some());
}

#[test]
fn test_snapshot_pairs_status_with_index() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));

    let (status, index) = coordinator.snapshot();
    assert_eq!(status, Ready);
    assert_eq!(index.generation(), 1);
}

#[test]
fn test_non_ascii_module_parses_alongside_others() {
    let project = two_module_project().with_module(
        "Jp",
        "Sub Bar()\n    日本 = 1\n    Dim 名前 As String\n    名前 = \"値\"\nEnd Sub\n",
    );
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));

    assert_eq!(coordinator.status(), Ready);
    assert_eq!(coordinator.module_status(&ModuleId::new("Jp")), Some(Ready));
    assert_eq!(coordinator.module_status(&ModuleId::new("Module1")), Some(Ready));
    assert!(coordinator.last_error().is_none());

    let index = coordinator.current_index();
    assert_eq!(index.generation(), 1);
    assert!(index.get(&member("Jp", "Bar")).is_some());
    assert!(index.get(&member("Module1", "Foo")).is_some());
}

// ============================================================================
// PIPELINE FAILURES
// ============================================================================

#[test]
fn test_syntax_error_marks_module_and_keeps_others() {
    let project = two_module_project().with_module("Broken", UNTERMINATED);
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));

    assert_eq!(coordinator.status(), Error);
    assert_eq!(coordinator.module_status(&ModuleId::new("Broken")), Some(Error));
    assert_eq!(coordinator.module_status(&ModuleId::new("Module1")), Some(Ready));

    // Healthy modules are still published
    let index = coordinator.current_index();
    assert_eq!(index.generation(), 1);
    assert!(index.get(&member("Module1", "Foo")).is_some());
    assert!(index.get(&member("Broken", "Broken")).is_none());

    match coordinator.last_error() {
        Some(PassFailure::Syntax(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].module, ModuleId::new("Broken"));
        }
        other => panic!("expected syntax failure, got {:?}", other),
    }
}

#[test]
fn test_fixing_syntax_error_recovers_ready() {
    let project = two_module_project().with_module("Broken", UNTERMINATED);
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    assert_eq!(coordinator.status(), Error);

    let broken = ModuleId::new("Broken");
    project.set_text(&broken, "Public Sub Broken()\nEnd Sub\n");
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());
    coordinator.on_modules_changed(&editor, [broken]);

    assert_eq!(coordinator.status(), Ready);
    assert!(coordinator.last_error().is_none());
    assert_eq!(recorder.statuses().first(), Some(&Pending));
    assert_eq!(recorder.statuses().last(), Some(&Ready));
    assert!(coordinator
        .current_index()
        .get(&member("Broken", "Broken"))
        .is_some());
}

#[test]
fn test_resolution_error_keeps_previous_index() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    let good = coordinator.current_index();

    let module1 = ModuleId::new("Module1");
    project.set_text(
        &module1,
        &format!("{}\nPublic Sub Foo()\nEnd Sub\n", MODULE1),
    );
    coordinator.on_modules_changed(&editor, [module1]);

    assert_eq!(coordinator.status(), Error);
    assert!(matches!(
        coordinator.last_error(),
        Some(PassFailure::Resolution(_))
    ));
    let index = coordinator.current_index();
    assert_eq!(index.generation(), good.generation());
    assert!(index.same_symbols(&good));
    assert_eq!(coordinator.stats().passes_failed, 1);
}

/// Provider whose reads can be made to fail
struct FlakyProvider {
    inner: parser_state::InMemoryProject,
    failing: AtomicBool,
}

impl ModuleProvider for FlakyProvider {
    fn modules(&self) -> parser_state::Result<Vec<SourceModule>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ParserStateError::ModuleSource {
                message: "project closed".to_string(),
            });
        }
        self.inner.modules()
    }
}

#[test]
fn test_unreadable_project_sets_error() {
    let provider = Arc::new(FlakyProvider {
        inner: two_module_project(),
        failing: AtomicBool::new(false),
    });
    let coordinator = ParserStateCoordinator::new(
        LineScanPipeline::new(),
        provider.clone(),
        &CoordinatorConfig::inline(),
    )
    .unwrap();
    let editor = Actor::new("editor");
    coordinator.on_parse_requested(&editor);
    assert_eq!(coordinator.status(), Ready);

    provider.failing.store(true, Ordering::SeqCst);
    coordinator.on_parse_requested(&editor);
    assert_eq!(coordinator.status(), Error);
    assert!(matches!(
        coordinator.last_error(),
        Some(PassFailure::ModuleSource(_))
    ));
    assert_eq!(coordinator.current_index().generation(), 1);

    provider.failing.store(false, Ordering::SeqCst);
    coordinator.on_parse_requested(&editor);
    assert_eq!(coordinator.status(), Ready);
    assert_eq!(coordinator.current_index().generation(), 2);
}

// ============================================================================
// EXPLICIT STATUS CHANGES
// ============================================================================

#[test]
fn test_set_status_rejects_skipping_stages() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());

    let err = coordinator
        .set_status(&Actor::new("caller"), ResolvingReferences)
        .unwrap_err();

    assert!(matches!(
        err,
        ParserStateError::InvalidTransition {
            from: Pending,
            to: ResolvingReferences
        }
    ));
    assert_eq!(coordinator.status(), Pending);
    assert_eq!(recorder.len(), 0);
}

#[test]
fn test_set_status_rejects_busy() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));

    let err = coordinator.set_status(&Actor::new("caller"), Busy).unwrap_err();
    assert!(matches!(err, ParserStateError::InvalidTransition { .. }));
    assert_eq!(coordinator.status(), Ready);
}

#[test]
fn test_set_status_allows_error_and_emits_event() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    coordinator.on_parse_requested(&Actor::new("editor"));
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());

    coordinator.set_status(&Actor::new("host"), Error).unwrap();

    assert_eq!(coordinator.status(), Error);
    assert_eq!(recorder.statuses(), vec![Error]);
}

#[test]
fn test_set_module_status_validates_per_module() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let host = Actor::new("host");
    coordinator.on_parse_requested(&Actor::new("editor"));
    let module1 = ModuleId::new("Module1");

    assert!(coordinator
        .set_module_status(&host, &module1, ResolvingDeclarations)
        .is_err());
    coordinator.set_module_status(&host, &module1, Pending).unwrap();
    assert_eq!(coordinator.module_status(&module1), Some(Pending));
    assert_eq!(coordinator.status(), Pending);
}

// ============================================================================
// LISTENERS
// ============================================================================

#[test]
fn test_failing_listener_does_not_block_others() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    coordinator.subscribe_fn(|_| anyhow::bail!("listener failed"));
    let recorder = RecordingListener::new();
    coordinator.subscribe(recorder.clone());

    coordinator.on_parse_requested(&Actor::new("editor"));

    assert_eq!(recorder.len(), 4);
    assert_eq!(coordinator.status(), Ready);
}

#[test]
fn test_unsubscribed_listener_stops_receiving() {
    let project = two_module_project();
    let coordinator = inline_coordinator(&project);
    let recorder = RecordingListener::new();
    let id = coordinator.subscribe(recorder.clone());
    coordinator.on_parse_requested(&Actor::new("editor"));
    assert_eq!(recorder.len(), 4);

    assert!(coordinator.unsubscribe(id));
    coordinator.on_parse_requested(&Actor::new("editor"));
    assert_eq!(recorder.len(), 4);
}
