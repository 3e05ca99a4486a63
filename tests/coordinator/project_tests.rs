//! Directory projects, the file watcher and the CLI handlers

use std::sync::Arc;
use std::time::{Duration, Instant};

use parser_state::cli::{ParseArgs, WatchArgs};
use parser_state::commands::{run_parse, run_watch, CommandContext};
use parser_state::{
    Actor, CoordinatorConfig, DirectoryProject, LineScanPipeline, ModuleId, ModuleKind,
    ModuleProvider, ModuleWatcher, OutputFormat, ParseStatus, ParserStateConfig,
    ParserStateCoordinator, QualifiedName, WatcherConfig,
};

use crate::common::{TestProject, MODULE1, MODULE2, MODULE2_RENAMED, UNTERMINATED};

fn sample_project() -> TestProject {
    let project = TestProject::new();
    project
        .add_file("Module1.bas", MODULE1)
        .add_file("src/Module2.bas", MODULE2)
        .add_file("Customer.cls", "Private mName As String\n\nPublic Property Get Name() As String\n    Name = mName\nEnd Property\n")
        .add_file("README.txt", "not a module");
    project
}

// ============================================================================
// DIRECTORY PROJECTS
// ============================================================================

#[test]
fn test_directory_project_discovers_modules() {
    let project = sample_project();
    let modules = DirectoryProject::new(project.path_buf()).modules().unwrap();

    let names: Vec<_> = modules.iter().map(|m| m.id.as_str().to_string()).collect();
    assert_eq!(names, vec!["Customer", "Module1", "Module2"]);
    let customer = modules.iter().find(|m| m.id.as_str() == "Customer").unwrap();
    assert_eq!(customer.kind, ModuleKind::Class);
}

#[test]
fn test_directory_project_extension_filter() {
    let project = sample_project();
    let modules = DirectoryProject::new(project.path_buf())
        .with_extensions(vec![".cls".to_string()])
        .modules()
        .unwrap();

    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].id.as_str(), "Customer");
}

#[test]
fn test_coordinator_over_directory_tracks_file_changes() {
    let project = sample_project();
    let coordinator = ParserStateCoordinator::new(
        LineScanPipeline::new(),
        Arc::new(DirectoryProject::new(project.path_buf())),
        &CoordinatorConfig::inline(),
    )
    .unwrap();
    let editor = Actor::new("editor");

    coordinator.on_parse_requested(&editor);
    assert_eq!(coordinator.status(), ParseStatus::Ready);
    assert_eq!(coordinator.module_statuses().len(), 3);

    project.add_file("src/Module2.bas", MODULE2_RENAMED);
    coordinator.on_modules_changed(&editor, [ModuleId::new("Module2")]);
    let index = coordinator.current_index();
    assert!(index
        .get(&QualifiedName::member(ModuleId::new("Module2"), "Helper2"))
        .is_some());

    project.remove_file("Customer.cls");
    coordinator.on_parse_requested(&editor);
    assert!(coordinator.module_status(&ModuleId::new("Customer")).is_none());
    assert_eq!(coordinator.current_index().generation(), 3);
}

// ============================================================================
// WATCHER
// ============================================================================

#[test]
fn test_watcher_reparses_saved_module() {
    let project = sample_project();
    let coordinator = ParserStateCoordinator::new(
        LineScanPipeline::new(),
        Arc::new(DirectoryProject::new(project.path_buf())),
        &CoordinatorConfig::background(),
    )
    .unwrap();
    coordinator.on_parse_requested(&Actor::new("editor"));
    assert!(coordinator.wait_until_idle(Duration::from_secs(10)));

    let config = WatcherConfig {
        debounce_ms: 50,
        ..WatcherConfig::default()
    };
    let watcher = ModuleWatcher::with_config(project.path_buf(), config);
    let handle = watcher.start(coordinator.clone()).unwrap();
    assert!(handle.is_running());
    std::thread::sleep(Duration::from_millis(200));

    project.add_file("src/Module2.bas", MODULE2_RENAMED);

    let renamed = QualifiedName::member(ModuleId::new("Module2"), "Helper2");
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut found = false;
    while Instant::now() < deadline {
        coordinator.wait_until_idle(Duration::from_secs(1));
        if coordinator.current_index().get(&renamed).is_some() {
            found = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    handle.stop();
    assert!(found, "watcher did not trigger a reparse");
    assert!(handle.requests_sent() >= 1);
}

// ============================================================================
// CLI HANDLERS
// ============================================================================

#[test]
fn test_parse_command_with_config_file() {
    let project = sample_project();
    let config_path = project.path().join("parser-state.toml");
    std::fs::write(
        &config_path,
        "[coordinator]\nparallel_syntax = true\n\n[watcher]\nextensions = [\"bas\"]\n",
    )
    .unwrap();

    let config = ParserStateConfig::load(&config_path).unwrap();
    assert!(config.coordinator.parallel_syntax);
    let ctx = CommandContext::new(OutputFormat::Json, false, config);
    let args = ParseArgs {
        dir: project.path_buf(),
        ext: Vec::new(),
        declarations: false,
    };

    let output = run_parse(&args, &ctx).unwrap();
    assert_eq!(output.exit_status, 0);
    let report: serde_json::Value = serde_json::from_str(&output.text).unwrap();
    assert_eq!(report["status"], "ready");
    assert_eq!(report["generation"], 1);
    // Only .bas files are modules under this config
    let modules = report["modules"].as_object().unwrap();
    assert_eq!(modules.len(), 2);
    assert!(!modules.contains_key("Customer"));
}

#[test]
fn test_parse_command_reports_syntax_error_exit_status() {
    let project = sample_project();
    project.add_file("Broken.bas", UNTERMINATED);
    let args = ParseArgs {
        dir: project.path_buf(),
        ext: Vec::new(),
        declarations: false,
    };

    let output = run_parse(&args, &CommandContext::default()).unwrap();
    assert_eq!(output.exit_status, 3);
    assert!(output.text.contains("status: error"));
    assert!(output.text.contains("Broken"));
}

#[test]
fn test_watch_command_runs_for_duration() {
    let project = sample_project();
    let args = WatchArgs {
        dir: project.path_buf(),
        ext: Vec::new(),
        duration: Some(1),
    };

    let started = Instant::now();
    let output = run_watch(&args, &CommandContext::default()).unwrap();
    assert_eq!(output.exit_status, 0);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[test]
fn test_watch_command_rejects_missing_dir() {
    let project = TestProject::new();
    let args = WatchArgs {
        dir: project.path().join("absent"),
        ext: Vec::new(),
        duration: Some(1),
    };
    assert!(run_watch(&args, &CommandContext::default()).is_err());
}
