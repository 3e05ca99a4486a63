//! `watch` command: keep a project parsed while its files change
//!
//! Runs passes on the background worker, raises requests from a
//! [`ModuleWatcher`] and streams every transition to stdout. Finished passes
//! are reported as `pass_completed` records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::{OutputFormat, WatchArgs};
use crate::config::{CoordinatorConfig, ExecutionMode};
use crate::coordinator::ParserStateCoordinator;
use crate::error::{ParserStateError, Result};
use crate::events::{Actor, EventEmitter, PassCompletedEvent, StateChangedEvent};
use crate::pipeline::LineScanPipeline;
use crate::watcher::ModuleWatcher;

use super::{CommandContext, CommandOutput};

/// Run the watch command
pub fn run_watch(args: &WatchArgs, ctx: &CommandContext) -> Result<CommandOutput> {
    if !args.dir.is_dir() {
        return Err(ParserStateError::ModuleSource {
            message: format!("{} is not a directory", args.dir.display()),
        });
    }

    let project = ctx.project(&args.dir, &args.ext);
    let config = CoordinatorConfig {
        execution: ExecutionMode::Background,
        ..ctx.config.coordinator.clone()
    };
    let coordinator =
        ParserStateCoordinator::new(LineScanPipeline::new(), Arc::new(project.clone()), &config)?;

    let emitter = Arc::new(EventEmitter::stdout());
    let format = ctx.format;
    let events = Arc::clone(&emitter);
    let subscription = coordinator.subscribe_fn(move |event: &StateChangedEvent| {
        match format {
            OutputFormat::Json => events.emit(event)?,
            OutputFormat::Text => println!(
                "[{}] {} -> {} ({})",
                event.sequence, event.previous, event.current, event.actor
            ),
        }
        Ok(())
    });

    let mut watcher_config = ctx.config.watcher.clone();
    watcher_config.extensions = project.extensions().to_vec();
    let watcher = ModuleWatcher::with_config(args.dir.clone(), watcher_config);
    let handle = watcher.start(coordinator.clone())?;

    coordinator.on_parse_requested(&Actor::new("cli"));

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut reported = 0;
    while handle.is_running() {
        reported = report_passes(&coordinator, &emitter, format, reported)?;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    handle.stop();
    coordinator.wait_until_idle(Duration::from_secs(5));
    report_passes(&coordinator, &emitter, format, reported)?;
    coordinator.unsubscribe(subscription);
    tracing::info!(
        "[WATCHER] Stopped after {} request(s)",
        handle.requests_sent()
    );

    Ok(CommandOutput::success(String::new()))
}

/// Emit a summary for the latest pass if passes finished since `reported`.
/// Returns the number of finished passes seen.
fn report_passes(
    coordinator: &ParserStateCoordinator<LineScanPipeline>,
    emitter: &EventEmitter,
    format: OutputFormat,
    reported: u64,
) -> Result<u64> {
    let stats = coordinator.stats();
    let finished = stats.passes_completed + stats.passes_failed;
    if finished == reported {
        return Ok(reported);
    }
    let Some(summary) = stats.last_pass else {
        return Ok(finished);
    };

    let (status, index) = coordinator.snapshot();
    let completed = PassCompletedEvent::from_summary(&summary, status, index.len());
    match format {
        OutputFormat::Json => emitter.emit(&completed)?,
        OutputFormat::Text => println!(
            "pass {}: {} declarations, {} parsed, {} reused, {} failed ({}ms)",
            completed.generation,
            completed.declarations,
            completed.modules_parsed,
            completed.modules_reused,
            completed.failed_modules.len(),
            completed.duration_ms
        ),
    }
    Ok(finished)
}
