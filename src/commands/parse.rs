//! `parse` command: one inline pass over a project directory

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::json;

use crate::cli::{OutputFormat, ParseArgs};
use crate::config::{CoordinatorConfig, ExecutionMode};
use crate::coordinator::ParserStateCoordinator;
use crate::declarations::DeclarationIndex;
use crate::error::{ParserStateError, Result};
use crate::events::Actor;
use crate::pipeline::LineScanPipeline;
use crate::status::ParseStatus;

use super::{CommandContext, CommandOutput};

/// Run the parse command
pub fn run_parse(args: &ParseArgs, ctx: &CommandContext) -> Result<CommandOutput> {
    if !args.dir.is_dir() {
        return Err(ParserStateError::ModuleSource {
            message: format!("{} is not a directory", args.dir.display()),
        });
    }

    let project = ctx.project(&args.dir, &args.ext);
    let config = CoordinatorConfig {
        execution: ExecutionMode::Inline,
        ..ctx.config.coordinator.clone()
    };
    let coordinator =
        ParserStateCoordinator::new(LineScanPipeline::new(), Arc::new(project), &config)?;

    coordinator.on_parse_requested(&Actor::new("cli"));
    let (status, index) = coordinator.snapshot();

    let text = match ctx.format {
        OutputFormat::Json => format_json(&coordinator, status, &index, args.declarations)?,
        OutputFormat::Text => format_text(&coordinator, status, &index, args.declarations),
    };

    let exit_status = match (status, coordinator.last_error()) {
        (ParseStatus::Error, Some(failure)) => failure.to_error().exit_status(),
        (ParseStatus::Error, None) => 1,
        _ => 0,
    };
    Ok(CommandOutput { text, exit_status })
}

fn format_text(
    coordinator: &ParserStateCoordinator<LineScanPipeline>,
    status: ParseStatus,
    index: &DeclarationIndex,
    list_declarations: bool,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "status: {}", status);
    let _ = writeln!(out, "generation: {}", index.generation());
    let _ = writeln!(
        out,
        "declarations: {} ({} references)",
        index.len(),
        index.reference_count()
    );

    let modules = coordinator.module_statuses();
    if !modules.is_empty() {
        let _ = writeln!(out, "modules:");
        for (module, module_status) in &modules {
            let _ = writeln!(
                out,
                "  {:<24} {:<8} {} declarations",
                module.as_str(),
                module_status.as_str(),
                index.declarations_in(module).count()
            );
        }
    }

    if list_declarations {
        let _ = writeln!(out, "symbols:");
        for declaration in index.declarations() {
            let _ = writeln!(
                out,
                "  {} [{:?}] line {} ({} refs)",
                declaration.name,
                declaration.kind,
                declaration.line,
                index.references_to(&declaration.name).len()
            );
        }
    }

    if let Some(failure) = coordinator.last_error() {
        let _ = writeln!(out, "error: {}", failure);
    }
    out
}

fn format_json(
    coordinator: &ParserStateCoordinator<LineScanPipeline>,
    status: ParseStatus,
    index: &DeclarationIndex,
    list_declarations: bool,
) -> Result<String> {
    let modules: serde_json::Map<String, serde_json::Value> = coordinator
        .module_statuses()
        .into_iter()
        .map(|(module, module_status)| (module.to_string(), json!(module_status)))
        .collect();

    let mut report = json!({
        "status": status,
        "generation": index.generation(),
        "declarations": index.len(),
        "references": index.reference_count(),
        "modules": modules,
        "stats": coordinator.stats(),
        "error": coordinator.last_error().map(|f| f.to_string()),
    });
    if list_declarations {
        report["symbols"] = json!(index.declarations().collect::<Vec<_>>());
    }

    let mut text = serde_json::to_string_pretty(&report).map_err(|e| {
        ParserStateError::Io(std::io::Error::other(format!(
            "JSON serialization failed: {}",
            e
        )))
    })?;
    text.push('\n');
    Ok(text)
}

// ============================================================================
// Tests
// ============================================================================
