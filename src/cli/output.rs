//! CLI output formatting

use crate::{
    core::{DefinitionError, InstanceState, PipelineStatus, StepStatus},
    execution::{ExecutionEvent, ExecutionResult},
    persistence::ExecutionSummary,
    report::PipelineOutcome,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Event handler printing live progress above a progress bar
pub fn progress_handler(progress: ProgressBar) -> impl Fn(ExecutionEvent) + Send + Sync + 'static {
    move |event| {
        match &event {
            ExecutionEvent::PipelineStarted {
                total_instances, ..
            } => progress.set_length(*total_instances as u64),
            ExecutionEvent::InstanceStarted { label, .. } => progress.set_message(label.clone()),
            ExecutionEvent::InstanceFinished { .. } => progress.inc(1),
            ExecutionEvent::PipelineFinished { .. } => progress.finish_and_clear(),
            _ => {}
        }
        if let Some(line) = format_execution_event(&event) {
            progress.println(line);
        }
    }
}

/// Format a pipeline status for display
pub fn format_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        PipelineStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format an instance state for display
pub fn format_instance_state(state: &InstanceState) -> String {
    match state {
        InstanceState::Pending | InstanceState::Blocked => {
            style(state.label().to_uppercase()).dim().to_string()
        }
        InstanceState::Runnable | InstanceState::Running { .. } => {
            style(state.label().to_uppercase()).yellow().to_string()
        }
        InstanceState::Succeeded => style("SUCCEEDED").green().to_string(),
        InstanceState::Failed { kind } => style(format!("FAILED ({})", kind)).red().to_string(),
        InstanceState::Skipped { reason } => {
            style(format!("SKIPPED ({})", reason)).dim().to_string()
        }
    }
}

fn step_icon(status: StepStatus) -> Emoji<'static, 'static> {
    match status {
        StepStatus::Succeeded => CHECK,
        StepStatus::Skipped => SKIP,
        StepStatus::Failed | StepStatus::TimedOut | StepStatus::Cancelled => CROSS,
    }
}

fn instance_icon(state: &InstanceState) -> Emoji<'static, 'static> {
    match state {
        InstanceState::Succeeded => CHECK,
        InstanceState::Failed { .. } => CROSS,
        InstanceState::Skipped { .. } => SKIP,
        _ => SPINNER,
    }
}

/// Format run summary for the history listing
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        PipelineStatus::Succeeded => CHECK,
        PipelineStatus::Failed => CROSS,
    };

    format!(
        "{} {} - {} - {} [{}] ({} ok, {} failed, {} skipped of {}) - {}",
        status_icon,
        style(&summary.execution_id.to_string()[..8]).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        style(&summary.event).cyan(),
        summary.succeeded_instances,
        summary.failed_instances,
        summary.skipped_instances,
        summary.total_instances,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// Format an execution event for display; `None` for events not worth a line
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            total_instances,
        } => format!(
            "{} Starting pipeline {} ({}) with {} instances",
            ROCKET,
            style(pipeline_name).bold(),
            style(&execution_id.to_string()[..8]).dim(),
            style(total_instances).cyan()
        ),
        ExecutionEvent::InstanceStarted { label, .. } => {
            format!("{} {}", SPINNER, style(label).cyan())
        }
        ExecutionEvent::StepStarted { .. } => return None,
        ExecutionEvent::StepFinished {
            label,
            step,
            status,
            ..
        } => {
            if *status == StepStatus::Succeeded {
                return None;
            }
            format!(
                "{}   {} / {} {}",
                step_icon(*status),
                style(label).dim(),
                step,
                style(format!("{:?}", status).to_lowercase()).dim()
            )
        }
        ExecutionEvent::InstanceFinished { label, state, .. } => format!(
            "{} {} {}",
            instance_icon(state),
            style(label).bold(),
            format_instance_state(state)
        ),
        ExecutionEvent::PipelineFinished {
            execution_id,
            status,
            cancelled,
        } => format!(
            "{} Pipeline ({}) {}{}",
            INFO,
            style(&execution_id.to_string()[..8]).dim(),
            format_status(*status),
            if *cancelled {
                style(" (cancelled)").yellow().to_string()
            } else {
                String::new()
            }
        ),
    };
    Some(line)
}

/// Headline and detail for a definition that failed to load
pub fn format_definition_error(error: &DefinitionError) -> String {
    let headline = if error.is_graph_error() {
        "Invalid job dependencies:"
    } else {
        "Validation failed:"
    };
    format!("{} {}\n  {}", CROSS, headline, style(error).red())
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

/// Terminal width for separators, 80 when unknown
pub fn terminal_width() -> usize {
    term_size::dimensions()
        .map(|(w, _)| w)
        .unwrap_or(80)
        .clamp(20, 120)
}

fn format_failure(result: &ExecutionResult, out: &mut String) {
    if let Some(error) = &result.error {
        let _ = writeln!(out, "      {}", style(error).red());
    }
    if let Some(step) = result.first_failed_step() {
        let _ = writeln!(
            out,
            "      {} step '{}': {}",
            step_icon(step.status),
            step.name,
            style(step.message.as_deref().unwrap_or("failed")).red()
        );
        let output = if step.stderr.trim().is_empty() {
            &step.stdout
        } else {
            &step.stderr
        };
        for line in format_output(output.trim_end(), 5).lines() {
            let _ = writeln!(out, "        {}", style(line).dim());
        }
    }
}

/// Render the final run report
pub fn format_report(outcome: &PipelineOutcome, width: usize) -> String {
    let mut out = String::new();
    let rule = "─".repeat(width);

    let _ = writeln!(out, "{}", style(&rule).dim());
    let _ = writeln!(
        out,
        "{} {} [{}]",
        INFO,
        style(&outcome.pipeline).bold(),
        style(&outcome.event.kind).cyan()
    );

    for summary in &outcome.summaries {
        let icon = if summary.failed > 0 {
            CROSS
        } else if summary.succeeded == 0 && summary.skipped > 0 {
            SKIP
        } else {
            CHECK
        };
        let _ = writeln!(
            out,
            "{} {}{} {} total: {} succeeded, {} failed, {} skipped",
            icon,
            style(&summary.job).bold(),
            if summary.required {
                String::new()
            } else {
                style(" (optional)").dim().to_string()
            },
            summary.total,
            style(summary.succeeded).green(),
            style(summary.failed).red(),
            style(summary.skipped).dim()
        );

        for result in outcome.results_for(&summary.job) {
            let _ = writeln!(
                out,
                "    {}{} {}",
                instance_icon(&result.status),
                result.label,
                format_instance_state(&result.status)
            );
            if result.is_failed() {
                format_failure(result, &mut out);
            }
        }
    }

    if !outcome.artifacts.is_empty() {
        let _ = writeln!(out, "{} Artifacts", INFO);
        for artifact in &outcome.artifacts {
            let _ = writeln!(
                out,
                "    {} ({}) {}",
                artifact.name,
                style(&artifact.instance).dim(),
                style(&artifact.url).cyan()
            );
        }
    }

    let _ = writeln!(out, "{}", style(&rule).dim());
    let duration = outcome.duration().to_std().unwrap_or_default();
    let _ = write!(
        out,
        "{} {} {} in {}",
        if outcome.is_success() { CHECK } else { CROSS },
        style(&outcome.pipeline).bold(),
        format_status(outcome.status),
        format_duration(duration)
    );
    if outcome.cancelled {
        let _ = write!(out, " {}", style("(cancelled)").yellow());
    }
    out
}

/// Human-readable duration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 1 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
