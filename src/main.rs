use anyhow::{Context, Result};
use cirun::cli::commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use cirun::cli::output::*;
use cirun::cli::{Cli, Command};
use cirun::core::{expand, load_file, PipelineDefinition, PipelineStatus, RuntimeTarget};
use cirun::execution::ExecutionEngine;
use cirun::persistence::{create_summary, ExecutionSummary, InMemoryPersistence, PersistenceBackend};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    let store = cirun::persistence::SqliteExecutionStore::with_default_path()
        .await
        .context("Failed to open run history")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(InMemoryPersistence::new()))
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli) -> Result<()> {
    let definition = load_file(&cmd.file)
        .with_context(|| format!("Failed to load pipeline {}", cmd.file.display()))?;

    if !cmd.json {
        println!("{} Loaded pipeline: {}", INFO, style(&definition.name).bold());
    }

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    let mut engine = ExecutionEngine::new(cmd.engine_config());
    if !cli.quiet && !cmd.json {
        engine.add_event_handler(progress_handler(create_progress_bar(0)));
    }

    // Ctrl-C cancels the run; always steps still get to clean up
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });

    let outcome = engine
        .run_pipeline(&definition, &cmd.trigger_event())
        .await
        .context("Pipeline could not be run")?;

    if !cmd.no_history {
        let summary = create_summary(&outcome);
        match store.save_execution(&summary).await {
            Ok(()) if !cmd.json => println!(
                "{} Run saved to history (ID: {})",
                INFO,
                style(&summary.execution_id.to_string()[..8]).dim()
            ),
            Ok(()) => {}
            Err(e) => warn!("Failed to save run to history: {:#}", e),
        }
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("\n{}", format_report(&outcome, terminal_width()));
    }

    if !outcome.is_success() {
        std::process::exit(outcome.exit_code());
    }

    Ok(())
}

fn describe_definition(definition: &PipelineDefinition) -> serde_json::Value {
    let jobs: Vec<serde_json::Value> = definition
        .jobs
        .iter()
        .enumerate()
        .map(|(index, job)| {
            let instances: Vec<String> = expand(job, index).iter().map(|i| i.label()).collect();
            serde_json::json!({
                "name": job.name,
                "required": job.is_required(),
                "runs_on": match &job.runs_on {
                    RuntimeTarget::Native => "native".to_string(),
                    RuntimeTarget::Container { image } => format!("container:{}", image),
                },
                "needs": job.needs.iter().map(|d| serde_json::json!({
                    "job": d.job,
                    "policy": d.policy,
                })).collect::<Vec<_>>(),
                "steps": job.steps.len(),
                "instances": instances,
            })
        })
        .collect();

    serde_json::json!({
        "name": definition.name,
        "concurrency": definition.concurrency,
        "jobs": jobs,
    })
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    let definition = match load_file(&cmd.file) {
        Ok(definition) => definition,
        Err(e) => {
            error!("Validation of {} failed: {}", cmd.file.display(), e);
            println!("{}", format_definition_error(&e));
            std::process::exit(1);
        }
    };

    if cmd.json {
        let json = serde_json::to_string_pretty(&describe_definition(&definition))?;
        println!("{}", json);
        return Ok(());
    }

    println!("{} Pipeline definition is valid!", CHECK);
    println!("  Name: {}", style(&definition.name).bold());
    println!("  Jobs: {}", style(definition.jobs.len()).cyan());

    for (index, job) in definition.jobs.iter().enumerate() {
        let instances = expand(job, index);
        let needs: Vec<String> = job.needs.iter().map(|d| d.job.clone()).collect();
        println!(
            "  {} {} ({} steps, {} instances){}{}",
            ROCKET,
            style(&job.name).bold(),
            job.steps.len(),
            style(instances.len()).cyan(),
            if needs.is_empty() {
                String::new()
            } else {
                format!(" needs {}", needs.join(", "))
            },
            if job.is_required() {
                String::new()
            } else {
                style(" (optional)").dim().to_string()
            }
        );
        for instance in instances.iter().filter(|i| !i.bindings.is_empty()) {
            println!("      {}", style(instance.bindings.to_string()).dim());
        }
    }

    Ok(())
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if cmd.json {
        let mut json_data = Vec::new();
        for pipeline in &pipelines {
            let executions = store.list_executions(pipeline).await?;
            json_data.push(serde_json::json!({
                "name": pipeline,
                "execution_count": executions.len(),
            }));
        }
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);

    for pipeline_name in &pipelines {
        if cmd.with_counts {
            let executions = store.list_executions(pipeline_name).await?;
            let succeeded = executions.iter().filter(|e| e.status == PipelineStatus::Succeeded).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(executions.len()).cyan(),
                style(succeeded).green(),
                style(executions.len() - succeeded).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;

        if cmd.delete {
            store.delete_execution(exec_id).await?;
            println!("{} Deleted run {}", INFO, style(exec_id).dim());
            return Ok(());
        }

        match store.load_execution(exec_id).await? {
            Some(summary) => print_execution_details(&summary, cmd.verbose || cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let executions: Vec<ExecutionSummary> = if let Some(pipeline_name) = &cmd.pipeline {
        store
            .list_executions(pipeline_name)
            .await?
            .into_iter()
            .take(cmd.limit)
            .collect()
    } else {
        let mut all_execs = Vec::new();
        for pipeline in store.list_pipelines().await? {
            all_execs.extend(store.list_executions(&pipeline).await?);
        }
        all_execs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all_execs.into_iter().take(cmd.limit).collect()
    };

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }

    Ok(())
}

fn print_execution_details(summary: &ExecutionSummary, verbose: bool) -> Result<()> {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Event: {}", style(&summary.event).cyan());
    println!("  Status: {}", format_status(summary.status));
    if summary.cancelled {
        println!("  {}", style("Cancelled").yellow());
    }
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Instances: {} total, {} succeeded, {} failed, {} skipped",
        summary.total_instances,
        style(summary.succeeded_instances).green(),
        style(summary.failed_instances).red(),
        style(summary.skipped_instances).dim()
    );

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
