use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version = "0.2.0", about = "Grid parameter sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Decode {
        config: PathBuf,
        index: u64,
        #[arg(long)]
        json: bool,
    },
    Plan {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Run {
        config: PathBuf,
        #[arg(long)]
        start: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { out, force } => {
            if !force && out.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    out.display()
                )));
            }
            if let Some(parent) = out.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&out, sweep_runner::config_template())?;
            println!("wrote: {}", out.display());
            println!(
                "next: edit {} and fill in surface.spreadsheet",
                out.display()
            );
            println!("next: sweep describe {}", out.display());
        }
        Commands::Describe { config, json } => {
            let summary = sweep_runner::describe_sweep(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Decode {
            config,
            index,
            json,
        } => {
            let setup = sweep_runner::load_config(&config)?.resolve()?;
            let combination = setup.grid.decode(index)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "decode",
                    "index": index,
                    "total_combinations": setup.grid.total_count(),
                    "assignment": assignment_to_json(&setup, &combination),
                })));
            }
            println!("index: {}", index);
            println!("total_combinations: {}", setup.grid.total_count());
            for (dim, (&position, &value)) in setup
                .grid
                .dimensions()
                .iter()
                .zip(combination.positions.iter().zip(&combination.values))
            {
                println!(
                    "{}: {} (position {}, cell {})",
                    dim.name, value, position, dim.cell
                );
            }
        }
        Commands::Plan { config, json } => {
            let (summary, plan) = sweep_runner::plan_sweep(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "summary": summary_to_json(&summary),
                    "start_index": plan.start_index,
                    "baseline_needed": plan.baseline_needed,
                })));
            }
            print_summary(&summary);
            println!("start_index: {}", plan.start_index);
            println!("baseline_needed: {}", plan.baseline_needed);
            if plan.start_index >= summary.total_count {
                println!("note: every combination is already recorded");
            }
        }
        Commands::Run {
            config,
            start,
            json,
        } => {
            let summary = sweep_runner::describe_sweep(&config)?;
            let report = sweep_runner::run_sweep(&config, start)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "report": report_to_json(&report),
                })));
            }
            print_summary(&summary);
            print_report(&report);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Decode { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Run { json, .. } => *json,
        _ => false,
    }
}

fn summary_to_json(summary: &sweep_runner::SweepSummary) -> Value {
    json!({
        "instrument": summary.instrument,
        "dataset": summary.dataset,
        "dimensions": summary
            .dimensions
            .iter()
            .map(|(name, cardinality)| json!({
                "name": name,
                "cardinality": cardinality,
            }))
            .collect::<Vec<_>>(),
        "total_combinations": summary.total_count,
        "metrics": summary.metric_names,
        "pacing_min_secs": summary.pacing_secs.0,
        "pacing_max_secs": summary.pacing_secs.1
    })
}

fn assignment_to_json(
    setup: &sweep_runner::SweepSetup,
    combination: &sweep_core::Combination,
) -> Value {
    setup
        .grid
        .dimensions()
        .iter()
        .zip(combination.positions.iter().zip(&combination.values))
        .map(|(dim, (&position, &value))| {
            json!({
                "name": dim.name,
                "cell": dim.cell,
                "position": position,
                "value": value,
            })
        })
        .collect::<Vec<_>>()
        .into()
}

fn report_to_json(report: &sweep_runner::RunReport) -> Value {
    json!({
        "instrument": report.instrument,
        "dataset": report.dataset,
        "total_combinations": report.total_count,
        "start_index": report.start_index,
        "baseline_pushed": report.baseline_pushed,
        "steps_completed": report.steps_completed,
        "records_accepted": report.records_accepted,
        "records_lost": report.records_lost,
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339()
    })
}

fn print_summary(summary: &sweep_runner::SweepSummary) {
    println!("instrument: {}", summary.instrument);
    println!("dataset: {}", summary.dataset);
    for (name, cardinality) in &summary.dimensions {
        println!("dimension: {} ({} values)", name, cardinality);
    }
    println!("total_combinations: {}", summary.total_count);
    println!("metrics: {}", summary.metric_names.join(", "));
    println!(
        "pacing_secs: {}..{}",
        summary.pacing_secs.0, summary.pacing_secs.1
    );
}

fn print_report(report: &sweep_runner::RunReport) {
    println!("start_index: {}", report.start_index);
    println!("baseline_pushed: {}", report.baseline_pushed);
    println!("steps_completed: {}", report.steps_completed);
    println!("records_accepted: {}", report.records_accepted);
    println!("records_lost: {}", report.records_lost);
    println!("started_at: {}", report.started_at.to_rfc3339());
    println!("finished_at: {}", report.finished_at.to_rfc3339());
}
