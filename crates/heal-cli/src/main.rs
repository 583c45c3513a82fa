//! selfheal - command-line front end for the self-heal pipeline
//!
//! Subcommands:
//! - `demo`: break the catalog sync, let the coordinator heal it, print the timeline
//! - `check`: run the guardrail battery over a proposed edit
//! - `config`: print the effective configuration as TOML

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use heal_agents::{GuardrailEngine, ReferenceAgents, ReturnRequest};
use heal_core::{Coordinator, DiagnosisMode, HealCompletion, Patch, SelfHealConfig};
use heal_events::{CorrelationId, EventBus, EventFilter, EventType, InMemoryEventBus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("selfheal")
        .version(heal_core::VERSION)
        .about("Event-driven self-healing pipeline")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log filter used when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .subcommand(
            Command::new("demo")
                .about("Run the return-policy heal end to end")
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_parser(["inline", "await-event"])
                        .help("Diagnosis topology (overrides the config file)"),
                )
                .arg(
                    Arg::new("sku")
                        .long("sku")
                        .default_value("SKU-1001")
                        .help("Product of the failing return request"),
                )
                .arg(
                    Arg::new("order")
                        .long("order")
                        .default_value("ORD-12345")
                        .help("Order of the failing return request"),
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("check")
                .about("Evaluate guardrails for an edit")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Current source file"),
                )
                .arg(
                    Arg::new("updated-text-file")
                        .long("updated-text-file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("File holding the proposed text"),
                )
                .arg(
                    Arg::new("target")
                        .long("target")
                        .help("Repository path matched against file patterns (defaults to --file)"),
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(config_arg()),
        )
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file")
}

fn init_tracing(matches: &ArgMatches) {
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if matches.get_one::<String>("log-format").map(String::as_str) == Some("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<SelfHealConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => SelfHealConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(SelfHealConfig::default()),
    }
}

/// Upper bound on one demo workflow
fn demo_deadline(config: &SelfHealConfig) -> Duration {
    let coordinator = &config.coordinator;
    coordinator.diagnosis_timeout() + coordinator.stage_timeout() * 6
}

async fn run_demo(args: &ArgMatches) -> Result<bool> {
    let mut config = load_config(args)?;
    if let Some(mode) = args.get_one::<String>("mode") {
        config.coordinator.diagnosis_mode = mode.parse::<DiagnosisMode>().map_err(anyhow::Error::msg)?;
    }
    let sku = args.get_one::<String>("sku").map_or("SKU-1001", String::as_str);
    let order = args.get_one::<String>("order").map_or("ORD-12345", String::as_str);

    let bus = Arc::new(InMemoryEventBus::new(config.bus.clone()));
    let mut completions = bus.subscribe(EventFilter::types([EventType::HealCompleted]));
    let agents = ReferenceAgents::new(bus.clone(), config.guardrails.clone());
    let coordinator = Coordinator::new(config.coordinator.clone(), bus.clone(), agents.services());
    let handle = coordinator.start().context("starting coordinator")?;
    let watcher = (config.coordinator.diagnosis_mode == DiagnosisMode::AwaitEvent)
        .then(|| agents.watcher().spawn());

    println!("Self-heal demo ({} diagnosis)", config.coordinator.diagnosis_mode);
    println!();

    let monitor = agents.monitor();
    let id = match monitor.simulate_return_request(sku, order).await? {
        ReturnRequest::Served(response) => {
            println!("Return request served, nothing to heal:");
            println!("{}", serde_json::to_string_pretty(&response)?);
            handle.shutdown().await;
            return Ok(true);
        }
        ReturnRequest::Failed { correlation_id, error } => {
            println!("Return request failed: {error}");
            println!("Correlation id: {correlation_id}");
            correlation_id
        }
    };

    let wait = async {
        while let Some(event) = completions.recv().await {
            if event.correlation_id() == Some(&id) {
                return HealCompletion::from_event(&event).ok();
            }
        }
        None
    };
    let completion = tokio::time::timeout(demo_deadline(&config), wait)
        .await
        .context("timed out waiting for heal.completed")?
        .context("event bus closed before heal.completed")?;

    print_timeline(bus.as_ref(), &id).await;
    println!();
    println!("Completion:");
    println!("{}", serde_json::to_string_pretty(&completion)?);

    if completion.is_success() {
        println!();
        match monitor.simulate_return_request(sku, order).await? {
            ReturnRequest::Served(response) => {
                println!("Retried return request:");
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            ReturnRequest::Failed { error, .. } => println!("Retried return request still fails: {error}"),
        }
    }

    let report = handle.shutdown().await;
    tracing::debug!(?report, "coordinator stopped");
    bus.close();
    if let Some(watcher) = watcher {
        watcher.await.context("diagnosis watcher panicked")?;
    }
    Ok(completion.is_success())
}

async fn print_timeline(bus: &InMemoryEventBus, id: &CorrelationId) {
    println!();
    println!("Timeline:");
    let history = bus.history(id).await;
    let Some(first) = history.first().map(|event| event.timestamp) else {
        return;
    };
    for event in &history {
        let offset = (event.timestamp - first).num_milliseconds();
        let hint = event.ui_hint.as_deref().unwrap_or("-");
        println!("  +{offset:>6}ms  {:<20} {hint}", event.event_type.as_str());
    }
}

fn run_check(args: &ArgMatches) -> Result<bool> {
    let config = load_config(args)?;
    let file = args.get_one::<PathBuf>("file").context("--file is required")?;
    let updated = args
        .get_one::<PathBuf>("updated-text-file")
        .context("--updated-text-file is required")?;
    let target = args
        .get_one::<String>("target")
        .cloned()
        .unwrap_or_else(|| file.display().to_string());

    let original_text =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let updated_text =
        std::fs::read_to_string(updated).with_context(|| format!("reading {}", updated.display()))?;

    let patch = Patch::new(target, original_text, updated_text);
    let verdict = GuardrailEngine::new(config.guardrails).evaluate(&patch);

    println!("Guardrails for {} ({} changed lines):", patch.target_file, patch.changed_line_count);
    for check in &verdict.checks {
        let mark = if check.passed { "PASS" } else { "FAIL" };
        println!("  {mark} {:<18} risk {:.2}  {}", check.rule_name, check.risk_score, check.message);
    }
    println!();
    println!("Total risk: {:.2}", verdict.total_risk);
    println!("Status: {}", if verdict.safe { "SAFE" } else { "REJECTED" });
    Ok(verdict.safe)
}

fn run_config(args: &ArgMatches) -> Result<bool> {
    let config = load_config(args)?;
    print!("{}", config.to_toml_string()?);
    Ok(true)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(&matches);

    let result = match matches.subcommand() {
        Some(("demo", args)) => run_demo(args).await,
        Some(("check", args)) => run_check(args),
        Some(("config", args)) => run_config(args),
        _ => {
            // Nothing to do without a subcommand
            let _ = cli().print_help();
            Ok(true)
        }
    };

    match result {
        Ok(ok) => std::process::exit(if ok { 0 } else { 1 }),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}
