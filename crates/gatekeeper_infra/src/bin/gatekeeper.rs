//! gatekeeper - adaptive policy gate CLI.
//!
//! `evaluate` is the host hook: one event JSON on stdin, one decision JSON on stdout.
//! The remaining subcommands are the administrative surface.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use gatekeeper_core::ledger::RetentionPolicy;
use gatekeeper_core::{GateDecision, GateEvent};
use gatekeeper_infra::config::GatekeeperConfig;
use gatekeeper_infra::logging::init_logging;
use gatekeeper_infra::{GateRunner, ResetScope, RunnerError, StatusReport, now_ms};
use tracing::error;

/// gatekeeper - adaptive policy gate
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, env = "GATEKEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding policy state (overrides the config file)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Policy domain; selects `<state_dir>/<domain>.json`
    #[arg(long, global = true)]
    domain: Option<String>,

    /// Log filter (trace, debug, info, warn, error); defaults to GATEKEEPER_LOG or warn
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate one event read from stdin and print the decision
    Evaluate,

    /// Report the outcome of a HalfOpen probe
    Outcome(OutcomeArgs),

    /// Print threshold, phase, and telemetry per rule
    Report {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Record a false positive for a rule (feeds the tuner like an override)
    ForceFp {
        /// Rule id
        rule_id: String,

        /// Target the false positive was raised on
        #[arg(long)]
        target: Option<String>,

        /// Free-form reason tag
        #[arg(long, default_value = "force-fp")]
        reason: String,
    },

    /// Set a rule's threshold, clamped to its tunable range
    SetThreshold {
        /// Rule id
        rule_id: String,

        /// New threshold
        value: f64,
    },

    /// Clear circuit, window, and tuner state
    Reset {
        /// Reset a single rule
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        rule: Option<String>,

        /// Reset every rule
        #[arg(long)]
        all: bool,
    },

    /// Retention sweep over recorded overrides
    PruneOverrides {
        /// Drop overrides older than this many days (default from config)
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Keep at most this many overrides (default from config)
        #[arg(long)]
        max_count: Option<usize>,
    },

    /// List the loaded rule catalog
    Rules,
}

#[derive(Args, Debug)]
struct OutcomeArgs {
    /// Rule id the probe was allowed for
    #[arg(long)]
    rule: String,

    /// Target of the probed action
    #[arg(long)]
    target: String,

    /// The probed action did not re-violate the rule
    #[arg(long, conflicts_with = "failed", required_unless_present = "failed")]
    succeeded: bool,

    /// The probed action re-violated the rule
    #[arg(long)]
    failed: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = GatekeeperConfig::load(cli.config.as_deref()).and_then(|config| {
        let config = match &cli.state_dir {
            Some(dir) => config.with_state_dir(dir),
            None => config,
        };
        match &cli.domain {
            Some(domain) => config.with_domain(domain.as_str()),
            None => Ok(config),
        }
    });
    let runner = config.and_then(|config| GateRunner::from_config(&config));

    let runner = match runner {
        Ok(runner) => runner,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            if matches!(cli.command, Commands::Evaluate) {
                print_decision(&GateDecision::fail_open());
            } else {
                eprintln!("gatekeeper: {err}");
            }
            return ExitCode::from(1);
        }
    };

    match run(&runner, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gatekeeper: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(runner: &GateRunner, command: Commands) -> Result<(), RunnerError> {
    let now = now_ms();
    match command {
        Commands::Evaluate => {
            let decision = match read_event() {
                Some(event) => runner.evaluate(&event, now),
                None => GateDecision::fail_open(),
            };
            print_decision(&decision);
        }
        Commands::Outcome(args) => {
            let applied = runner.report_outcome(&args.rule, &args.target, args.succeeded, now)?;
            println!("{}: {:?}", args.rule, applied);
        }
        Commands::Report { json } => {
            let report = runner.report(now)?;
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(err) => error!(error = %err, "report serialization failed"),
                }
            } else {
                print_report(&report);
            }
        }
        Commands::ForceFp {
            rule_id,
            target,
            reason,
        } => {
            runner.force_false_positive(&rule_id, target.as_deref(), &reason, now)?;
            println!("{rule_id}: false positive recorded");
        }
        Commands::SetThreshold { rule_id, value } => {
            let applied = runner.set_threshold(&rule_id, value, now)?;
            println!("{rule_id}: threshold set to {applied}");
        }
        Commands::Reset { rule, all } => {
            let scope = match rule {
                Some(rule) if !all => ResetScope::Rule(rule),
                _ => ResetScope::All,
            };
            let outcome = runner.reset(&scope, now)?;
            if let Some(path) = outcome.quarantined {
                println!("unreadable state moved to {}", path.display());
            }
            match scope {
                ResetScope::Rule(rule) => println!("{rule}: state reset"),
                ResetScope::All => println!("all rules reset"),
            }
        }
        Commands::PruneOverrides {
            max_age_days,
            max_count,
        } => {
            let defaults = runner.retention();
            let policy = RetentionPolicy {
                max_age: max_age_days
                    .map(|days| Duration::from_secs(days.saturating_mul(86_400)))
                    .unwrap_or(defaults.max_age),
                max_count: max_count.unwrap_or(defaults.max_count),
            };
            let removed = runner.prune_overrides(now, policy)?;
            println!(
                "{} override(s) and {} grant(s) pruned",
                removed.events, removed.grants
            );
        }
        Commands::Rules => {
            for rule in runner.gate().catalog().iter() {
                println!(
                    "{:<22} {:<12} base {:<5} range {}-{} window {:<16} {}",
                    rule.id,
                    rule.category.as_str(),
                    rule.base_threshold,
                    rule.tunable_range.min,
                    rule.tunable_range.max,
                    rule.window.describe(),
                    rule.description
                );
            }
        }
    }
    Ok(())
}

/// Parse the host event from stdin. Malformed input fails open.
fn read_event() -> Option<GateEvent> {
    let mut raw = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
        error!(error = %err, "cannot read event from stdin; failing open");
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(event) => Some(event),
        Err(err) => {
            error!(error = %err, "malformed event; failing open");
            None
        }
    }
}

fn print_decision(decision: &GateDecision) {
    match serde_json::to_string(decision) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            error!(error = %err, "decision serialization failed");
            println!(r#"{{"allowed":true,"rule_id":null,"message":"allowed","retry_after_seconds":null}}"#);
        }
    }
}

fn print_report(report: &StatusReport) {
    println!("domain: {}", report.domain);
    if let Some(reason) = &report.unreadable_reason {
        println!("state: UNREADABLE ({reason}); showing defaults. `reset --all` quarantines it.");
    }
    println!(
        "turns: {}  last tuning: {}  overrides: {}  grants: {}  logged events: {}",
        report.turn_count,
        report
            .last_tuning_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "never".to_string()),
        report.override_events,
        report.catastrophic_grants,
        report.evaluation_log_lines
    );
    println!();
    println!(
        "{:<22} {:<12} {:>9} {:<11} {:<9} {:>7} {:>6} {:>6} {:>9} {:>6}",
        "rule", "category", "threshold", "range", "phase", "attempt", "window", "dets", "overrides", "fp"
    );
    for row in &report.rules {
        let phase = match row.retry_after_seconds {
            Some(secs) => format!("{} {secs}s", row.phase.as_str()),
            None => row.phase.as_str().to_string(),
        };
        println!(
            "{:<22} {:<12} {:>9} {:<11} {:<9} {:>7} {:>6} {:>6} {:>9} {:>5.1}%",
            row.rule_id,
            row.category.as_str(),
            row.threshold,
            format!("{}-{}", row.range_min, row.range_max),
            phase,
            row.attempt_index,
            row.window_count,
            row.detections,
            row.overrides,
            row.false_positive_rate * 100.0
        );
    }
    if !report.tuning_history.is_empty() {
        println!();
        println!("tuning history:");
        for adj in &report.tuning_history {
            println!(
                "  {} {:<22} {} -> {} (fp {:.1}%, {} dets, {:?})",
                adj.at_ms,
                adj.rule_id,
                adj.from,
                adj.to,
                adj.fp_rate * 100.0,
                adj.detections,
                adj.source
            );
        }
    }
}
