use credit_flow::server::{
    run_protocol_dst_batch, summarize_protocol_dst_batch, ProtocolDSTConfig, TraceReplayer,
};
use credit_flow::{ConformanceMonitor, CreditFlowModel, GrantMode, ProtocolAction, ServerConfig};
use std::env;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage:
  credit-flow dst [start_seed] [count] [steps] [full|random|clamped]
  credit-flow replay <trace-file>

environment:
  RUST_LOG               log filter (default: info)
  CREDIT_FLOW_LOG_JSON   emit JSON logs when set to 1 or true
  CREDIT_FLOW_CONFIG     TOML server config used by replay
  CREDIT_FLOW_GRANT_MODE grant mode override
  CREDIT_FLOW_SEED       seed override";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("CREDIT_FLOW_LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let outcome = match args.first().map(String::as_str) {
        Some("dst") => run_dst(&args[1..]),
        Some("replay") => match args.get(1) {
            Some(path) => run_replay(path),
            None => Err("replay needs a trace file".into()),
        },
        Some("-h") | Some("--help") => {
            println!("{}", USAGE);
            Ok(true)
        }
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "credit-flow aborted");
            ExitCode::FAILURE
        }
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[String], idx: usize, default: T) -> Result<T, String> {
    match args.get(idx) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("argument {} ('{}') is not valid", idx + 1, raw)),
        None => Ok(default),
    }
}

fn run_dst(args: &[String]) -> Result<bool, Box<dyn std::error::Error>> {
    let start_seed: u64 = parse_arg(args, 0, 0)?;
    let count: usize = parse_arg(args, 1, 100)?;
    let steps: usize = parse_arg(args, 2, 200)?;
    let mode: GrantMode = match args.get(3) {
        Some(raw) => raw.parse()?,
        None => GrantMode::Clamped,
    };

    info!(start_seed, count, steps, ?mode, "running protocol DST batch");
    let results = run_protocol_dst_batch(start_seed, count, |seed| ProtocolDSTConfig {
        steps,
        grant_mode: mode,
        ..ProtocolDSTConfig::new(seed)
    });

    let summary = summarize_protocol_dst_batch(&results);
    println!("{}", summary);
    Ok(results.iter().all(|r| r.is_success()))
}

/// Check a recorded trace against the model, then replay it on a live server
/// and check what the server actually did.
fn run_replay(path: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut trace = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Unknown actions end the session here
        let action: ProtocolAction = line
            .parse()
            .map_err(|e| format!("{}:{}: {}", path, lineno + 1, e))?;
        trace.push(action);
    }

    let config = ServerConfig::from_env()?;

    let mut recorded = ConformanceMonitor::new(CreditFlowModel::for_mode(config.grant.mode));
    if let Err(e) = recorded.replay(&trace) {
        error!(error = %e, "recorded trace does not conform, not replaying it");
        return Ok(false);
    }
    info!(steps = recorded.steps(), "recorded trace conforms");

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(TraceReplayer::new(config).run(&trace))?;
    for action in &report.journal {
        println!("{}", action);
    }

    if let Some((action, e)) = &report.rejected {
        error!(%action, error = %e, "live server refused a request the trace accepted");
    }
    for divergence in &report.divergences {
        error!(%divergence, "live server diverged from trace");
    }
    if let Some(violation) = &report.conformance {
        error!(error = %violation, "live server diverged from model");
    }
    if report.race_flips > 0 {
        warn!(
            race_flips = report.race_flips,
            "cancellation races settled differently than recorded"
        );
    }
    Ok(report.is_success())
}
