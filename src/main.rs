use std::{
    io,
    path::PathBuf,
    process::ExitCode,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, bail};
use chatstorm::{
    Reporter,
    config::ScenarioFile,
    executor::ProgressFn,
    report::{JsonReporter, LogReporter},
    transport::WsTransport,
    workloads,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "chatstorm")]
#[command(about = "Load generator for real-time chat endpoints", long_about = None)]
struct Args {
    /// Built-in workload to run (see --list)
    #[arg(short, long, conflicts_with = "config")]
    workload: Option<String>,

    /// TOML scenario file to run
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to load, overriding the scenario's
    #[arg(long, env = "WS_URL")]
    url: Option<String>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// List the built-in workloads and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    if args.list {
        for name in workloads::NAMES {
            println!("{name}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut scenario = match (&args.workload, &args.config) {
        (Some(name), None) => workloads::by_name(name)?,
        (None, Some(path)) => ScenarioFile::load(path)
            .with_context(|| format!("loading scenario {}", path.display()))?,
        _ => bail!("pass either --workload or --config"),
    };
    if let Some(url) = args.url {
        scenario.url = url;
    }

    let last_second = AtomicU64::new(u64::MAX);
    let progress = ProgressFn::new(move |p| {
        let second = p.elapsed.as_secs();
        if last_second.swap(second, Ordering::Relaxed) != second {
            tracing::info!(
                "t={second}s target={:.0} active={} retiring={}",
                p.target,
                p.active,
                p.retiring
            );
        }
    });

    let report = scenario
        .run_observed(WsTransport::default(), progress)
        .await
        .with_context(|| format!("running scenario {}", scenario.name))?;

    LogReporter
        .report(&report)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if args.json {
        JsonReporter::new(io::stdout())
            .pretty()
            .report(&report)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}
