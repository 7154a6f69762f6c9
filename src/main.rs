//! Command-line interface for the sanitization pipeline.
//!
//! Zero positional arguments runs batch mode over the configured input
//! directory; exactly two (INPUT OUTPUT) process a single file, honored only
//! when CLI_OVERRIDE is enabled in the persisted configuration.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use pdfscrub::password::TerminalPrompt;
use pdfscrub::pipeline::Pipeline;
use pdfscrub::report::ReportSink;
use pdfscrub::stage::Toolbox;
use pdfscrub::{fileset, Config, Error};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let verbosity = matches
        .get_one::<String>("verbose")
        .map(String::as_str)
        .unwrap_or("info");
    init_logging(verbosity);

    match run(&matches).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}

async fn run(matches: &clap::ArgMatches) -> Result<i32, Error> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("pdfscrub.json");
    let config = Config::load_or_init(Path::new(config_path))?;

    let positional = match (
        matches.get_one::<String>("input"),
        matches.get_one::<String>("output"),
    ) {
        (Some(input), Some(output)) => Some((PathBuf::from(input), PathBuf::from(output))),
        (Some(_), None) => {
            warn!("single-file mode needs both INPUT and OUTPUT, running batch mode");
            None
        }
        _ => None,
    };
    if positional.is_some() && !config.cli_override {
        warn!("positional arguments ignored: CLI_OVERRIDE is disabled, running batch mode");
    }

    let mut run = config.resolve(positional);
    if matches.get_flag("dry-run") {
        run.dry_run = true;
    }

    let sink = Arc::new(ReportSink::open(&run.log_file)?);
    let items = fileset::resolve(&run)?;
    info!("resolved {} work item(s)", items.len());

    let pipeline = Pipeline::new(
        Arc::new(run),
        Toolbox::external(),
        Arc::new(TerminalPrompt),
        sink,
    );
    let report = pipeline.execute(&items).await;

    info!(
        "{} succeeded, {} skipped, {} failed",
        report.succeeded(),
        report.skipped(),
        report.failed()
    );
    Ok(if report.has_failures() { 1 } else { 0 })
}

fn build_cli() -> Command {
    Command::new("pdfscrub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-stage PDF sanitization pipeline driving external tools")
        .arg(
            Arg::new("input")
                .value_name("INPUT")
                .index(1)
                .help("Input PDF (single-file mode, requires CLI_OVERRIDE)"),
        )
        .arg(
            Arg::new("output")
                .value_name("OUTPUT")
                .index(2)
                .requires("input")
                .help("Output PDF (single-file mode)"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("pdfscrub.json")
                .help("Configuration file, created with defaults if missing"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Report what would be processed without touching any file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .value_name("LEVEL")
                .default_value("info")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .help("Set logging verbosity"),
        )
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("pdfscrub={level}")))
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");
}
