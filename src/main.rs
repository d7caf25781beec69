mod console;

use clap::Parser;
use ldb_client::debugger::{LaunchConfig, LaunchConfigBuilder, LaunchConfigFile, config};
use ldb_client::io::OutputStream;
use ldb_client::logging::{LogConfig, init_logging};
use ldb_client::model::GlobalLabels;
use ldb_client::{DebugError, Launcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{BufReader, stdin};
use tracing::info;

/// CLI arguments for the ldb debugger client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Lua script to debug (may come from --config instead)
    #[arg(value_name = "SCRIPT")]
    script: Option<PathBuf>,

    /// Path to the ldb executable
    #[arg(long = "ldb", env = "LDB_PATH", value_name = "PATH")]
    ldb_path: Option<PathBuf>,

    /// Fixed command port (allocated when omitted)
    #[arg(long, value_name = "PORT")]
    command_port: Option<u16>,

    /// Fixed event port (allocated when omitted)
    #[arg(long, value_name = "PORT")]
    event_port: Option<u16>,

    /// Command reply deadline in milliseconds, 0 waits forever
    #[arg(long, value_name = "MS")]
    request_timeout_ms: Option<u64>,

    /// Time allowed for ldb to accept connections, in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// JSON launch configuration; command-line flags take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Leave out the blank and GLOBAL VARIABLES entries in variable lists
    #[arg(long)]
    no_global_labels: bool,

    /// Append debuggee output to this file
    #[arg(long, value_name = "FILE")]
    output_log: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides LDB_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Merge the configuration file with command-line overrides
fn build_launch_config(args: &Args) -> Result<LaunchConfig, DebugError> {
    let mut builder = match &args.config {
        Some(path) => LaunchConfigBuilder::from_file(LaunchConfigFile::load(path)?),
        None => LaunchConfigBuilder::new(),
    };

    if let Some(path) = &args.ldb_path {
        builder = builder.ldb_path(path);
    }
    if let Some(script) = &args.script {
        builder = builder.script(script);
    }
    if let Some(port) = args.command_port {
        builder = builder.command_port(port);
    }
    if let Some(port) = args.event_port {
        builder = builder.event_port(port);
    }
    if let Some(millis) = args.request_timeout_ms {
        builder = builder.request_timeout(config::request_timeout_from_millis(millis));
    }
    if let Some(millis) = args.connect_timeout_ms {
        builder = builder.connect_timeout(Duration::from_millis(millis));
    }
    if args.no_global_labels {
        builder = builder.global_labels(GlobalLabels::Omit);
    }
    if let Some(path) = &args.output_log {
        builder = builder.output_log(path);
    }

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let launch_config = match build_launch_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    info!(
        "Debugging {} with {}",
        launch_config.script.display(),
        launch_config.ldb_path.display()
    );

    let launcher = Launcher::new().with_output_handler(|stream, line| match stream {
        OutputStream::Stdout => println!("{line}"),
        OutputStream::Stderr => eprintln!("{line}"),
    });

    let session = match launcher.launch(launch_config).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to launch ldb: {e}");
            std::process::exit(1);
        }
    };

    let ports = session.ports();
    println!(
        "ldb running (pid {:?}, command port {}, event port {}), type help for commands",
        session.pid(),
        ports.command,
        ports.event
    );

    console::run(session.target(), BufReader::new(stdin())).await;

    session.shutdown().await?;
    Ok(())
}
