use clap::Parser;
use tracing_subscriber::EnvFilter;

use cm_domain::settings::{LogLevel, Settings};
use cm_worker::lifecycle;

#[derive(Parser)]
#[command(name = "claude-mem-worker", about = "claude-mem background worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the worker daemon (default).
    Serve,
    /// Print the worker version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("claude-mem-worker {}", env!("CARGO_PKG_VERSION"));
        }
        None | Some(Command::Serve) => {
            let settings = match Settings::load() {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!("claude-mem-worker: settings error: {e}");
                    std::process::exit(1);
                }
            };
            let _log_guard = init_tracing(&settings);

            if let Err(e) = lifecycle::run(settings).await {
                tracing::error!(error = %e, "startup failed");
                eprintln!("claude-mem-worker: {e}");
                std::process::exit(1);
            }
            // Every planned exit - including a shutdown with teardown
            // errors - leaves with code 0 so launchers never see a crash.
        }
    }
}

/// Tracing to a daily-rolling file under `$DATA_DIR/logs/`, filtered by the
/// configured level. Returns the appender guard; dropping it flushes.
fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if settings.log_level == LogLevel::Silent {
        return None;
    }

    let logs_dir = settings.data_dir().logs_dir();
    let appender = match tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("claude-mem")
        .filename_suffix("log")
        .build(&logs_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("claude-mem-worker: log file unavailable ({e}), logging to stderr");
            tracing_subscriber::fmt()
                .with_env_filter(default_filter(settings))
                .init();
            return None;
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(default_filter(settings))
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn default_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_filter()))
}
