mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use coinwall_config::LoggingSection;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // A broken config file is reported by the command itself; logging
    // falls back to defaults here.
    let logging = coinwall_config::load_config_from(&cli.global.config_file())
        .map(|cfg| cfg.logging)
        .unwrap_or_default();
    let _guard = init_tracing(cli.global.verbose, &logging);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop and must live until exit.
fn init_tracing(verbosity: u8, logging: &LoggingSection) -> Option<WorkerGuard> {
    let filter = match verbosity {
        0 => logging.level.as_deref().unwrap_or("warn"),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, guard) = match logging.directory {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "coinwall.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if logging.json {
        registry.with(stderr.json()).init();
    } else {
        registry.with(stderr).init();
    }
    guard
}

async fn run(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Run(args) => commands::run::handle(&args, &cli.global).await,
        Command::Quote(args) => commands::rates::quote(&args, &cli.global),
        Command::Rates => commands::rates::list(&cli.global),
        Command::Sessions(args) => commands::sessions::handle(args, &cli.global).await,
        Command::Sales => commands::sessions::sales(&cli.global),
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "coinwall", &mut std::io::stdout());
            Ok(())
        }
    }
}
