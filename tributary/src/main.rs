//! The tributary server binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tributary_config::{Config, ConfigError};
use tributary_server::sinks::MetricSinkTypes;
use tributary_server::sources::SourceTypes;
use tributary_server::spans::SpanSinkTypes;
use tributary_server::{Server, ServerConfig};

/// Exit code for a fatal configuration problem.
const EXIT_CONFIG: i32 = 2;

/// Exit code for a listener bind failure.
const EXIT_BIND: i32 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "tributary",
    version,
    about = "A statsd-compatible metrics aggregation pipeline"
)]
struct Cli {
    /// The config file to read for settings.
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    config: PathBuf,

    /// Validate the config file, then immediately exit.
    #[arg(long)]
    validate_config: bool,

    /// Validate as with --validate-config, but also fail if there are any
    /// unknown keys.
    #[arg(long)]
    validate_config_strict: bool,
}

fn main() {
    let cli = Cli::parse();

    let (config, unknown_keys) = match Config::load(&cli.config) {
        Ok(config) => (config, None),
        Err(ConfigError::UnknownKeys { config, keys }) => {
            if cli.validate_config_strict {
                eprintln!("config contains unknown or deprecated keys: {}", keys.join(", "));
                process::exit(EXIT_CONFIG);
            }
            (*config, Some(keys))
        }
        Err(error) => {
            eprintln!("could not load config: {error}");
            process::exit(EXIT_CONFIG);
        }
    };

    tributary_log::init(&config.logging);

    if let Some(keys) = unknown_keys {
        tributary_log::warn!(
            keys = keys.join(", ").as_str(),
            "config contains unknown or deprecated keys"
        );
    }

    if cli.validate_config {
        return;
    }

    let mut default_tags = BTreeMap::new();
    if !config.hostname.is_empty() {
        default_tags.insert("host".to_owned(), config.hostname.clone());
    }
    if let Err(error) = tributary_statsd::init("tributary", &config.stats_address, default_tags) {
        tributary_log::warn!("could not initialize telemetry: {error}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tributary_log::error!("could not start the async runtime: {error}");
            process::exit(1);
        }
    };

    runtime.block_on(async move {
        let mut server = match Server::new(ServerConfig {
            config,
            source_types: SourceTypes::with_builtins(),
            metric_sink_types: MetricSinkTypes::with_builtins(),
            span_sink_types: SpanSinkTypes::with_builtins(),
        }) {
            Ok(server) => server,
            Err(error) => {
                tributary_log::error!("could not build the server: {error}");
                process::exit(EXIT_CONFIG);
            }
        };

        if let Err(error) = server.start().await {
            tributary_log::error!("could not start the server: {error}");
            let code = if error.is_bind_failure() {
                EXIT_BIND
            } else {
                EXIT_CONFIG
            };
            process::exit(code);
        }

        wait_for_shutdown().await;
        tributary_log::info!("shutting down");
        server.shutdown();
    });
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}
