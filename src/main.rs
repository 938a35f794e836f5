//! ch-stream - run a ClickHouse query with live progress and responsive cancellation.

mod cli;

use std::io::{self, IsTerminal};
use std::sync::Arc;

use ch_stream::cancel::CancellationController;
use ch_stream::client::{HttpClient, RequestFactory, TcpConnector};
use ch_stream::config::{Config, ConnectionConfig, ProgressMode};
use ch_stream::display::TerminalProgress;
use ch_stream::error::{Result, StreamError};
use ch_stream::executor::{Coordinator, ExecutionOutcome};
use ch_stream::logging::{init_file_logging, init_stderr_logging};
use ch_stream::progress::{fetch_query_stats, server_version};
use ch_stream::session::SessionContext;
use cli::Cli;
use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if cli.log_stderr {
        init_stderr_logging();
    } else {
        init_file_logging();
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}: {}", e.category(), e);
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let connection = resolve_connection(&cli, &config)?;
    info!("Connection: {}", connection.display_string());

    let factory = RequestFactory::from_connection(&connection)?;
    let http = Arc::new(HttpClient::new(factory.clone())?);

    if cli.server_version {
        let version = server_version(http.as_ref()).await?;
        println!("{version}");
        return Ok(0);
    }

    let query = cli.read_query(io::stdin().lock())?;
    let format = cli.output_format(&config.client);
    let mode = cli.progress_mode(&config.client);

    let cancel = CancellationToken::new();
    arm_interrupt(cancel.clone());
    if let Some(timeout) = cli.timeout_duration()? {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!(?timeout, "deadline reached, cancelling");
            deadline.cancel();
        });
    }

    let killer = Arc::new(CancellationController::new(http.clone()));
    let mut coordinator = Coordinator::new(
        SessionContext::new(),
        factory,
        http.clone(),
        http.clone(),
        killer,
    );
    if mode == ProgressMode::Headers {
        coordinator = coordinator.with_connector(Arc::new(TcpConnector::new(&connection)?));
    }

    let mut out = io::stdout();
    let mut sink = TerminalProgress::new(io::stderr(), io::stderr().is_terminal());
    let execution = coordinator
        .run(&query, &format, mode, cancel, &mut out, &mut sink)
        .await;

    if cli.stats {
        if let ExecutionOutcome::Completed(_) = execution.outcome {
            match fetch_query_stats(http.as_ref(), execution.identity.query_id()).await {
                Ok(stats) => eprint!("{}", stats.summary()),
                Err(e) => {
                    warn!("query stats unavailable: {e}");
                    eprintln!("Query stats unavailable: {e}");
                }
            }
        }
    }

    Ok(execution.outcome.exit_code())
}

/// Cancels `cancel` on the first Ctrl-C and exits with 130 on the second.
fn arm_interrupt(cancel: CancellationToken) {
    let signals = stream::unfold((), |()| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(((), ())),
            Err(e) => {
                warn!("could not listen for Ctrl-C: {e}");
                None
            }
        }
    });

    tokio::spawn(async move {
        if escalate(Box::pin(signals), cancel).await {
            eprintln!("\nAborted.");
            std::process::exit(130);
        }
    });
}

/// Waits for interrupts. The first cancels the query; a second one while
/// the kill or cleanup is still pending returns `true`.
async fn escalate<S>(mut signals: S, cancel: CancellationToken) -> bool
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        return false;
    }
    info!("interrupt received, cancelling");
    cancel.cancel();

    if signals.next().await.is_none() {
        return false;
    }
    warn!("second interrupt received, aborting");
    true
}

/// Resolves the final connection configuration.
///
/// Precedence:
/// 1. CLI arguments (highest)
/// 2. Named connection from config
/// 3. Default connection from config
/// 4. Environment variables
fn resolve_connection(cli: &Cli, config: &Config) -> Result<ConnectionConfig> {
    let mut connection = match cli.connection_name() {
        Some(name) => config.get_connection(Some(name)).cloned().ok_or_else(|| {
            StreamError::config(format!("Connection '{name}' not found in config file"))
        })?,
        None => config.get_connection(None).cloned().unwrap_or_default(),
    };

    if let Some(flags) = cli.to_connection_config()? {
        connection.merge(&flags);
    }

    connection.apply_env_defaults();
    Ok(connection)
}
