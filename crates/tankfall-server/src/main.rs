use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tankfall_server::config::ServerConfig;
use tankfall_server::external_addr::resolve_advertised_host;
use tankfall_server::run_match;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("TANKFALL_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::load();
    config.validate();
    tracing::info!(addr = %config.listen_addr, "Tankfall server starting");

    let advertised_host = resolve_advertised_host(&config).await;

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        ctrl_c_token.cancel();
    });

    let mut matches_played: u64 = 0;
    while !shutdown.is_cancelled() {
        let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %config.listen_addr, error = %e, "Failed to bind");
                std::process::exit(1);
            },
        };

        match run_match(
            listener,
            config.clone(),
            std::sync::Arc::clone(&advertised_host),
            shutdown.clone(),
        )
        .await
        {
            Ok(Some(outcome)) => {
                matches_played += 1;
                tracing::info!(
                    matches_played,
                    match_id = %outcome.match_id,
                    winner = ?outcome.winner,
                    rounds = outcome.rounds_played,
                    forfeited = outcome.forfeited,
                    "Match finished"
                );
            },
            Ok(None) => tracing::info!("Match ended without a result"),
            Err(e) => {
                tracing::error!(error = %e, "Server error");
                std::process::exit(1);
            },
        }

        if !config.match_rules.restart_on_end {
            break;
        }
    }

    tracing::info!("Tankfall server stopped");
}
