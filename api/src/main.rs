mod routes;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use frame_relay_common::cache::{LatestFrameCache, StalenessPolicy};
use frame_relay_common::config::Config;
use frame_relay_common::frame::encode_part;
use frame_relay_ingest::decode::placeholder_jpeg;
use frame_relay_ingest::reaper::run_reaper;
use frame_relay_ingest::{check_directory, DecodeOptions, FrameWatcher, IngestError, WatcherOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::routes::{router, AppState, Source};
use crate::session::SessionPolicy;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    for source in &config.sources {
        if let Err(e) = check_directory(&source.dir) {
            error!(source = %source.name, error = %e, "cannot start");
            eprintln!("Source '{}': {e}", source.name);
            std::process::exit(1);
        }
    }

    let shutdown = CancellationToken::new();
    let staleness = StalenessPolicy::new(config.ingest.max_frame_age());
    let watcher_opts = WatcherOptions {
        decode: DecodeOptions {
            attempts: config.ingest.decode_attempts,
            backoff: config.ingest.decode_backoff(),
            jpeg_quality: config.ingest.jpeg_quality,
        },
        dir_check_interval: config.ingest.dir_check_interval(),
        prune_max_age: if config.ingest.prune {
            config.ingest.max_frame_age()
        } else {
            None
        },
    };
    if config.ingest.prune && watcher_opts.prune_max_age.is_none() {
        warn!("ingest.prune has no effect while max_frame_age_secs disables aging");
    }

    // Watchers report fatal errors here; any one of them stops the process.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<(String, IngestError)>(config.sources.len());
    let mut sources = Vec::with_capacity(config.sources.len());

    for source_cfg in &config.sources {
        let cache = Arc::new(LatestFrameCache::new(staleness));
        let mut watcher = FrameWatcher::new(
            source_cfg.name.clone(),
            source_cfg.dir.clone(),
            Arc::clone(&cache),
            watcher_opts.clone(),
        );
        match watcher.bootstrap().await {
            Ok(Some(seq)) => info!(source = %source_cfg.name, seq, "bootstrapped"),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Source '{}': {e}", source_cfg.name);
                std::process::exit(1);
            }
        }

        let name = source_cfg.name.clone();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run().await {
                let _ = fatal_tx.send((name, e)).await;
            }
        });

        if config.ingest.reap_interval_secs > 0 && staleness.max_age().is_some() {
            let period = std::time::Duration::from_secs(config.ingest.reap_interval_secs);
            let reaper = run_reaper(source_cfg.name.clone(), Arc::clone(&cache), period);
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = reaper => {}
                }
            });
        }

        sources.push(Arc::new(Source::new(
            source_cfg.name.clone(),
            source_cfg.dir.clone(),
            cache,
        )));
    }
    drop(fatal_tx);

    let placeholder = match placeholder_jpeg(
        config.stream.placeholder_width,
        config.stream.placeholder_height,
        config.ingest.jpeg_quality,
    ) {
        Ok(jpeg) => encode_part(&config.stream.boundary, &jpeg),
        Err(e) => {
            eprintln!("Failed to render placeholder image: {e}");
            std::process::exit(1);
        }
    };

    let policy = Arc::new(SessionPolicy::from_config(&config.stream));
    info!(
        interval_ms = policy.interval.as_millis() as u64,
        on_absent = ?policy.on_absent,
        on_repeat = ?policy.on_repeat,
        max_frame_age = ?staleness.max_age(),
        "stream policy"
    );
    let state = Arc::new(AppState::new(sources, policy, placeholder, shutdown.clone()));
    let app = router(state);

    let addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(addr, sources = config.sources.len(), "frame relay listening");

    let signal_token = shutdown.clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                info!("shutdown requested, closing streams");
                signal_token.cancel();
            })
            .await
    };

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(error = %e, "server failed");
                std::process::exit(1);
            }
            info!("server stopped");
        }
        Some((name, e)) = fatal_rx.recv() => {
            error!(source = %name, error = %e, "watcher failed");
            shutdown.cancel();
            std::process::exit(1);
        }
    }
}
