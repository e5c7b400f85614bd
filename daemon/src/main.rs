mod api;
mod cli;
mod collector;
mod config;
mod control;
mod dispatch;
mod event;
mod identity;
mod logging;
mod model;
mod paths;
mod reconcile;
mod refresh;
mod scheduler;
mod status;

use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::ControlApi;
use crate::collector::Platform;
use crate::control::{ConnectionManager, WsTransport};
use crate::dispatch::HttpDispatcher;
use crate::event::AgentEvent;
use crate::reconcile::ProcessReconciler;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = match paths::app_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve app data directory: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths::config_file_path(&app_dir));
    let (mut cfg, config_error) = match config::load_or_default(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (config::Config::default(), Some(e)),
    };
    let unknown_environment = cli.apply(&mut cfg);

    if cli.print_config {
        match toml::to_string_pretty(&cfg) {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("Failed to render config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    // ── Logging ───────────────────────────────────────────────────────────────
    let log_dir = cfg
        .logging
        .directory
        .clone()
        .unwrap_or_else(|| paths::log_dir(&app_dir));
    let _log_guard = match logging::init_tracing(&cfg.logging, &log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(e) = config_error {
        warn!(error = %format!("{e:#}"), "config unusable, using defaults");
    }
    if let Some(name) = unknown_environment {
        warn!(environment = name, "unknown environment, using production");
    }

    // ── Identity ──────────────────────────────────────────────────────────────
    let identity = match identity::IdentityCipher::from_env().and_then(|cipher| {
        identity::load_or_create(
            &paths::identity_file_path(&app_dir),
            &cipher,
            cli.subject_id.as_deref(),
            identity::prompt_subject_id,
        )
    }) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "identity setup failed");
            std::process::exit(1);
        }
    };

    let api_base = cfg.api_base();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %api_base,
        subject = %identity.subject_id,
        hostname = %identity.hostname,
        "hostwatch-daemon starting"
    );

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path(&app_dir);
    let mut current_status = status::AgentStatus::new(identity.subject_id.clone());
    status::write_status(&status_path, &current_status);

    // ── Remote service ────────────────────────────────────────────────────────
    let client = match dispatch::build_http_client(cfg.request_timeout()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %format!("{e:#}"), "cannot build HTTP client");
            std::process::exit(1);
        }
    };
    let control_api = Arc::new(ControlApi::new(client.clone(), api_base.clone(), identity.clone()));
    if let Err(e) = control_api.register().await {
        warn!(error = %format!("{e:#}"), "startup registration failed, continuing");
    }
    let dispatcher = Arc::new(HttpDispatcher::new(client, api_base.clone()));

    // ── Background tasks ──────────────────────────────────────────────────────
    let token = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(32);
    let mut handles = Vec::new();

    let (refresh_tx, refresh_rx) = refresh::refresh_channel();
    let control_url = match control::control_url(&api_base, &cfg.control) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %format!("{e:#}"), "cannot derive control channel URL");
            std::process::exit(1);
        }
    };
    info!(url = %control_url, "control channel endpoint");
    let transport = Arc::new(WsTransport::new(control_url, cfg.control.handshake_timeout()));
    let (manager, control_sender) = ConnectionManager::new(transport, &cfg.control, refresh_tx);
    handles.push(event::forward_changes(
        control_sender.watch_state(),
        event_tx.clone(),
        AgentEvent::ConnectionChanged,
    ));
    handles.push(tokio::spawn(manager.run(token.clone())));

    let platform = Platform::current();
    let reconciler = ProcessReconciler::new(
        control_api.clone(),
        collector::liveness_probe(platform),
        control_api,
        &cfg.reconcile,
    );
    handles.push(event::forward_changes(
        reconciler.subscribe(),
        event_tx.clone(),
        AgentEvent::WatchSetUpdated,
    ));
    handles.push(tokio::spawn(reconciler.run(refresh_rx, token.clone())));

    let mut scheduler = Scheduler::new(
        collector::collector_factory(platform, identity.clone()),
        dispatcher,
        &cfg.intervals,
    );
    if cfg.control.mirror_metrics {
        scheduler = scheduler.mirror_metrics(control_sender);
    }
    handles.extend(scheduler.spawn(&token));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(AgentEvent::Shutdown).await;
            }
        });
    }
    drop(event_tx);

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            AgentEvent::ConnectionChanged(state) => {
                current_status.connection = state;
                status::write_status(&status_path, &current_status);
            }

            AgentEvent::WatchSetUpdated(snapshot) => {
                current_status.apply_snapshot(&snapshot);
                status::write_status(&status_path, &current_status);
            }

            AgentEvent::Shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    drop(event_rx);
    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    current_status.connection = control::ConnectionState::Disconnected;
    status::write_status(&status_path, &current_status);
    info!("hostwatch-daemon stopped");
}
