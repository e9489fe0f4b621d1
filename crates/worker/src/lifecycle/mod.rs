//! Process lifecycle supervision.
//!
//! Startup: disabled check, single-instance arbitration (with graceful
//! takeover on version drift), orphan sweep, component wiring, HTTP bind,
//! PID file write (after listen, race-free), background tasks. Shutdown:
//! stop intake, abort sessions, flush the vector connection, close the
//! store, remove the PID file - and exit 0 for every planned path.

pub mod pid;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cm_domain::settings::{ChromaMode, Settings};
use cm_process::reaper::{self, SweepPatterns};
use cm_process::ProcessRegistry;
use cm_providers::build_agents;
use cm_storage::queue::SWEEP_STALE_MS;
use cm_storage::{PendingQueue, Store};
use cm_vector::{VectorClient, VectorEndpoint, VectorSync};

use crate::api;
use crate::runtime::events::EventBroadcaster;
use crate::runtime::health;
use crate::runtime::session_manager::SessionManager;
use crate::runtime::Runtime;
use crate::state::AppState;

/// Interval between orphan-reaper passes.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);

/// How long the takeover waits for a quick health answer from a PID-file
/// peer before declaring the file stale.
const PEER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the worker to completion. `Ok(())` is a planned exit (exit code 0);
/// `Err` means startup could not complete and the process should exit
/// non-zero.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    if settings.disabled {
        tracing::info!("claude-mem is disabled in settings, exiting");
        return Ok(());
    }

    let data_dir = settings.data_dir();
    data_dir
        .ensure()
        .map_err(|e| anyhow::anyhow!("data directory {} unwritable: {e}", settings.data_dir.display()))?;

    // ── Single-instance arbitration ──────────────────────────────────
    let pid_path = data_dir.pid_file_path();
    if let Some(existing) = pid::read_pid_file(&pid_path) {
        if health::wait_for_health(existing.port, PEER_PROBE_TIMEOUT).await {
            let probe_timeout = Duration::from_millis(settings.health_timeout_ms);
            let version = health::check_version_match(existing.port, probe_timeout).await;
            if version.matches {
                tracing::info!(
                    pid = existing.pid,
                    port = existing.port,
                    "a matching worker is already running, refusing to start"
                );
                return Ok(());
            }
            tracing::info!(
                pid = existing.pid,
                theirs = version.worker_version.as_deref().unwrap_or("unknown"),
                ours = version.plugin_version.as_deref().unwrap_or("unknown"),
                "version drift detected, asking the old worker to shut down"
            );
            health::request_shutdown(existing.port, probe_timeout).await;
            if !health::wait_for_port_free(existing.port, probe_timeout).await {
                anyhow::bail!("old worker did not release port {}", existing.port);
            }
        } else {
            tracing::info!(pid = existing.pid, "stale PID file, removing");
            let _ = std::fs::remove_file(&pid_path);
        }
    }

    // ── Aggressive orphan sweep ──────────────────────────────────────
    let patterns = SweepPatterns::default();
    reaper::startup_sweep(&patterns);

    // ── Components ───────────────────────────────────────────────────
    let store = Arc::new(Store::open(&data_dir.database_path())?);
    let queue = Arc::new(PendingQueue::new(store.clone()));
    // Leftovers from a previous run become claimable again right away.
    queue.reset_stale(SWEEP_STALE_MS, None)?;

    let endpoint = match settings.chroma_mode {
        ChromaMode::Local => VectorEndpoint::Subprocess {
            data_path: data_dir.chroma_dir(),
        },
        ChromaMode::Remote => VectorEndpoint::Remote {
            host: settings.chroma_host.clone(),
            port: settings.chroma_port,
            api_key: settings.chroma_api_key.clone(),
        },
    };
    let vector = Arc::new(VectorSync::new(
        Arc::new(VectorClient::new(endpoint)),
        settings.chroma_enabled,
    ));

    let registry = Arc::new(ProcessRegistry::new(settings.max_concurrent));
    let settings = Arc::new(settings);
    let (primary, fallback) = build_agents(&settings, registry.clone());
    let events = EventBroadcaster::new();

    let runtime = Arc::new(Runtime {
        settings: settings.clone(),
        store: store.clone(),
        queue: queue.clone(),
        vector: vector.clone(),
        registry: registry.clone(),
        events,
        primary,
        fallback,
    });
    let sessions = Arc::new(SessionManager::new(runtime.clone()));

    let state = AppState {
        runtime: runtime.clone(),
        sessions: sessions.clone(),
        initialized: Arc::new(AtomicBool::new(false)),
        shutdown: CancellationToken::new(),
        restart_requested: Arc::new(AtomicBool::new(false)),
    };

    // ── Bind, then write the PID file ────────────────────────────────
    let addr = format!("{}:{}", settings.worker_host, settings.worker_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;
    let pid_guard = pid::write_pid_file(&pid_path, settings.worker_port)?;
    tracing::info!(addr = %addr, "claude-mem worker listening");

    spawn_signal_handler(state.shutdown.clone());
    spawn_background_tasks(&state);
    state.mark_initialized();

    // ── Serve ────────────────────────────────────────────────────────
    let shutdown = state.shutdown.clone();
    let serve_result = axum::serve(
        listener,
        api::router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await;
    if let Err(e) = serve_result {
        // Planned exits stay exit-code 0, even when teardown is messy.
        tracing::error!(error = %e, "HTTP server error");
    }

    // ── Serialized teardown ──────────────────────────────────────────
    tracing::info!("shutting down: aborting active sessions");
    sessions.shutdown_all().await;
    vector.close().await;
    if let Err(e) = store.checkpoint() {
        tracing::warn!(error = %e, "WAL checkpoint on shutdown failed");
    }
    pid::remove_pid_file(pid_guard);

    if state.restart_was_requested() {
        reexec();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// INT/TERM/HUP all trigger the same serialized shutdown.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    return;
                }
            };
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGHUP handler unavailable");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
                _ = term.recv() => tracing::info!("SIGTERM received"),
                _ = hup.recv() => tracing::info!("SIGHUP received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received");
        }
        shutdown.cancel();
    });
}

fn spawn_background_tasks(state: &AppState) {
    // Vector backfill for every known project.
    {
        let runtime = state.runtime.clone();
        tokio::spawn(async move {
            let projects = match runtime.store.list_projects() {
                Ok(projects) => projects,
                Err(e) => {
                    tracing::warn!(error = %e, "project listing for backfill failed");
                    return;
                }
            };
            for project in projects {
                if let Err(e) = runtime.vector.ensure_backfilled(&runtime.store, &project).await {
                    tracing::warn!(project = %project, error = %e, "vector backfill failed");
                }
            }
        });
    }

    // Resume queued work left over from the previous run.
    {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            match sessions.kick_all_pending() {
                Ok(0) => {}
                Ok(kicked) => tracing::info!(kicked, "resumed sessions with queued work"),
                Err(e) => tracing::warn!(error = %e, "pending-work resume failed"),
            }
        });
    }

    // Periodic orphan reaper.
    {
        let sessions = state.sessions.clone();
        let registry = state.runtime.registry.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            let patterns = SweepPatterns::default();
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let active = sessions.active_session_ids();
                        let killed = reaper::reap_orphans(&registry, &active, &patterns);
                        if killed > 0 {
                            tracing::info!(killed, "orphan reaper pass");
                        }
                    }
                }
            }
        });
    }
}

/// Replace this process with a fresh copy of the same binary.
fn reexec() {
    let Ok(exe) = std::env::current_exe() else {
        tracing::error!("current_exe unavailable, cannot restart");
        return;
    };
    tracing::info!(exe = %exe.display(), "re-executing for restart");
    match std::process::Command::new(exe).arg("serve").spawn() {
        Ok(child) => tracing::info!(pid = child.id(), "restarted worker spawned"),
        Err(e) => tracing::error!(error = %e, "restart spawn failed"),
    }
}
