//! hmlr — hierarchical memory lookup & routing engine for AI chat agents.
//! Topic blocks → facts → gardened vector memory, with budgeted hydration.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hmlr::{ai, api, config, db, evict, scribe, AppState, EmbedCache, SharedDB};

#[derive(Parser)]
#[command(name = "hmlr", version, about = "Hierarchical memory lookup & routing engine")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3923", env = "HMLR_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(short, long, default_value = "hmlr.db", env = "HMLR_DB")]
    db: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let cfg = config::HmlrConfig::from_env();
    let store = db::HmlrDB::open(&args.db).expect("failed to open database");
    let shared: SharedDB = Arc::new(store);

    let ai_cfg = ai::AiConfig::from_env(cfg.embedding_dimensions);
    let ai_status = match &ai_cfg {
        Some(c) => format!(
            "llm={} governor={} embed={}",
            c.default_model, c.governor_model, c.embed_model
        ),
        None => "disabled".into(),
    };

    let api_key = std::env::var("HMLR_API_KEY").ok();
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let embed_cache = EmbedCache::with_db(256, &shared);

    let (scribe_tx, mut scribe_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let state = AppState {
        db: shared.clone(),
        ai: ai_cfg,
        cfg: cfg.clone(),
        api_key,
        embed_cache,
        scribe_tx: Some(scribe_tx),
        started_at: std::time::Instant::now(),
    };

    // Scribe worker: drains the outbox when nudged, and on a slow tick to
    // pick up jobs missed across restarts.
    if state.ai.is_some() {
        let bg = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = scribe_rx.recv() => {}
                    _ = tick.tick() => {}
                }
                if let Some(ref ai_cfg) = bg.ai {
                    if let Err(e) = scribe::run_scribe(&bg.db, ai_cfg).await {
                        warn!(error = %e, "scribe run failed");
                    }
                }
            }
        });
    }

    // Window maintenance: time/space eviction sweeps the current day.
    {
        let bg = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                tick.tick().await;
                let day = db::today_day_id();
                let cfg = bg.cfg.clone();
                let r = hmlr::db_call(&bg.db, move |d| evict::check_and_evict(d, &cfg, &day)).await;
                if let Err(e) = r.and_then(|inner| inner) {
                    warn!(error = %e, "eviction sweep failed");
                }
            }
        });
    }

    // Daily and weekly synthesis ticks.
    if state.ai.is_some() {
        let bg = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            let mut last_day = String::new();
            loop {
                tick.tick().await;
                let Some(ref ai_cfg) = bg.ai else { continue };
                let today = db::today_day_id();
                if today != last_day && !last_day.is_empty() {
                    // A day rolled over; synthesize the finished one.
                    if let Err(e) = scribe::synthesize_day(&bg.db, ai_cfg, &last_day).await {
                        warn!(error = %e, day = %last_day, "day synthesis failed");
                    }
                    if let Err(e) = scribe::synthesize_week(&bg.db, ai_cfg).await {
                        warn!(error = %e, "week synthesis failed");
                    }
                }
                last_day = today;
            }
        });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        db = %args.db,
        ai = %ai_status,
        auth = auth_status,
        "hmlr starting"
    );

    let app = api::router(state);
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}
