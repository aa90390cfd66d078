use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::{dptree, prelude::*, update_listeners::webhooks};
use tracing::info;

mod broadcast;
mod config;
mod handlers;
mod render;
mod session;
mod store;
mod tracker;

use config::{load_config, parse_config_arg, validate_config};
use handlers::AppState;
use render::{RenderConfig, Renderer};
use session::SessionMap;
use store::DocumentStore;
use tracker::ProgressTracker;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(DocumentStore::new(cfg.runtime.data_dir.clone()));
    let tracker = ProgressTracker::new(store, cfg.rewards.invite_threshold);
    let renderer = Renderer::new(RenderConfig {
        assets_dir: cfg.assets.dir.clone(),
        scratch_dir: cfg.assets.scratch_dir.clone(),
        watermark_text: cfg.assets.watermark_text.clone(),
        style_count: cfg.rewards.style_count,
    });
    let sessions = SessionMap::new(cfg.rewards.session_idle_minutes);

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        tracker,
        renderer,
        sessions,
    });

    let (shutdown_tx, _shutdown_rx0) = tokio::sync::broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    // abandoned mid-flow sessions expire instead of lingering forever
    let state_gc = state.clone();
    let mut shutdown_rx_gc = shutdown_tx.subscribe();
    let h_gc = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown_rx_gc.recv() => { break; }
                _ = ticker.tick() => {
                    let removed = state_gc.sessions.prune_idle();
                    if removed > 0 {
                        info!("pruned {} idle session(s)", removed);
                    }
                }
            }
        }
    });

    let mut dispatcher = Dispatcher::builder(bot.clone(), handlers::schema())
        .dependencies(dptree::deps![state.clone()])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build();

    match cfg.webhook.public_url.clone() {
        Some(public_url) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], cfg.webhook.bind_port));
            let url: url::Url = format!("{}/webhook", public_url.trim_end_matches('/'))
                .parse()
                .context("webhook url")?;
            info!("Start webhook listener as @{} on {}", bot_username, addr);
            let listener = webhooks::axum(bot.clone(), webhooks::Options::new(addr, url))
                .await
                .context("set webhook")?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("Webhook listener error"),
                )
                .await;
        }
        None => {
            info!("Start polling as @{}", bot_username);
            dispatcher.dispatch().await;
        }
    }

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_gc.await;

    Ok(())
}
