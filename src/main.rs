use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use switchyard::probe;
use switchyard::server::{self, AppState};
use switchyard::settings::{self, SettingKey};
use switchyard::store::Store;
use switchyard::sync;

struct CliArgs {
    db_path: String,
    listen: String,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut db_path = "switchyard.db".to_string();
    let mut listen = "127.0.0.1:8080".to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => {
                db_path = args.next().ok_or("missing value for --db")?;
            }
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--help" | "-h" => {
                return Err("usage: switchyard [--db PATH] [--listen HOST:PORT]".to_string());
            }
            other => return Err(format!("unknown arg: {other}")),
        }
    }
    Ok(CliArgs { db_path, listen })
}

async fn setting_i64(app: &AppState, key: SettingKey, fallback: i64) -> i64 {
    match app.store.get_setting(key.as_str().to_string()).await {
        Ok(Some(value)) => value.parse().unwrap_or(fallback),
        _ => fallback,
    }
}

fn spawn_background_tasks(app: AppState) {
    // Periodic stats flush.
    {
        let app = app.clone();
        tokio::spawn(async move {
            loop {
                let minutes = setting_i64(&app, SettingKey::StatsSaveInterval, 10).await.max(1) as u64;
                tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
                if let Err(err) = app.stats.flush().await {
                    error!(%err, "stats flush failed");
                }
            }
        });
    }

    // Remote price catalog refresh.
    {
        let app = app.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                let hours = setting_i64(&app, SettingKey::ModelInfoUpdateInterval, 24).await.max(1);
                app.prices
                    .update_remote_if_due(&client, Duration::from_secs(hours as u64 * 3600))
                    .await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }

    // Channel model-list auto-sync.
    {
        let app = app.clone();
        tokio::spawn(async move {
            loop {
                let hours = setting_i64(&app, SettingKey::SyncLlmInterval, 24).await.max(1) as u64;
                tokio::time::sleep(Duration::from_secs(hours * 3600)).await;
                sync::sync_channels(&app.registry, &app.clients).await;
            }
        });
    }

    // Channel base-URL delay probe (10 s deadline per URL).
    {
        let app = app.clone();
        tokio::spawn(async move {
            loop {
                probe::probe_channels(&app.registry, &app.clients).await;
                tokio::time::sleep(Duration::from_secs(30 * 60)).await;
            }
        });
    }

    // Relay log retention.
    {
        let app = app.clone();
        tokio::spawn(async move {
            loop {
                let days = setting_i64(&app, SettingKey::RelayLogKeepPeriod, 30).await;
                if days > 0 {
                    let cutoff = chrono::Utc::now().timestamp() - days * 86400;
                    match app.store.delete_relay_logs_before(cutoff).await {
                        Ok(deleted) if deleted > 0 => {
                            info!(deleted, "pruned old relay logs");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "relay log pruning failed"),
                    }
                }
                tokio::time::sleep(Duration::from_secs(86400)).await;
            }
        });
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args(std::env::args().skip(1))?;

    let store = Store::new(&args.db_path);
    store.init().await?;
    for (key, value) in settings::defaults() {
        store
            .seed_setting(key.as_str().to_string(), value.to_string())
            .await?;
    }

    let app = AppState::build(store).await?;

    if let Ok(Some(proxy_url)) = app
        .store
        .get_setting(SettingKey::ProxyUrl.as_str().to_string())
        .await
    {
        if let Err(err) = app.clients.set_system_proxy(&proxy_url) {
            warn!(%err, "ignoring configured proxy url");
        }
    }

    spawn_background_tasks(app.clone());

    let router = server::router(app.clone());
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "switchyard listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    // Final flush so in-memory windows survive the restart.
    if let Err(err) = app.stats.flush().await {
        warn!(%err, "final stats flush failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        error!(%err, "boot failed");
        std::process::exit(1);
    }
}
