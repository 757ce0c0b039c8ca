use crate::api::TrovoApi;
use crate::commands::CommandTable;
use crate::config::Config;
use crate::session::Session;
use crate::store::Store;
use crate::transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    let store = Store::open(&config.store.data_dir)?;
    if config.store.backup_on_start {
        let path = store.backup()?;
        tracing::info!(path = %path.display(), "store backed up");
    }
    let store = Arc::new(Mutex::new(store));

    let api = Arc::new(TrovoApi::new(
        &config.trovo.api_url,
        &config.trovo.client_id,
        &config.trovo.client_secret,
        &config.trovo.channel_id,
    )?);

    // persist rotated tokens the moment a refresh succeeds, not just at the
    // next session start
    {
        let store = store.clone();
        api.set_on_refresh(Box::new(move |creds| {
            if let Err(err) = store.lock().unwrap().save_credentials(creds) {
                tracing::warn!(error = %err, "failed to persist refreshed credentials");
            }
        }));
    }

    let commands = Arc::new(CommandTable::builtin());

    tokio::select! {
        res = run_chat_loop(&config, store, api, commands) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    }
}

/// Outer connection loop. Each pass is one full session; a fixed delay
/// separates attempts so the gateway is never hammered after a failure.
async fn run_chat_loop(
    config: &Config,
    store: Arc<Mutex<Store>>,
    api: Arc<TrovoApi>,
    commands: Arc<CommandTable>,
) -> Result<(), Box<dyn std::error::Error>> {
    let reconnect_delay = Duration::from_secs(config.session.reconnect_delay_secs);
    let heartbeat_gap = Duration::from_secs(config.session.heartbeat_gap_secs);
    let token_timeout = Duration::from_secs(config.session.token_fetch_timeout_secs);

    loop {
        match transport::connect(&config.trovo.gateway_url).await {
            Ok((sink, stream)) => {
                let session = Session::new(
                    api.clone(),
                    api.clone(),
                    api.clone(),
                    store.clone(),
                    commands.clone(),
                    config.trovo.greeting.clone(),
                    heartbeat_gap,
                    token_timeout,
                );
                if let Err(err) = session.run(sink, stream).await {
                    tracing::warn!(error = %err, "chat session ended");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, url = %config.trovo.gateway_url, "gateway connect failed");
            }
        }

        tracing::info!(delay = ?reconnect_delay, "reconnecting");
        tokio::time::sleep(reconnect_delay).await;
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
