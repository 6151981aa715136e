use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

use lib_reservoir::connections::{MemoryBroker, RedisTransport};
use lib_reservoir::core::{Publisher, SessionManager, TopicRouter, Transport, WireCodec};

mod reservoir_logic;
use reservoir_logic::config::{self, BrokerKind, Settings};
use reservoir_logic::{display, export, logger, state, supervisor, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let router = TopicRouter::from_sources(&settings.sources, &settings.channel_suffix)?;
    log::info!("Routing {} source(s): {}", router.len(), router.channels().join(", "));
    let codec = WireCodec::new(&settings.date_column, &settings.value_column);
    let app_state = state::AppState::new(router, codec);

    match settings.broker_kind {
        BrokerKind::Redis => {
            log::info!("Using Redis broker at {}", settings.broker.endpoint());
            let transport = Arc::new(RedisTransport::new(&settings.broker)?);
            run(settings, app_state, transport).await
        }
        BrokerKind::Memory => {
            log::info!("Using in-process broker");
            let broker = MemoryBroker::new();
            run(settings, app_state, Arc::new(broker.client())).await
        }
    }
}

async fn run<T: Transport>(
    settings: Settings,
    app_state: state::AppState,
    transport: Arc<T>,
) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut stop_rx = shutdown_tx.subscribe();

    let display_handle = tokio::spawn(display::run(
        app_state.aggregator.subscribe_updates(),
        app_state.codec.value_field().to_string(),
        shutdown_tx.subscribe(),
    ));

    let session = Arc::new(
        SessionManager::new(
            transport.clone(),
            app_state.router.clone(),
            app_state.aggregator.clone(),
            app_state.codec.clone(),
        )
        .with_connect_timeout(settings.broker.connect_timeout)
        .with_reconnect_policy(settings.reconnect),
    );

    let supervisor_handle = tokio::spawn(supervisor::run(
        session.subscribe_events(),
        settings.reconnect,
        shutdown_tx.clone(),
    ));

    if let Err(e) = session.connect().await {
        let _ = shutdown_tx.send(());
        let _ = tokio::join!(display_handle, supervisor_handle);
        return Err(e.into());
    }

    let batches = upstream::load_sources(&settings);
    let publisher = Publisher::new(transport, app_state.router.clone(), app_state.codec.clone())
        .with_pacing(settings.pacing);
    let mut publish_handle = tokio::spawn(upstream::run(publisher, batches));

    tokio::select! {
        _ = &mut publish_handle => {
            log::info!(
                "Publishing finished, receiving for another {:?}.",
                settings.linger
            );
            tokio::select! {
                _ = tokio::time::sleep(settings.linger) => {}
                _ = shutdown_signal() => {}
                _ = stop_rx.recv() => {}
            }
        }
        _ = shutdown_signal() => {}
        _ = stop_rx.recv() => {}
    }

    publish_handle.abort();
    session.disconnect().await;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(display_handle, supervisor_handle);

    if let Some(path) = &settings.export_path {
        export::write_summaries(path, &app_state.aggregator.snapshot())?;
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term_signal =
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = signal::ctrl_c().await;
                    log::info!("Ctrl-C received, initiating shutdown.");
                    return;
                }
            };
        tokio::select! {
            _ = signal::ctrl_c() => log::info!("Ctrl-C received, initiating shutdown."),
            _ = term_signal.recv() => log::info!("SIGTERM received, initiating shutdown."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
}
