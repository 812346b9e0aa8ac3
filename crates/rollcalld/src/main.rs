use anyhow::Result;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use rollcall_core::config::Config;
use rollcall_core::{engine, AttendanceStore, EngineEvents, EngineHandle, LoopState, SystemClock};
use rollcall_hw::WebcamBackend;
use tracing_subscriber::EnvFilter;

mod dbus_interface;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        ledger = %config.ledger_path.display(),
        "rollcalld starting"
    );

    let store = AttendanceStore::new(&config.ledger_path);
    let (engine, events) = engine::spawn(
        WebcamBackend::new(config.clone()),
        SystemClock,
        store.clone(),
    )?;

    let service = AttendanceService::new(engine.clone(), store, config.camera_device.clone());
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tokio::spawn(forward_events(connection.clone(), events));

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    stop_and_wait(&engine).await;

    Ok(())
}

/// Re-emit every session event as an `Event` signal.
async fn forward_events(connection: zbus::Connection, mut events: EngineEvents) {
    let iface = match connection
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            tracing::error!(error = %e, "attendance interface missing; events will not be signalled");
            return;
        }
    };

    while let Some(event) = events.recv().await {
        let line = event.to_string();
        if let Err(e) = AttendanceService::event(iface.signal_emitter(), &line).await {
            tracing::warn!(error = %e, "failed to emit event signal");
        }
    }
}

/// Let a running session merge its attendance before the process exits.
async fn stop_and_wait(engine: &EngineHandle) {
    if engine.state() == LoopState::Idle {
        return;
    }
    if let Err(e) = engine.stop_when_ready().await {
        tracing::warn!(error = %e, "stop on shutdown failed");
    }
    let mut state = engine.watch_state();
    if let Err(e) = state.wait_for(|s| *s == LoopState::Idle).await {
        tracing::warn!(error = %e, "engine exited before returning to idle");
    }
}
