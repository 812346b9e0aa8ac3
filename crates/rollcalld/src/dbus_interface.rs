use rollcall_core::{AttendanceStore, EngineError, EngineHandle, LoopState};
use serde::Serialize;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus control surface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    store: AttendanceStore,
    camera_device: String,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    version: &'a str,
    state: String,
    camera: &'a str,
    ledger: String,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, store: AttendanceStore, camera_device: String) -> Self {
        Self {
            engine,
            store,
            camera_device,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a recognition session on the webcam.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        if self.engine.state() != LoopState::Idle {
            return Err(zbus::fdo::Error::Failed("a session is already running".into()));
        }
        self.engine.start().map_err(engine_error)
    }

    /// Stop the running session and merge its attendance into the ledger.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        if self.engine.state() != LoopState::Running {
            return Err(zbus::fdo::Error::Failed("no session is running".into()));
        }
        self.engine.stop().map_err(engine_error)
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            state: self.engine.state().to_string(),
            camera: &self.camera_device,
            ledger: self.store.path().display().to_string(),
        };
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Attendance recorded in the ledger today, as (name, timestamp) pairs.
    async fn today(&self) -> zbus::fdo::Result<Vec<(String, String)>> {
        let store = self.store.clone();
        let today = chrono::Local::now().date_naive();
        let records = tokio::task::spawn_blocking(move || store.records_on(today))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::IOError(e.to_string()))?;

        Ok(records
            .into_iter()
            .map(|r| {
                let ts = r.timestamp_string();
                (r.name, ts)
            })
            .collect())
    }

    /// One session log line.
    #[zbus(signal)]
    pub async fn event(emitter: &SignalEmitter<'_>, line: &str) -> zbus::Result<()>;
}

fn engine_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::CommandPending => zbus::fdo::Error::LimitsExceeded(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}
