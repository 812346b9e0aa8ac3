//! The recognition loop: one session state machine shared by every front end.
//!
//! The loop runs on a dedicated OS thread and owns the frame source and the
//! session's artifacts while a session is running. Front ends talk to it
//! through an [`EngineHandle`] (commands in) and an [`EngineEvents`] receiver
//! plus a latest-frame watch channel (events out). Nothing on the output side
//! can block the loop.

use crate::annotate::{AnnotatedFrame, Annotation};
use crate::pipeline::{Clock, FrameSource, SessionBackend, SessionContext};
use crate::policy::{self, DailyAttendanceIndex, Decision, Outcome, SessionLedger};
use crate::store::{AttendanceStore, MergeOutcome};
use crate::types::{AttendanceRecord, Frame, Prediction};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("a command is already pending")]
    CommandPending,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

const STOP_RETRIES: usize = 20;
const STOP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Control commands. At most one is in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

/// Where the loop is in its `Idle → Running → Stopping → Idle` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A `stop` command (or a quit from the renderer).
    Requested,
    /// Every handle was dropped.
    Disconnected,
    SourceExhausted,
    /// The frame source could not be opened or read.
    SourceUnavailable(String),
    /// Models, label map, or ledger could not be loaded.
    StartFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::Disconnected => f.write_str("control surface disconnected"),
            StopReason::SourceExhausted => f.write_str("source exhausted"),
            StopReason::SourceUnavailable(e) => write!(f, "source unavailable: {e}"),
            StopReason::StartFailed(e) => write!(f, "start failed: {e}"),
        }
    }
}

/// Ordered session log, one text line per event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SourceStarted,
    Marked(AttendanceRecord),
    AlreadyMarkedToday { name: String },
    Saved { path: PathBuf, added: usize },
    NothingToSave,
    SummaryHeader,
    Attendee(AttendanceRecord),
    AttendeeCount(usize),
    NoNewAttendance,
    Stopped(StopReason),
    Error(String),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::SourceStarted => f.write_str("webcam started"),
            SessionEvent::Marked(r) => {
                write!(f, "marked attendance for {} at {}", r.name, r.timestamp_string())
            }
            SessionEvent::AlreadyMarkedToday { name } => {
                write!(f, "attendance for {name} already marked today")
            }
            SessionEvent::Saved { path, .. } => {
                write!(f, "attendance saved to {}", path.display())
            }
            SessionEvent::NothingToSave => f.write_str("no new attendance to save"),
            SessionEvent::SummaryHeader => f.write_str("--- attendance session summary ---"),
            SessionEvent::Attendee(r) => write!(f, "{}: {}", r.name, r.timestamp_string()),
            SessionEvent::AttendeeCount(n) => {
                write!(f, "total unique attendees this session: {n}")
            }
            SessionEvent::NoNewAttendance => f.write_str("no new attendance marked this session"),
            SessionEvent::Stopped(reason) => write!(f, "session stopped: {reason}"),
            SessionEvent::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Receiver for session events. Unbounded: the loop never waits on it.
pub type EngineEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Latest annotated frame. Older frames are replaced, never queued.
pub type FrameFeed = watch::Receiver<Option<Arc<AnnotatedFrame>>>;

/// Clone-safe handle to the engine thread.
///
/// The engine thread exits once every handle is dropped, after finishing
/// (and merging) any running session.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LoopState>,
    frames: FrameFeed,
}

impl EngineHandle {
    /// Ask the loop to start a session. Ignored by the loop if one is running.
    pub fn start(&self) -> Result<(), EngineError> {
        self.send(Command::Start)
    }

    /// Ask the loop to stop the running session. Takes effect within one frame.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.send(Command::Stop)
    }

    /// Like [`stop`](Self::stop), but waits out a command the loop has not
    /// picked up yet, such as a `start` sent just before.
    pub async fn stop_when_ready(&self) -> Result<(), EngineError> {
        for _ in 0..STOP_RETRIES {
            match self.stop() {
                Err(EngineError::CommandPending) => tokio::time::sleep(STOP_RETRY_DELAY).await,
                other => return other,
            }
        }
        self.stop()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    pub fn subscribe_frames(&self) -> FrameFeed {
        self.frames.clone()
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::CommandPending,
            TrySendError::Closed(_) => EngineError::ChannelClosed,
        })
    }
}

/// Per-detection log line.
fn recognition_line(decision: &Decision, prediction: &Prediction) -> String {
    match decision.outcome {
        Outcome::Rejected => "face not recognized".to_string(),
        _ => format!(
            "recognized {} (confidence {:.2})",
            decision.name, prediction.confidence
        ),
    }
}

/// Spawn the recognition loop on a dedicated OS thread, idle until `start`.
pub fn spawn<B, C>(
    backend: B,
    clock: C,
    store: AttendanceStore,
) -> Result<(EngineHandle, EngineEvents), EngineError>
where
    B: SessionBackend,
    C: Clock + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(1);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LoopState::Idle);
    let (frame_tx, frame_rx) = watch::channel(None);

    let engine = RecognitionLoop {
        backend,
        clock,
        store,
        commands: command_rx,
        events: event_tx,
        state: state_tx,
        frames: frame_tx,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || engine.run())
        .map_err(EngineError::Spawn)?;

    Ok((
        EngineHandle {
            commands: command_tx,
            state: state_rx,
            frames: frame_rx,
        },
        event_rx,
    ))
}

/// Per-session state, created on start and consumed on stop.
struct Session {
    source: Box<dyn FrameSource>,
    context: SessionContext,
    today: DailyAttendanceIndex,
    ledger: SessionLedger,
}

struct RecognitionLoop<B, C> {
    backend: B,
    clock: C,
    store: AttendanceStore,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<LoopState>,
    frames: watch::Sender<Option<Arc<AnnotatedFrame>>>,
}

impl<B: SessionBackend, C: Clock> RecognitionLoop<B, C> {
    fn run(mut self) {
        tracing::info!(ledger = %self.store.path().display(), "engine thread started");
        while let Some(command) = self.commands.blocking_recv() {
            match command {
                Command::Start => match self.begin() {
                    Ok(mut session) => {
                        let reason = self.run_session(&mut session);
                        let Session {
                            source,
                            context,
                            ledger,
                            ..
                        } = session;
                        drop(source);
                        drop(context);
                        self.finish(ledger, reason);
                    }
                    Err(reason) => self.finish(SessionLedger::new(), reason),
                },
                Command::Stop => tracing::debug!("stop ignored: no session running"),
            }
        }
        tracing::info!("engine thread exiting");
    }

    /// Idle → Running: acquire the source, load artifacts, snapshot today.
    fn begin(&mut self) -> Result<Session, StopReason> {
        let source = self.backend.open_source().map_err(|e| {
            self.emit(SessionEvent::Error(e.to_string()));
            StopReason::SourceUnavailable(e.to_string())
        })?;

        let context = self.backend.load_context().map_err(|e| {
            self.emit(SessionEvent::Error(e.to_string()));
            StopReason::StartFailed(e.to_string())
        })?;

        let today = self.clock.now().date();
        let today = self.store.load_today_set(today).map_err(|e| {
            self.emit(SessionEvent::Error(e.to_string()));
            StopReason::StartFailed(e.to_string())
        })?;

        tracing::info!(
            date = %today.date(),
            already_marked = today.len(),
            identities = context.identities.len(),
            "session started"
        );
        self.state.send_replace(LoopState::Running);
        self.emit(SessionEvent::SourceStarted);

        Ok(Session {
            source,
            context,
            today,
            ledger: SessionLedger::new(),
        })
    }

    /// Running: one frame per cycle until a stop condition.
    fn run_session(&mut self, session: &mut Session) -> StopReason {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) => return StopReason::Requested,
                Ok(Command::Start) => tracing::debug!("start ignored: session already running"),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return StopReason::Disconnected,
            }

            let frame = match session.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return StopReason::SourceExhausted,
                Err(e) => {
                    self.emit(SessionEvent::Error(e.to_string()));
                    return StopReason::SourceUnavailable(e.to_string());
                }
            };

            self.process_frame(session, frame);
        }
    }

    fn process_frame(&mut self, session: &mut Session, frame: Frame) {
        let detections = match session.context.detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detection failed; frame skipped");
                Vec::new()
            }
        };

        let mut annotations = Vec::with_capacity(detections.len());
        for bbox in detections {
            let Some(region) = frame.crop(&bbox) else {
                continue;
            };
            let prediction = match session.context.recognizer.predict(&region) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "recognition failed; detection skipped");
                    continue;
                }
            };

            let decision = policy::decide(
                &prediction,
                &session.context.identities,
                &mut session.ledger,
                &session.today,
                self.clock.now(),
            );
            tracing::debug!(
                label = prediction.label,
                outcome = ?decision.outcome,
                "{}",
                recognition_line(&decision, &prediction)
            );

            match &decision.outcome {
                Outcome::Marked(record) => self.emit(SessionEvent::Marked(record.clone())),
                Outcome::AlreadyMarkedToday => self.emit(SessionEvent::AlreadyMarkedToday {
                    name: decision.name.to_string(),
                }),
                Outcome::Rejected | Outcome::UnknownIdentity | Outcome::AlreadyInSession => {}
            }

            annotations.push(Annotation {
                bbox,
                label: decision.name.to_string(),
                marker: decision.marker,
            });
        }

        self.frames.send_replace(Some(Arc::new(AnnotatedFrame {
            frame: Arc::new(frame),
            annotations,
        })));
    }

    /// Stopping → Idle: merge, summarize. The source is already released.
    fn finish(&mut self, ledger: SessionLedger, reason: StopReason) {
        self.state.send_replace(LoopState::Stopping);
        tracing::info!(%reason, marked = ledger.len(), "session stopping");

        match self.store.merge(&ledger) {
            Ok(MergeOutcome::Unchanged) => self.emit(SessionEvent::NothingToSave),
            Ok(MergeOutcome::Appended { added, .. }) => self.emit(SessionEvent::Saved {
                path: self.store.path().to_path_buf(),
                added,
            }),
            Err(e) => self.emit(SessionEvent::Error(format!("failed to save attendance: {e}"))),
        }

        self.emit(SessionEvent::SummaryHeader);
        for record in ledger.records() {
            self.emit(SessionEvent::Attendee(record.clone()));
        }
        if ledger.is_empty() {
            self.emit(SessionEvent::NoNewAttendance);
        } else {
            self.emit(SessionEvent::AttendeeCount(ledger.len()));
        }

        self.emit(SessionEvent::Stopped(reason));
        self.state.send_replace(LoopState::Idle);
    }

    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Error(_) => tracing::error!("{event}"),
            _ => tracing::info!("{event}"),
        }
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Marker;
    use crate::types::{parse_timestamp, Resolved};

    fn handle_without_thread() -> (EngineHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(1);
        let (_state_tx, state_rx) = watch::channel(LoopState::Idle);
        let (_frame_tx, frame_rx) = watch::channel(None);
        let handle = EngineHandle {
            commands: tx,
            state: state_rx,
            frames: frame_rx,
        };
        (handle, rx)
    }

    #[test]
    fn test_one_command_in_flight() {
        let (handle, mut rx) = handle_without_thread();
        handle.start().unwrap();
        assert!(matches!(handle.stop(), Err(EngineError::CommandPending)));

        assert_eq!(rx.try_recv().unwrap(), Command::Start);
        handle.stop().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Command::Stop);
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_start() {
        let (handle, mut rx) = handle_without_thread();
        handle.start().unwrap();

        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });

        handle.stop_when_ready().await.unwrap();
        let (first, second) = drain.await.unwrap();
        assert_eq!(first, Some(Command::Start));
        assert_eq!(second, Some(Command::Stop));
    }

    #[tokio::test]
    async fn test_stop_when_ready_on_closed_channel() {
        let (handle, rx) = handle_without_thread();
        drop(rx);
        assert!(matches!(
            handle.stop_when_ready().await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[test]
    fn test_recognition_lines() {
        let alice = Decision {
            name: Resolved::Known("Alice".into()),
            marker: Marker::Accept,
            outcome: Outcome::AlreadyInSession,
        };
        let close = Prediction {
            label: 0,
            confidence: 42.5,
        };
        assert_eq!(
            recognition_line(&alice, &close),
            "recognized Alice (confidence 42.50)"
        );

        let unmapped = Decision {
            name: Resolved::Unknown,
            marker: Marker::Accept,
            outcome: Outcome::UnknownIdentity,
        };
        assert_eq!(
            recognition_line(&unmapped, &close),
            "recognized Unknown (confidence 42.50)"
        );

        let rejected = Decision {
            name: Resolved::Unknown,
            marker: Marker::Reject,
            outcome: Outcome::Rejected,
        };
        let far = Prediction {
            label: 0,
            confidence: 93.0,
        };
        assert_eq!(recognition_line(&rejected, &far), "face not recognized");
    }

    #[test]
    fn test_closed_channel() {
        let (handle, rx) = handle_without_thread();
        drop(rx);
        assert!(matches!(handle.start(), Err(EngineError::ChannelClosed)));
    }

    #[test]
    fn test_event_lines() {
        let ts = parse_timestamp("2024-01-01 09:30:00").unwrap();
        let alice = AttendanceRecord::new("Alice", ts);
        assert_eq!(
            SessionEvent::Marked(alice.clone()).to_string(),
            "marked attendance for Alice at 2024-01-01 09:30:00"
        );
        assert_eq!(
            SessionEvent::AlreadyMarkedToday { name: "Alice".into() }.to_string(),
            "attendance for Alice already marked today"
        );
        assert_eq!(SessionEvent::Attendee(alice).to_string(), "Alice: 2024-01-01 09:30:00");
        assert_eq!(
            SessionEvent::AttendeeCount(2).to_string(),
            "total unique attendees this session: 2"
        );
        assert_eq!(
            SessionEvent::Stopped(StopReason::SourceExhausted).to_string(),
            "session stopped: source exhausted"
        );
    }
}
