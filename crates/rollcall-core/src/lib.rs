//! rollcall-core: attendance decisions, ledger merge, and the recognition loop.
//!
//! The [`engine`] drives frames from a [`pipeline::FrameSource`] through a
//! [`pipeline::Detector`] and [`pipeline::Recognizer`], applies the
//! [`policy`] to each recognized face, and merges the session's marks into the
//! [`store`] when the session stops.

pub mod annotate;
pub mod config;
pub mod detector;
pub mod engine;
pub mod identity;
pub mod pipeline;
pub mod policy;
pub mod recognizer;
pub mod store;
pub mod types;

mod atomic;

pub use annotate::{AnnotatedFrame, Annotation, Marker};
pub use engine::{EngineError, EngineEvents, EngineHandle, FrameFeed, LoopState, SessionEvent, StopReason};
pub use identity::IdentityMap;
pub use pipeline::{Clock, Detector, FrameSource, Recognizer, SessionBackend, SessionContext, SystemClock};
pub use policy::{DailyAttendanceIndex, Decision, Outcome, SessionLedger};
pub use store::{AttendanceStore, MergeOutcome};
pub use types::{AttendanceRecord, BoundingBox, Frame, Prediction, Resolved};
