//! Contracts for the collaborators the recognition loop drives.

use crate::detector::DetectorError;
use crate::identity::{IdentityError, IdentityMap};
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Frame, Prediction};
use chrono::{NaiveDateTime, Timelike};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// A stream of grayscale frames, owned by one session.
///
/// Dropping the source releases the underlying device.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Finds faces in a frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Classifies one cropped grayscale face region.
///
/// `RecognizerError::Unrecognizable` tells the loop to skip the detection.
pub trait Recognizer: Send {
    fn predict(&mut self, region: &Frame) -> Result<Prediction, RecognizerError>;
}

/// Source of "now" for attendance timestamps and the daily snapshot.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time, truncated to whole seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = chrono::Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// Artifacts loaded for one session and owned by the loop until it stops.
pub struct SessionContext {
    pub detector: Box<dyn Detector>,
    pub recognizer: Box<dyn Recognizer>,
    pub identities: IdentityMap,
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("identities: {0}")]
    Identity(#[from] IdentityError),
}

/// Everything the engine acquires when a session starts.
///
/// Called on the engine thread, once per `start`.
pub trait SessionBackend: Send + 'static {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, SourceError>;
    fn load_context(&mut self) -> Result<SessionContext, ContextError>;
}
