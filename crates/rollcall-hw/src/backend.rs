//! Session backend wiring the webcam and the on-disk artifacts together.

use crate::camera::Camera;
use rollcall_core::config::Config;
use rollcall_core::detector::OnnxFaceDetector;
use rollcall_core::pipeline::{ContextError, FrameSource, SessionBackend, SessionContext, SourceError};
use rollcall_core::recognizer::LbphRecognizer;
use rollcall_core::IdentityMap;

/// Opens the configured webcam and loads models fresh for every session,
/// so a `rollcall train` between sessions takes effect on the next start.
pub struct WebcamBackend {
    config: Config,
}

impl WebcamBackend {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SessionBackend for WebcamBackend {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, SourceError> {
        let camera = Camera::open(&self.config.camera_device)?;
        let stream = camera.stream(self.config.warmup_frames)?;
        Ok(Box::new(stream))
    }

    fn load_context(&mut self) -> Result<SessionContext, ContextError> {
        let detector = OnnxFaceDetector::load(&self.config.detector_model_path())?;

        let recognizer = LbphRecognizer::load(&self.config.recognizer_model_path())?;

        let identities = IdentityMap::load(&self.config.labels_path())?;
        tracing::info!(count = identities.len(), "label map loaded");

        Ok(SessionContext {
            detector: Box::new(detector),
            recognizer: Box::new(recognizer),
            identities,
        })
    }
}
