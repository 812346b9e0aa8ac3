use std::path::PathBuf;

/// Shared configuration for the daemon and the CLI, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the detector model, recognizer model, and label map.
    pub model_dir: PathBuf,
    /// Attendance ledger CSV.
    pub ledger_path: PathBuf,
    /// Enrollment images, one sub-directory per person.
    pub dataset_dir: PathBuf,
    /// Frames discarded after the camera opens (AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir: env_path("ROLLCALL_MODEL_DIR").unwrap_or_else(|| data_dir.join("models")),
            ledger_path: env_path("ROLLCALL_LEDGER_PATH")
                .unwrap_or_else(|| data_dir.join("attendance.csv")),
            dataset_dir: env_path("ROLLCALL_DATASET_DIR")
                .unwrap_or_else(|| data_dir.join("dataset")),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
        }
    }

    /// Path to the ONNX face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the trained LBPH recognizer.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join("recognizer.json")
    }

    /// Path to the label → name map.
    pub fn labels_path(&self) -> PathBuf {
        self.model_dir.join("labels.json")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
