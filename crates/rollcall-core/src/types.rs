use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used in the ledger and in session events.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Display name used for rejected or unmapped detections.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A grayscale frame (one byte per pixel, row-major).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            sequence: 0,
        }
    }

    /// Pixel at (x, y). Out-of-range coordinates read as 0.
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data
            .get((y * self.width + x) as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Copy out the region under `bbox`, clamped to the frame.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let x0 = bbox.x.floor().max(0.0) as u32;
        let y0 = bbox.y.floor().max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(self.width);
        let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let w = x1 - x0;
        let h = y1 - y0;
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y0..y1 {
            let start = (y * self.width + x0) as usize;
            let end = start + w as usize;
            data.extend_from_slice(self.data.get(start..end)?);
        }

        Some(Frame {
            data,
            width: w,
            height: h,
            sequence: self.sequence,
        })
    }
}

/// Raw recognizer output. `confidence` is a distance: lower is a closer match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub confidence: f64,
}

/// A recognizer label resolved against the session's identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolved {
    Known(String),
    Unknown,
}

impl Resolved {
    pub fn name(&self) -> Option<&str> {
        match self {
            Resolved::Known(name) => Some(name),
            Resolved::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Resolved::Known(_))
    }
}

impl fmt::Display for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or(UNKNOWN_NAME))
    }
}

/// One attendance event: who, and when they were first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub name: String,
    pub timestamp: NaiveDateTime,
}

impl AttendanceRecord {
    pub fn new(name: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            timestamp,
        }
    }

    /// Timestamp rendered as `YYYY-MM-DD HH:MM:SS`.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Parse a ledger timestamp (`YYYY-MM-DD HH:MM:SS`).
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
}
