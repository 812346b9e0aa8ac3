//! Local Binary Patterns Histograms (LBPH) face recognizer.
//!
//! Each face region is turned into a grid of 8×8 cells, each cell into a
//! normalized 256-bin histogram of 3×3 LBP codes. A prediction is the label of
//! the nearest enrolled sample under the chi-square distance, so lower
//! confidence values mean closer matches.

use crate::atomic;
use crate::identity::{IdentityError, IdentityMap};
use crate::pipeline::Recognizer;
use crate::types::{Frame, Prediction};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const GRID: usize = 8;
const BINS: usize = 256;
const HISTOGRAM_LEN: usize = GRID * GRID * BINS;
/// One LBP code needs a full 3×3 neighbourhood, and every cell needs a code.
pub const MIN_REGION_SIZE: u32 = GRID as u32 + 2;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not found: {0}")]
    ModelNotFound(String),
    #[error("invalid recognizer model: {0}")]
    InvalidModel(String),
    #[error("unrecognizable region: {0}")]
    Unrecognizable(String),
    #[error("recognizer model I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl RecognizerError {
    pub fn is_unrecognizable(&self) -> bool {
        matches!(self, Self::Unrecognizable(_))
    }
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),
    #[error("no usable face images under {0}")]
    NoSamples(PathBuf),
    #[error("dataset I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sample {
    label: i32,
    histogram: Vec<f32>,
}

/// Trained LBPH model: one spatial histogram per enrolled image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LbphModel {
    samples: Vec<Sample>,
}

impl LbphModel {
    /// Build a model from labelled face regions. Regions too small to describe are skipped.
    pub fn train<I>(faces: I) -> Self
    where
        I: IntoIterator<Item = (i32, Frame)>,
    {
        let samples = faces
            .into_iter()
            .filter_map(|(label, face)| match spatial_histogram(&face) {
                Ok(histogram) => Some(Sample { label, histogram }),
                Err(e) => {
                    tracing::warn!(label, error = %e, "skipping training sample");
                    None
                }
            })
            .collect();
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Err(RecognizerError::ModelNotFound(path.display().to_string()));
        }
        let file = std::fs::File::open(path)?;
        let model: LbphModel = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RecognizerError::InvalidModel(format!("{}: {e}", path.display())))?;

        if let Some(bad) = model.samples.iter().find(|s| s.histogram.len() != HISTOGRAM_LEN) {
            return Err(RecognizerError::InvalidModel(format!(
                "sample for label {} has {} bins, expected {HISTOGRAM_LEN}",
                bad.label,
                bad.histogram.len()
            )));
        }
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        atomic::replace_file::<RecognizerError, _>(path, |file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self).map_err(std::io::Error::from)?;
            writer.flush()?;
            Ok(())
        })
    }

    /// Nearest sample to `region`, as `(label, distance)`.
    pub fn predict(&self, region: &Frame) -> Result<Prediction, RecognizerError> {
        let query = spatial_histogram(region)?;
        self.samples
            .iter()
            .map(|s| Prediction {
                label: s.label,
                confidence: chi_square(&s.histogram, &query),
            })
            .min_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or_else(|| RecognizerError::Unrecognizable("model has no samples".into()))
    }
}

/// [`Recognizer`] backed by an [`LbphModel`].
pub struct LbphRecognizer {
    model: LbphModel,
}

impl LbphRecognizer {
    pub fn new(model: LbphModel) -> Self {
        Self { model }
    }

    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        let model = LbphModel::load(path)?;
        tracing::info!(path = %path.display(), samples = model.len(), "loaded LBPH model");
        Ok(Self::new(model))
    }
}

impl Recognizer for LbphRecognizer {
    fn predict(&mut self, region: &Frame) -> Result<Prediction, RecognizerError> {
        self.model.predict(region)
    }
}

/// Train from a dataset laid out as `<dataset>/<person name>/<image files>`.
///
/// People are labelled 0, 1, 2… in directory-name order. Files that do not
/// decode as images are skipped.
pub fn train_from_dir(dataset: &Path) -> Result<(LbphModel, IdentityMap), TrainError> {
    if !dataset.is_dir() {
        return Err(TrainError::DatasetNotFound(dataset.to_path_buf()));
    }

    let mut people: Vec<(String, PathBuf)> = std::fs::read_dir(dataset)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    people.sort();

    let mut faces = Vec::new();
    let mut identities = Vec::new();
    for (label, (name, dir)) in people.into_iter().enumerate() {
        let label = label as i32;
        let before = faces.len();
        for path in image_files(&dir)? {
            match image::open(&path) {
                Ok(img) => {
                    let gray = img.to_luma8();
                    let (w, h) = gray.dimensions();
                    faces.push((label, Frame::new(gray.into_raw(), w, h)));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image"),
            }
        }
        tracing::info!(label, name = %name, images = faces.len() - before, "collected training images");
        identities.push((label, name));
    }

    let model = LbphModel::train(faces);
    if model.is_empty() {
        return Err(TrainError::NoSamples(dataset.to_path_buf()));
    }
    let identities = IdentityMap::from_entries(identities)?;
    Ok((model, identities))
}

fn image_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// 3×3 LBP code image: `(width - 2) × (height - 2)` codes.
fn lbp_codes(region: &Frame) -> (Vec<u8>, usize, usize) {
    const NEIGHBOURS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];
    let w = region.width as usize - 2;
    let h = region.height as usize - 2;
    let mut codes = Vec::with_capacity(w * h);
    for y in 1..=h as i32 {
        for x in 1..=w as i32 {
            let center = region.pixel(x as u32, y as u32);
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                if region.pixel((x + dx) as u32, (y + dy) as u32) >= center {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }
    (codes, w, h)
}

/// Concatenated per-cell LBP histograms, each normalized to sum to 1.
fn spatial_histogram(region: &Frame) -> Result<Vec<f32>, RecognizerError> {
    if region.width < MIN_REGION_SIZE || region.height < MIN_REGION_SIZE {
        return Err(RecognizerError::Unrecognizable(format!(
            "{}x{} region is smaller than {MIN_REGION_SIZE}x{MIN_REGION_SIZE}",
            region.width, region.height
        )));
    }
    if region.data.len() < (region.width * region.height) as usize {
        return Err(RecognizerError::Unrecognizable("truncated region buffer".into()));
    }

    let (codes, w, h) = lbp_codes(region);
    let cell_w = w / GRID;
    let cell_h = h / GRID;
    let cell_pixels = (cell_w * cell_h) as f32;

    let mut hist = vec![0f32; HISTOGRAM_LEN];
    for row in 0..GRID {
        for col in 0..GRID {
            let base = (row * GRID + col) * BINS;
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    hist[base + codes[y * w + x] as usize] += 1.0;
                }
            }
            for bin in &mut hist[base..base + BINS] {
                *bin /= cell_pixels;
            }
        }
    }
    Ok(hist)
}

/// Symmetric chi-square distance: `Σ 2(a−b)² / (a+b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let (a, b) = (a as f64, b as f64);
            let sum = a + b;
            if sum > f64::EPSILON {
                2.0 * (a - b).powi(2) / sum
            } else {
                0.0
            }
        })
        .sum()
}
