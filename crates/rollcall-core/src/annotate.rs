//! Per-detection annotations and a simple renderer for previews.

use crate::types::{BoundingBox, Frame};
use image::{Rgb, RgbImage};
use std::sync::Arc;

const BOX_THICKNESS: u32 = 2;

/// Visual outcome of a detection: recognized or not.
///
/// Reflects recognition success only; a recognized person who was already
/// marked still gets `Accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Accept,
    Reject,
}

impl Marker {
    pub fn color(self) -> Rgb<u8> {
        match self {
            Marker::Accept => Rgb([0, 255, 0]),
            Marker::Reject => Rgb([255, 0, 0]),
        }
    }
}

/// One box plus the resolved name drawn for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
    pub marker: Marker,
}

/// A processed frame with its annotations, published for external rendering.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub frame: Arc<Frame>,
    pub annotations: Vec<Annotation>,
}

/// Render the frame as RGB with each annotation's box outlined in its marker color.
pub fn render(annotated: &AnnotatedFrame) -> RgbImage {
    let frame = &annotated.frame;
    let mut img = RgbImage::from_fn(frame.width, frame.height, |x, y| {
        let v = frame.pixel(x, y);
        Rgb([v, v, v])
    });

    for ann in &annotated.annotations {
        draw_box(&mut img, &ann.bbox, ann.marker.color());
    }

    img
}

fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let x0 = (bbox.x.max(0.0) as u32).min(w - 1);
    let y0 = (bbox.y.max(0.0) as u32).min(h - 1);
    let x1 = ((bbox.x + bbox.width).max(0.0) as u32).min(w - 1);
    let y1 = ((bbox.y + bbox.height).max(0.0) as u32).min(h - 1);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            img.put_pixel(x, (y0 + t).min(h - 1), color);
            img.put_pixel(x, y1.saturating_sub(t), color);
        }
        for y in y0..=y1 {
            img.put_pixel((x0 + t).min(w - 1), y, color);
            img.put_pixel(x1.saturating_sub(t), y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated(marker: Marker) -> AnnotatedFrame {
        AnnotatedFrame {
            frame: Arc::new(Frame::new(vec![50; 20 * 20], 20, 20)),
            annotations: vec![Annotation {
                bbox: BoundingBox { x: 4.0, y: 4.0, width: 10.0, height: 10.0, confidence: 0.9 },
                label: "Alice".into(),
                marker,
            }],
        }
    }

    #[test]
    fn test_render_draws_marker_color() {
        let img = render(&annotated(Marker::Accept));
        assert_eq!(*img.get_pixel(4, 4), Marker::Accept.color());
        assert_eq!(*img.get_pixel(14, 14), Marker::Accept.color());
        // Interior untouched.
        assert_eq!(*img.get_pixel(9, 9), Rgb([50, 50, 50]));
    }

    #[test]
    fn test_render_reject_is_red() {
        let img = render(&annotated(Marker::Reject));
        assert_eq!(*img.get_pixel(4, 9), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_render_clamps_out_of_frame_box() {
        let mut a = annotated(Marker::Accept);
        a.annotations[0].bbox = BoundingBox { x: -5.0, y: 15.0, width: 100.0, height: 100.0, confidence: 0.9 };
        let img = render(&a);
        assert_eq!(img.dimensions(), (20, 20));
        assert_eq!(*img.get_pixel(0, 19), Marker::Accept.color());
    }
}
