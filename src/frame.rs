//! Latest-frame hand-off between the receive worker and the consumer.
//!
//! - `AnnotatedFrame`: one decoded frame with its detections drawn on it.
//! - `SharedFrame`: single-slot buffer. Publishing replaces the slot; there
//!   is no queue, so a slow consumer only ever sees the newest frame.
//! - `annotate`: draws detection boxes in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{DetectionResult, FaceBox, Label};

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

// ----------------------------------------------------------------------------
// AnnotatedFrame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub detections: Vec<DetectionResult>,
    pub captured_at: SystemTime,
    /// Position in publish order, starting at 1.
    pub sequence: u64,
}

impl AnnotatedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn known_names(&self) -> Vec<&str> {
        self.detections
            .iter()
            .filter(|d| d.label.is_known())
            .map(|d| d.label.name())
            .collect()
    }
}

/// Read-only handle to a published frame.
pub type LatestFrame = Arc<AnnotatedFrame>;

// ----------------------------------------------------------------------------
// SharedFrame: single-slot buffer
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct SharedFrame {
    slot: Mutex<Option<LatestFrame>>,
    published: AtomicU64,
}

impl SharedFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<LatestFrame>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current frame. The previous one stays valid for readers
    /// that already hold it.
    pub fn publish(
        &self,
        image: RgbImage,
        detections: Vec<DetectionResult>,
        captured_at: SystemTime,
    ) -> u64 {
        let sequence = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Arc::new(AnnotatedFrame {
            image,
            detections,
            captured_at,
            sequence,
        });
        *self.slot() = Some(frame);
        sequence
    }

    pub fn latest(&self) -> Option<LatestFrame> {
        self.slot().clone()
    }

    /// Frames published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Annotation
// ----------------------------------------------------------------------------

/// Draw a one-pixel box around every detection: green for known identities,
/// red for unknown faces.
pub fn annotate(image: &mut RgbImage, detections: &[DetectionResult]) {
    for detection in detections {
        let color = match detection.label {
            Label::Known(_) => KNOWN_COLOR,
            Label::Unknown => UNKNOWN_COLOR,
        };
        draw_box(image, &detection.bounding_box, color);
    }
}

fn draw_box(image: &mut RgbImage, bbox: &FaceBox, color: Rgb<u8>) {
    let (Ok(x), Ok(y)) = (i32::try_from(bbox.left), i32::try_from(bbox.top)) else {
        return;
    };
    let rect = Rect::at(x, y).of_size(bbox.width(), bbox.height());
    draw_hollow_rect_mut(image, rect, color);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: FaceBox, label: Label) -> DetectionResult {
        DetectionResult {
            bounding_box: bbox,
            label,
            distance: None,
        }
    }

    #[test]
    fn latest_frame_wins() {
        let shared = SharedFrame::new();
        assert!(shared.latest().is_none());

        shared.publish(RgbImage::new(2, 2), Vec::new(), SystemTime::now());
        let held = shared.latest().unwrap();
        shared.publish(RgbImage::new(4, 4), Vec::new(), SystemTime::now());

        assert_eq!(held.sequence, 1);
        assert_eq!(held.width(), 2);
        let newest = shared.latest().unwrap();
        assert_eq!(newest.sequence, 2);
        assert_eq!(newest.width(), 4);
        assert_eq!(shared.published(), 2);
    }

    #[test]
    fn boxes_are_colored_by_label() {
        let mut image = RgbImage::new(10, 10);
        annotate(
            &mut image,
            &[
                detection(FaceBox::new(1, 4, 4, 1), Label::Known("alice".into())),
                detection(FaceBox::new(5, 8, 8, 5), Label::Unknown),
            ],
        );
        assert_eq!(*image.get_pixel(1, 1), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(4, 2), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(2, 2), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(8, 8), UNKNOWN_COLOR);
    }

    #[test]
    fn out_of_frame_boxes_are_clipped() {
        let mut image = RgbImage::new(4, 4);
        annotate(
            &mut image,
            &[
                detection(FaceBox::new(2, 20, 20, 2), Label::Unknown),
                detection(FaceBox::new(10, 12, 12, 10), Label::Unknown),
            ],
        );
        // Only the top and left edges of the first box fall inside.
        assert_eq!(*image.get_pixel(2, 2), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(3, 2), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(2, 3), UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(3, 3), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(1, 1), Rgb([0, 0, 0]));
    }
}
