use std::fmt;

/// Label given to faces that match no gallery identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face bounding box in pixel coordinates of the processed frame.
///
/// Edges follow the (top, right, bottom, left) convention; `right` and
/// `bottom` are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left) + 1
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top) + 1
    }

    /// Clamp the box into a `width` x `height` frame. Returns `None` when the
    /// box lies entirely outside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceBox> {
        if width == 0 || height == 0 || self.left >= width || self.top >= height {
            return None;
        }
        Some(FaceBox {
            top: self.top,
            left: self.left,
            right: self.right.min(width - 1).max(self.left),
            bottom: self.bottom.min(height - 1).max(self.top),
        })
    }
}

/// Outcome of matching one face against the gallery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    Known(String),
    Unknown,
}

impl Label {
    pub fn is_known(&self) -> bool {
        matches!(self, Label::Known(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Label::Known(name) => name,
            Label::Unknown => UNKNOWN_LABEL,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One detected face in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub bounding_box: FaceBox,
    pub label: Label,
    /// Distance to the nearest gallery identity, when the gallery is non-empty.
    pub distance: Option<f32>,
}
