//! Screen geometry and located elements.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// A screen coordinate `[x, y]`.
pub type Point = (f64, f64);

/// Logical screen size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpr: Option<f64>,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            dpr: None,
        }
    }
}

/// Axis-aligned rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpr: Option<f64>,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
            dpr: None,
        }
    }

    /// Build a rect from a `[x1, y1, x2, y2]` bounding box.
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        Self::new(
            bbox[0],
            bbox[1],
            (bbox[2] - bbox[0]).max(0.0),
            (bbox[3] - bbox[1]).max(0.0),
        )
    }

    /// Zero-size rect sitting on a point.
    pub fn at_point(point: Point) -> Self {
        Self::new(point.0, point.1, 0.0, 0.0)
    }

    /// Center of the rect, rounded to whole pixels.
    pub fn center(&self) -> Point {
        (
            (self.left + self.width / 2.0).round(),
            (self.top + self.height / 2.0).round(),
        )
    }

    pub fn contains(&self, point: Point) -> bool {
        point.0 >= self.left
            && point.0 <= self.left + self.width
            && point.1 >= self.top
            && point.1 <= self.top + self.height
    }
}

/// An element resolved to concrete coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocateResultElement {
    pub id: String,
    pub center: Point,
    pub rect: Rect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LocateResultElement {
    /// Element covering `rect`, centered on its rounded midpoint.
    pub fn from_rect(rect: Rect) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            center: rect.center(),
            rect,
            description: None,
        }
    }

    /// Element built directly from a planner-supplied bounding box.
    /// The center is floored, matching how the planner reports positions.
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        let center = (
            ((bbox[0] + bbox[2]) / 2.0).floor(),
            ((bbox[1] + bbox[3]) / 2.0).floor(),
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            center,
            rect: Rect::from_bbox(bbox),
            description: None,
        }
    }

    /// Element with a zero-size box centered on `point`.
    pub fn at_point(point: Point) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            center: point,
            rect: Rect::at_point(point),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Device-specific signature used to re-find an element without a model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCacheFeature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpaths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<Vec<String>>,
}

impl ElementCacheFeature {
    pub fn from_xpaths(xpaths: Vec<String>) -> Self {
        Self {
            xpaths: Some(xpaths),
            texts: None,
        }
    }

    pub fn with_texts(mut self, texts: Vec<String>) -> Self {
        self.texts = Some(texts);
        self
    }

    /// No usable signal; writing this would validate against anything.
    pub fn is_empty(&self) -> bool {
        let blank = |values: &Option<Vec<String>>| {
            values
                .as_ref()
                .map_or(true, |v| v.iter().all(|s| s.trim().is_empty()))
        };
        blank(&self.xpaths) && blank(&self.texts)
    }
}

/// One snapshot of the interface: its size and a screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiContext {
    pub size: Size,
    pub screenshot_base64: String,
    /// Set while the snapshot is held by a freeze.
    #[serde(skip)]
    pub frozen: bool,
}

impl UiContext {
    pub fn new(size: Size, screenshot_base64: impl Into<String>) -> Self {
        Self {
            size,
            screenshot_base64: screenshot_base64.into(),
            frozen: false,
        }
    }

    /// Build a context from raw PNG bytes.
    pub fn from_png_bytes(size: Size, png: &[u8]) -> Self {
        Self::new(size, STANDARD.encode(png))
    }

    /// Screenshot as a `data:` URL for vision models.
    pub fn screenshot_data_url(&self) -> String {
        if self.screenshot_base64.starts_with("data:") {
            self.screenshot_base64.clone()
        } else {
            format!("data:image/png;base64,{}", self.screenshot_base64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_from_bbox_floors_center() {
        let element = LocateResultElement::from_bbox([10.0, 20.0, 31.0, 41.0]);
        assert_eq!(element.center, (20.0, 30.0));
        assert_eq!(element.rect.width, 21.0);
        assert_eq!(element.rect.height, 21.0);
    }

    #[test]
    fn test_element_from_rect_rounds_center() {
        let element = LocateResultElement::from_rect(Rect::new(0.0, 0.0, 5.0, 5.0));
        assert_eq!(element.center, (3.0, 3.0));
    }

    #[test]
    fn test_zero_size_element() {
        let element = LocateResultElement::at_point((120.0, 48.0));
        assert_eq!(element.rect.width, 0.0);
        assert_eq!(element.rect.height, 0.0);
        assert_eq!(element.center, (120.0, 48.0));
        assert!(element.rect.contains((120.0, 48.0)));
    }

    #[test]
    fn test_center_serializes_as_array() {
        let element = LocateResultElement::at_point((1.0, 2.0));
        let json = serde_json::to_value(&element).unwrap();
        assert_eq!(json["center"], serde_json::json!([1.0, 2.0]));
    }

    #[test]
    fn test_feature_emptiness() {
        assert!(ElementCacheFeature::default().is_empty());
        assert!(ElementCacheFeature::from_xpaths(vec![" ".to_string()]).is_empty());
        assert!(!ElementCacheFeature::from_xpaths(vec!["/html/body".to_string()]).is_empty());
        let texts_only = ElementCacheFeature::default().with_texts(vec!["OK".to_string()]);
        assert!(!texts_only.is_empty());
    }

    #[test]
    fn test_ui_context_data_url() {
        let context = UiContext::from_png_bytes(Size::new(10.0, 10.0), b"png");
        assert_eq!(context.screenshot_base64, "cG5n");
        assert_eq!(context.screenshot_data_url(), "data:image/png;base64,cG5n");
    }
}
