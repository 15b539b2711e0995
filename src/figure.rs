//! Figure geometry: page-relative and absolute rectangles.
//!
//! The model reports figure boxes as percentages of the page (canonical) or
//! on a 0–1000 normalised grid; the cropping service wants PDF points. A
//! [`FigureLocation`] always carries the page's width and height in points
//! so the two forms convert consistently, and it cannot be built without
//! them.

use crate::error::FigureError;
use serde::{Deserialize, Serialize};

/// Tolerance used when comparing converted coordinates.
pub const EPSILON: f64 = 1e-6;

/// An axis-aligned rectangle, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Convert a `[ymin, xmin, ymax, xmax]` box on a 0–1000 grid to percent.
    pub fn from_normalized_1000(box_2d: [f64; 4]) -> Self {
        let [ymin, xmin, ymax, xmax] = box_2d;
        Self::new(xmin / 10.0, ymin / 10.0, (xmax - xmin) / 10.0, (ymax - ymin) / 10.0)
    }

    /// Clamp a percentage rectangle into `0..=100` on both axes.
    ///
    /// Returns `None` when nothing of positive area is left.
    pub fn clamp_percent(self) -> Option<Self> {
        let x = self.x.clamp(0.0, 100.0);
        let y = self.y.clamp(0.0, 100.0);
        let right = (self.x + self.width).clamp(0.0, 100.0);
        let bottom = (self.y + self.height).clamp(0.0, 100.0);
        let rect = Self::new(x, y, right - x, bottom - y);
        (rect.width > EPSILON && rect.height > EPSILON && rect.is_finite()).then_some(rect)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    pub fn approx_eq(&self, other: &Rect, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.width - other.width).abs() <= tolerance
            && (self.height - other.height).abs() <= tolerance
    }
}

/// Page size in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageDimensions {
    pub width: f64,
    pub height: f64,
}

impl PageDimensions {
    pub fn new(width: f64, height: f64) -> Result<Self, FigureError> {
        if width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite() {
            Ok(Self { width, height })
        } else {
            Err(FigureError::InvalidDimensions { width, height })
        }
    }

    /// A4 portrait.
    pub const A4: PageDimensions = PageDimensions {
        width: 595.0,
        height: 842.0,
    };
}

/// A figure box as reported by the model, before page dimensions are known.
///
/// `page` is batch-relative in a raw record and absolute in a merged one;
/// `rect` is always in percent of the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FigureBox {
    pub page: usize,
    pub rect: Rect,
}

/// Unit of a [`FigureLocation`] rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    Percent,
    Points,
}

/// A rectangle on a specific 1-indexed page with that page's dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FigureLocation {
    pub page: usize,
    pub units: Units,
    pub rect: Rect,
    pub page_size: PageDimensions,
}

impl FigureLocation {
    /// Place a percentage rectangle. Fails without page dimensions.
    pub fn percent(
        page: usize,
        rect: Rect,
        page_size: Option<PageDimensions>,
    ) -> Result<Self, FigureError> {
        let page_size = page_size.ok_or(FigureError::MissingDimensions { page })?;
        Ok(Self {
            page,
            units: Units::Percent,
            rect,
            page_size,
        })
    }

    /// Place a rectangle given in points. Fails without page dimensions.
    pub fn points(
        page: usize,
        rect: Rect,
        page_size: Option<PageDimensions>,
    ) -> Result<Self, FigureError> {
        let page_size = page_size.ok_or(FigureError::MissingDimensions { page })?;
        Ok(Self {
            page,
            units: Units::Points,
            rect,
            page_size,
        })
    }

    /// The rectangle in points.
    pub fn to_points(&self) -> Rect {
        match self.units {
            Units::Points => self.rect,
            Units::Percent => {
                let PageDimensions { width, height } = self.page_size;
                Rect::new(
                    self.rect.x / 100.0 * width,
                    self.rect.y / 100.0 * height,
                    self.rect.width / 100.0 * width,
                    self.rect.height / 100.0 * height,
                )
            }
        }
    }

    /// The rectangle in percent of the page.
    pub fn to_percent(&self) -> Rect {
        match self.units {
            Units::Percent => self.rect,
            Units::Points => {
                let PageDimensions { width, height } = self.page_size;
                Rect::new(
                    self.rect.x / width * 100.0,
                    self.rect.y / height * 100.0,
                    self.rect.width / width * 100.0,
                    self.rect.height / height * 100.0,
                )
            }
        }
    }

    /// Same location expressed in points.
    pub fn as_points(&self) -> Self {
        Self {
            units: Units::Points,
            rect: self.to_points(),
            ..*self
        }
    }

    /// Same location expressed in percent.
    pub fn as_percent(&self) -> Self {
        Self {
            units: Units::Percent,
            rect: self.to_percent(),
            ..*self
        }
    }

    /// 0-based page index, as page-rendering APIs expect.
    pub fn page_index(&self) -> usize {
        self.page.saturating_sub(1)
    }

    /// Crop rectangle in points: grown by `padding` on every side and
    /// clamped to the page.
    pub fn crop_rect(&self, padding: f64) -> Rect {
        let r = self.to_points();
        let PageDimensions { width, height } = self.page_size;
        let x = (r.x - padding).max(0.0);
        let y = (r.y - padding).max(0.0);
        let right = (r.x + r.width + padding).min(width);
        let bottom = (r.y + r.height + padding).min(height);
        Rect::new(x, y, (right - x).max(0.0), (bottom - y).max(0.0))
    }
}
