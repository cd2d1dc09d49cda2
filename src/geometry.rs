//! Conversion from the frontend's page rendering into PDF point space.
//!
//! The signing UI renders every page 800 units wide and records each field
//! as a center point plus extents in that space. All rectangles here use a
//! top-left origin; [`crate::pdf`] flips them into PDF user space.

pub const FRONTEND_PAGE_WIDTH: f64 = 800.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

pub fn scale_for(page_width: f64) -> f64 {
    page_width / FRONTEND_PAGE_WIDTH
}

/// Maps a center-anchored field rectangle onto a page `page_width` points wide.
pub fn field_rect(center_x: f64, center_y: f64, width: f64, height: f64, page_width: f64) -> Rect {
    let scale = scale_for(page_width);

    let x = center_x * scale;
    let y = center_y * scale;
    let w = width * scale;
    let h = height * scale;

    Rect {
        left: x - w / 2.0,
        top: y - h / 2.0,
        right: x + w / 2.0,
        bottom: y + h / 2.0,
    }
}

impl crate::models::SignatureField {
    pub fn page_rect(&self, page_width: f64) -> Rect {
        field_rect(self.x_position, self.y_position, self.width, self.height, page_width)
    }
}
