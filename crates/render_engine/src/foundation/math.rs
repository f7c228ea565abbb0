//! Math utilities and types
//!
//! Provides the fundamental math types used by the rendering core.

pub use nalgebra::{Matrix3, Matrix4, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Normalized rectangle in [0, 1] coordinates, used for camera viewports
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    /// Left edge, normalized
    pub x: f32,
    /// Top edge, normalized
    pub y: f32,
    /// Width, normalized
    pub w: f32,
    /// Height, normalized
    pub h: f32,
}

impl Rect {
    /// Create a new normalized rect
    pub const fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// The full target rect
    pub const fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Convert to pixel coordinates for a target of the given extent.
    ///
    /// Degenerate targets clamp to a 1x1 pixel viewport instead of producing
    /// a zero-area (or division-prone) region.
    pub fn to_pixels(&self, target_width: u32, target_height: u32) -> PixelRect {
        let tw = target_width.max(1) as f32;
        let th = target_height.max(1) as f32;
        let x = (self.x.clamp(0.0, 1.0) * tw) as i32;
        let y = (self.y.clamp(0.0, 1.0) * th) as i32;
        let w = ((self.w.clamp(0.0, 1.0) * tw) as u32).max(1);
        let h = ((self.h.clamp(0.0, 1.0) * th) as u32).max(1);
        PixelRect { x, y, w, h }
    }
}

impl Default for Rect {
    fn default() -> Self {
        Self::full()
    }
}

/// Rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    /// Left edge in pixels
    pub x: i32,
    /// Top edge in pixels
    pub y: i32,
    /// Width in pixels, always >= 1
    pub w: u32,
    /// Height in pixels, always >= 1
    pub h: u32,
}

/// RGBA color with f32 components
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Color {
    /// Red component
    pub r: f32,
    /// Green component
    pub g: f32,
    /// Blue component
    pub b: f32,
    /// Alpha component
    pub a: f32,
}

impl Color {
    /// Create a new color
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Opaque black
    pub const fn black() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }

    /// Opaque white
    pub const fn white() -> Self {
        Self::new(1.0, 1.0, 1.0, 1.0)
    }

    /// Components as an array, matching `VkClearColorValue::float32`
    pub const fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::black()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_full_covers_target() {
        let px = Rect::full().to_pixels(1280, 720);
        assert_eq!(px, PixelRect { x: 0, y: 0, w: 1280, h: 720 });
    }

    #[test]
    fn test_rect_half_viewport() {
        let px = Rect::new(0.5, 0.0, 0.5, 1.0).to_pixels(800, 600);
        assert_eq!(px.x, 400);
        assert_eq!(px.w, 400);
        assert_eq!(px.h, 600);
    }

    #[test]
    fn test_rect_degenerate_target_clamps() {
        // A zero-sized target must not produce a zero-area viewport
        let px = Rect::full().to_pixels(0, 0);
        assert_eq!(px.w, 1);
        assert_eq!(px.h, 1);

        let px = Rect::new(0.0, 0.0, 0.0, 0.0).to_pixels(1024, 768);
        assert_eq!(px.w, 1);
        assert_eq!(px.h, 1);
    }

    #[test]
    fn test_rect_out_of_range_clamps() {
        let px = Rect::new(-0.5, 1.5, 2.0, 2.0).to_pixels(100, 100);
        assert_eq!(px.x, 0);
        assert_eq!(px.y, 100);
        assert_eq!(px.w, 100);
        assert_eq!(px.h, 100);
    }

    #[test]
    fn test_color_array_layout() {
        let c = Color::new(0.1, 0.2, 0.3, 0.4);
        assert_eq!(c.to_array(), [0.1, 0.2, 0.3, 0.4]);
    }
}
