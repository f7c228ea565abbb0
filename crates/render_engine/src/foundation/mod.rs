//! Foundation utilities shared across the engine

/// Logging utilities
pub mod logging;
/// Math types and helpers
pub mod math;

pub use math::{Color, Mat4, Rect, Vec2, Vec3, Vec4};
