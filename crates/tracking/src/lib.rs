//! Object tracking: per-robot Kalman filters, the ball filter family and
//! the tracker that owns them.
//!
//! The vision system reports millimeters in its own axis convention; we
//! work in meters in a right-handed field frame rotated by 90 degrees
//! (reported x becomes -y, reported y becomes x). All conversions happen at
//! the boundary, in [`field_position`] and the per-filter frame
//! constructors.

use nalgebra::Vector2;

pub mod ball;
pub mod robot_filter;
pub mod speed_tracker;
pub mod tracker;

pub use speed_tracker::SpeedTracker;
pub use tracker::Tracker;

pub const PROCESSOR_TICK_DURATION: i64 = 10_000_000;
pub const NS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeamColor {
    Yellow,
    Blue,
}

/// Converts a reported vision position (millimeters, vision axes) into the
/// internal field frame (meters).
#[inline]
pub fn field_position(detection_x: f32, detection_y: f32) -> Vector2<f32> {
    Vector2::new(-detection_y / 1000.0, detection_x / 1000.0)
}

/// Wraps an angle into (-pi, pi].
pub fn wrap_angle(mut angle: f32) -> f32 {
    use std::f32::consts::PI;
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle < -PI {
        angle += 2.0 * PI;
    }
    // the lower boundary belongs to the other end of the interval
    if angle <= -PI {
        angle += 2.0 * PI;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn vision_coordinates_rotate_into_the_field_frame() {
        let pos = field_position(1000.0, -2000.0);
        assert!((pos.x - 2.0).abs() < 1e-6);
        assert!((pos.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn angles_wrap_into_half_open_pi_interval() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-5);
        // -3*pi lands on the interval boundary; float rounding may leave it
        // just inside either end, both are the same heading
        assert!((wrap_angle(-3.0 * PI).abs() - PI).abs() < 1e-5);
        // the exact lower boundary canonicalizes to +pi
        assert!((wrap_angle(-PI) - PI).abs() < 1e-6);
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-6);
        assert!(wrap_angle(100.0).abs() <= PI + 1e-5);
    }
}
