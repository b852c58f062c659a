//! Vision packets as ssl-vision publishes them: zero or one geometry frame
//! and zero or one detection frame per wrapper.
//!
//! Coordinates in these messages are raw vision values: millimeters in the
//! vision frame, orientation in radians. The tracking layer performs the
//! rotation and mm-to-m conversion.

use crate::message;

message! {
    /// One detected ball in a camera frame.
    pub struct DetectionBall {
        pub confidence: f32,
        /// Apparent ball area in pixels, 0 when the source does not report it.
        pub area: u32,
        pub x: f32,
        pub y: f32,
        pub pixel_x: f32,
        pub pixel_y: f32,
    }
}

message! {
    /// One detected robot in a camera frame.
    pub struct DetectionRobot {
        pub confidence: f32,
        pub robot_id: Option<u32>,
        pub x: f32,
        pub y: f32,
        pub orientation: f32,
        pub pixel_x: f32,
        pub pixel_y: f32,
    }
}

message! {
    /// All detections of one camera frame.
    pub struct DetectionFrame {
        pub frame_number: u32,
        /// Capture timestamp on the vision host, seconds.
        pub t_capture: f64,
        /// Send timestamp on the vision host, seconds.
        pub t_sent: f64,
        pub camera_id: u32,
        pub balls: Vec<DetectionBall>,
        pub robots_yellow: Vec<DetectionRobot>,
        pub robots_blue: Vec<DetectionRobot>,
    }
}

message! {
    pub struct FieldLineSegment {
        pub name: String,
        pub p1_x: f32,
        pub p1_y: f32,
        pub p2_x: f32,
        pub p2_y: f32,
        pub thickness: f32,
    }
}

message! {
    pub struct FieldCircularArc {
        pub name: String,
        pub center_x: f32,
        pub center_y: f32,
        pub radius: f32,
        pub a1: f32,
        pub a2: f32,
        pub thickness: f32,
    }
}

message! {
    pub struct GeometryFieldSize {
        pub field_length: f32,
        pub field_width: f32,
        pub goal_width: f32,
        pub goal_depth: f32,
        pub boundary_width: f32,
        pub field_lines: Vec<FieldLineSegment>,
        pub field_arcs: Vec<FieldCircularArc>,
    }
}

message! {
    /// Per-camera calibration. The derived world position is optional;
    /// ssl-vision omits it until the calibration converged.
    pub struct GeometryCameraCalibration {
        pub camera_id: u32,
        pub focal_length: f32,
        pub derived_camera_world_tx: Option<f32>,
        pub derived_camera_world_ty: Option<f32>,
        pub derived_camera_world_tz: Option<f32>,
    }
}

message! {
    pub struct GeometryData {
        pub field: GeometryFieldSize,
        pub calibrations: Vec<GeometryCameraCalibration>,
    }
}

message! {
    /// Top-level vision packet.
    pub struct VisionWrapper {
        pub detection: Option<DetectionFrame>,
        pub geometry: Option<GeometryData>,
    }
}
