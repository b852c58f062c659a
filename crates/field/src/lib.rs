//! Field geometry and camera calibration registry.
//!
//! Rebuilt from every vision geometry frame. Lengths are meters in the
//! internal field frame; the vision frame reports millimeters with x and y
//! swapped relative to our convention (see the tracking crate for the
//! detection-side conversion).

use std::collections::HashMap;

use nalgebra::Vector3;

pub const ROBOT_RADIUS: f32 = 0.09;
pub const ROBOT_HEIGHT: f32 = 0.15;
pub const BALL_RADIUS: f32 = 0.0215;
pub const DRIBBLER_WIDTH: f32 = 0.07;

/// Which SSL rule generation the received field markings correspond to.
/// 2014-style fields carry penalty arcs, 2018-style fields penalty
/// rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeometryType {
    Type2014,
    #[default]
    Type2018,
}

#[derive(Debug, Clone, Default)]
pub struct FieldGeometry {
    pub field_width: f32,
    pub field_height: f32,
    pub goal_width: f32,
    pub goal_depth: f32,
    pub goal_height: f32,
    pub goal_wall_width: f32,
    pub boundary_width: f32,
    pub line_width: f32,
    pub center_circle_radius: f32,
    pub defense_stretch: f32,
    pub defense_width: f32,
    pub defense_height: f32,
    pub defense_radius: f32,
    pub referee_width: f32,
    pub free_kick_from_defense_dist: f32,
    pub penalty_spot_from_field_line_dist: f32,
    pub penalty_line_from_spot_dist: f32,
    pub geometry_type: GeometryType,
}

/// Raw field line/arc measurements as the geometry frame reports them,
/// millimeters.
pub struct FieldFrame<'a> {
    pub field_width: f32,
    pub field_length: f32,
    pub goal_width: f32,
    pub goal_depth: f32,
    pub boundary_width: f32,
    /// (name, p1x, p1y, p2x, p2y, thickness)
    pub lines: &'a [(&'a str, f32, f32, f32, f32, f32)],
    /// (name, radius, thickness)
    pub arcs: &'a [(&'a str, f32, f32)],
}

impl FieldGeometry {
    /// Rebuilds the geometry from a raw frame. Only named markings we know
    /// about contribute; the line width ends up as the thinnest reported
    /// marking.
    pub fn update(&mut self, frame: &FieldFrame<'_>) {
        self.field_width = frame.field_width / 1000.0;
        self.field_height = frame.field_length / 1000.0;
        self.goal_width = frame.goal_width / 1000.0;
        self.goal_depth = frame.goal_depth / 1000.0;
        self.boundary_width = frame.boundary_width / 1000.0;
        self.goal_height = 0.155;
        self.goal_wall_width = 0.02;
        self.free_kick_from_defense_dist = 0.20;
        self.penalty_line_from_spot_dist = 0.40;

        let mut min_thickness = f32::MAX;
        let mut is_2014 = true;
        for (name, p1x, p1y, p2x, p2y, thickness) in frame.lines {
            min_thickness = min_thickness.min(*thickness);
            match *name {
                "LeftPenaltyStretch" => {
                    self.defense_stretch = (p1y - p2y).abs() / 1000.0;
                    self.defense_width = (p1y - p2y).abs() / 1000.0;
                }
                "LeftFieldLeftPenaltyStretch" => {
                    self.defense_height = (p1x - p2x).abs() / 1000.0;
                    is_2014 = false;
                }
                _ => {}
            }
        }
        for (name, radius, thickness) in frame.arcs {
            min_thickness = min_thickness.min(*thickness);
            match *name {
                "LeftFieldLeftPenaltyArc" => {
                    is_2014 = true;
                    self.defense_radius = radius / 1000.0;
                }
                "CenterCircle" => {
                    self.center_circle_radius = radius / 1000.0;
                }
                _ => {}
            }
        }
        if min_thickness < f32::MAX {
            self.line_width = min_thickness / 1000.0;
        }

        self.referee_width = if is_2014 { 0.425 } else { 0.40 };
        self.penalty_spot_from_field_line_dist = if is_2014 { 1.00 } else { 1.20 };
        if !is_2014 && self.defense_radius == 0.0 {
            self.defense_radius = self.defense_height;
        }
        self.geometry_type = if is_2014 {
            GeometryType::Type2014
        } else {
            GeometryType::Type2018
        };
    }
}

/// Per-camera calibration: position in the internal field frame and the
/// focal length the detection-area unprojection needs.
#[derive(Debug, Clone, Default)]
pub struct CameraInfo {
    positions: HashMap<u32, Vector3<f32>>,
    focal_lengths: HashMap<u32, f32>,
}

impl CameraInfo {
    /// Stores one calibration. The vision frame reports the camera position
    /// in millimeters with its own axis convention; rotate into ours.
    pub fn update(&mut self, camera_id: u32, world_tx: f32, world_ty: f32, world_tz: f32, focal_length: f32) {
        let pos = Vector3::new(-world_ty / 1000.0, world_tx / 1000.0, world_tz / 1000.0);
        self.positions.insert(camera_id, pos);
        self.focal_lengths.insert(camera_id, focal_length);
    }

    pub fn position(&self, camera_id: u32) -> Option<Vector3<f32>> {
        self.positions.get(&camera_id).copied()
    }

    pub fn focal_length(&self, camera_id: u32) -> Option<f32> {
        self.focal_lengths.get(&camera_id).copied()
    }

    pub fn has_camera(&self, camera_id: u32) -> bool {
        self.positions.contains_key(&camera_id)
    }
}
