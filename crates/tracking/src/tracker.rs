//! Data association and filter lifecycle: one tracker owns every robot and
//! ball hypothesis and turns queued vision packets into a consolidated
//! world state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use field::{CameraInfo, FieldFrame, FieldGeometry, GeometryType};
use wire::radio::RadioCommand;
use wire::vision::{DetectionBall, DetectionRobot, VisionWrapper};
use wire::world::{TrackingAoi, WorldGeometry, WorldState};
use wire::Decode;

use crate::ball::{BallTracker, RobotInfo, SharedCameras, VisionFrame};
use crate::robot_filter::{NoiseProfile, RobotFilter};
use crate::{field_position, TeamColor};

/// Robots are associated to an existing filter only within this distance.
const ROBOT_ASSOCIATION_RADIUS: f32 = 0.5;

/// Lifetimes of unmatched filters.
const ROBOT_TIMEOUT_MULTI: i64 = 200_000_000;
const ROBOT_TIMEOUT_LAST: i64 = 1_000_000_000;
const BALL_TIMEOUT_MULTI: i64 = 100_000_000;
const BALL_TIMEOUT_LAST: i64 = 1_000_000_000;

/// After a reset every filter is emitted immediately for this long.
const WORLD_STATE_RESET_TIMEOUT: i64 = 500_000_000;
const BEST_ROBOTS_RESET_TIMEOUT: i64 = 100_000_000;

const MIN_FRAME_COUNT: u32 = 5;

/// Blue robots get this identifier offset so ball filters can reference
/// robots of both teams by one number.
const BLUE_IDENTIFIER_OFFSET: u32 = 256;

type RobotMap = HashMap<u32, Vec<RobotFilter>>;

pub struct Tracker {
    cameras: SharedCameras,
    geometry: FieldGeometry,
    geometry_updated: bool,
    flip: bool,
    system_delay: i64,
    reset_time: i64,
    has_vision_data: bool,
    last_update_time: i64,

    robot_filters_yellow: RobotMap,
    robot_filters_blue: RobotMap,
    ball_filters: Vec<BallTracker>,
    current_ball_flying: bool,

    vision_packets: Vec<(Vec<u8>, i64)>,
    camera_frame_times: HashMap<u32, i64>,

    aoi_enabled: bool,
    aoi: TrackingAoi,

    noise: NoiseProfile,
    track_balls: bool,
}

impl Tracker {
    pub fn new() -> Self {
        Self::with_noise(NoiseProfile::vision(), true)
    }

    pub(crate) fn with_noise(noise: NoiseProfile, track_balls: bool) -> Self {
        Self {
            cameras: Arc::new(RwLock::new(CameraInfo::default())),
            geometry: FieldGeometry::default(),
            geometry_updated: false,
            flip: false,
            system_delay: 0,
            reset_time: 0,
            has_vision_data: false,
            last_update_time: 0,
            robot_filters_yellow: RobotMap::new(),
            robot_filters_blue: RobotMap::new(),
            ball_filters: Vec::new(),
            current_ball_flying: false,
            vision_packets: Vec::new(),
            camera_frame_times: HashMap::new(),
            aoi_enabled: false,
            aoi: TrackingAoi::default(),
            noise,
            track_balls,
        }
    }

    pub fn reset(&mut self) {
        self.robot_filters_yellow.clear();
        self.robot_filters_blue.clear();
        self.ball_filters.clear();
        self.has_vision_data = false;
        self.reset_time = 0;
        self.last_update_time = 0;
        self.vision_packets.clear();
        self.camera_frame_times.clear();
    }

    /// Changes which goal belongs to which team.
    pub fn set_flip(&mut self, flip: bool) {
        self.flip = flip;
    }

    pub fn geometry(&self) -> &FieldGeometry {
        &self.geometry
    }

    /// Parsing is deferred to the next processing step.
    pub fn queue_packet(&mut self, packet: Vec<u8>, receive_time: i64) {
        self.vision_packets.push((packet, receive_time));
        self.has_vision_data = true;
    }

    /// Broadcast every command to all filters matching (team, id).
    pub fn queue_radio_commands(&mut self, commands: &[RadioCommand], time: i64) {
        for radio_command in commands {
            let map = if radio_command.is_blue {
                &mut self.robot_filters_blue
            } else {
                &mut self.robot_filters_yellow
            };
            if let Some(filters) = map.get_mut(&radio_command.id) {
                for filter in filters {
                    filter.add_radio_command(radio_command.command.clone(), time);
                }
            }
        }
    }

    pub fn handle_command(&mut self, command: &wire::command::TrackingCommand) {
        if let Some(enabled) = command.aoi_enabled {
            self.aoi_enabled = enabled;
        }
        if let Some(aoi) = &command.aoi {
            self.aoi = aoi.clone();
        }
        if let Some(delay) = command.system_delay {
            self.system_delay = delay;
        }
        if command.reset {
            self.reset();
        }
    }

    pub fn process(&mut self, current_time: i64) {
        // the reset time is used to show robots immediately after a reset
        if self.reset_time == 0 {
            self.reset_time = current_time;
        }

        self.invalidate_ball(current_time);
        invalidate_robots(&mut self.robot_filters_yellow, current_time);
        invalidate_robots(&mut self.robot_filters_blue, current_time);

        self.geometry_updated = false;

        let packets = std::mem::take(&mut self.vision_packets);
        for (bytes, receive_time) in packets {
            let wrapper = match VisionWrapper::decode_from_slice(&bytes) {
                Ok(wrapper) => wrapper,
                Err(error) => {
                    tracing::debug!(%error, "dropping malformed vision packet");
                    continue;
                }
            };

            if let Some(geometry) = &wrapper.geometry {
                self.update_geometry(geometry);
                self.geometry_updated = true;
            }

            let Some(detection) = wrapper.detection else {
                continue;
            };
            let vision_processing_time =
                ((detection.t_sent - detection.t_capture) * 1e9) as i64;
            // time on the field for which the frame was captured
            let source_time = receive_time - vision_processing_time - self.system_delay;

            // drop frames older than the current state
            if source_time <= self.last_update_time {
                continue;
            }
            self.camera_frame_times.insert(detection.camera_id, source_time);

            for robot in &detection.robots_yellow {
                track_robot(
                    &mut self.robot_filters_yellow,
                    robot,
                    source_time,
                    detection.camera_id,
                    vision_processing_time,
                    self.aoi_enabled.then_some((&self.aoi, self.flip)),
                    self.noise,
                );
            }
            for robot in &detection.robots_blue {
                track_robot(
                    &mut self.robot_filters_blue,
                    robot,
                    source_time,
                    detection.camera_id,
                    vision_processing_time,
                    self.aoi_enabled.then_some((&self.aoi, self.flip)),
                    self.noise,
                );
            }

            if self.track_balls {
                let best_robots = self.best_robot_infos(source_time);
                for ball in &detection.balls {
                    self.track_ball(
                        ball,
                        source_time,
                        detection.camera_id,
                        &best_robots,
                        vision_processing_time,
                    );
                }
                for ball_filter in &mut self.ball_filters {
                    ball_filter.update_confidence();
                }
            }

            self.last_update_time = source_time;
        }
    }

    fn update_geometry(&mut self, geometry: &wire::vision::GeometryData) {
        let lines: Vec<(&str, f32, f32, f32, f32, f32)> = geometry
            .field
            .field_lines
            .iter()
            .map(|line| {
                (
                    line.name.as_str(),
                    line.p1_x,
                    line.p1_y,
                    line.p2_x,
                    line.p2_y,
                    line.thickness,
                )
            })
            .collect();
        let arcs: Vec<(&str, f32, f32)> = geometry
            .field
            .field_arcs
            .iter()
            .map(|arc| (arc.name.as_str(), arc.radius, arc.thickness))
            .collect();
        self.geometry.update(&FieldFrame {
            field_width: geometry.field.field_width,
            field_length: geometry.field.field_length,
            goal_width: geometry.field.goal_width,
            goal_depth: geometry.field.goal_depth,
            boundary_width: geometry.field.boundary_width,
            lines: &lines,
            arcs: &arcs,
        });

        let mut cameras = self.cameras.write().unwrap();
        for calibration in &geometry.calibrations {
            let (Some(tx), Some(ty), Some(tz)) = (
                calibration.derived_camera_world_tx,
                calibration.derived_camera_world_ty,
                calibration.derived_camera_world_tz,
            ) else {
                continue;
            };
            cameras.update(calibration.camera_id, tx, ty, tz, calibration.focal_length);
        }
    }

    /// Best filters of both teams as ball-filter robot infos.
    fn best_robot_infos(&mut self, current_time: i64) -> Vec<RobotInfo> {
        let min_frame_count = if current_time > self.reset_time + BEST_ROBOTS_RESET_TIMEOUT {
            MIN_FRAME_COUNT
        } else {
            0
        };

        let mut infos = Vec::new();
        for (team, map) in [
            (TeamColor::Yellow, &mut self.robot_filters_yellow),
            (TeamColor::Blue, &mut self.robot_filters_blue),
        ] {
            for filters in map.values_mut() {
                if let Some(index) = best_filter_index(filters, min_frame_count) {
                    let filter = &mut filters[index];
                    filter.update(current_time);
                    infos.push(robot_info(filter, team));
                }
            }
        }
        infos
    }

    fn track_ball(
        &mut self,
        ball: &DetectionBall,
        source_time: i64,
        camera_id: u32,
        best_robots: &[RobotInfo],
        vision_processing_time: i64,
    ) {
        if self.aoi_enabled && !in_aoi(ball.x, ball.y, self.flip, &self.aoi) {
            return;
        }
        if !self.cameras.read().unwrap().has_camera(camera_id) {
            return;
        }
        let robot = nearest_robot_info(best_robots, ball);
        let frame = VisionFrame::new(ball, source_time, camera_id, robot, vision_processing_time);

        let mut accepting_filter_with_cam_id = false;
        let mut accepting_filter_with_other_cam_id = None;
        for (index, ball_filter) in self.ball_filters.iter_mut().enumerate() {
            ball_filter.update(source_time);
            if ball_filter.accept_detection(&frame) {
                if ball_filter.primary_camera() == camera_id {
                    ball_filter.add_vision_frame(frame.clone());
                    accepting_filter_with_cam_id = true;
                } else {
                    // remember for cross-camera hand-over in case no filter
                    // of the current camera accepts the frame
                    accepting_filter_with_other_cam_id = Some(index);
                }
            }
        }

        if !accepting_filter_with_cam_id {
            let mut ball_tracker = match accepting_filter_with_other_cam_id {
                Some(index) => self.ball_filters[index].clone_for_camera(camera_id),
                None => BallTracker::new(&frame, self.cameras.clone()),
            };
            ball_tracker.add_vision_frame(frame);
            self.ball_filters.push(ball_tracker);
        } else {
            // only prioritize when a detection was accepted
            self.prioritize_ball_filters();
        }
    }

    /// Sorts hypotheses so the one whose camera is closest to its last
    /// detection comes first; active flight reconstructions rank by their
    /// distance to the flight start.
    fn prioritize_ball_filters(&mut self) {
        let flying = self.current_ball_flying;
        for ball_filter in &mut self.ball_filters {
            ball_filter.calc_dist_to_camera(flying);
        }
        self.ball_filters.sort_by(|a, b| {
            a.cached_dist_to_camera()
                .total_cmp(&b.cached_dist_to_camera())
        });
    }

    /// The oldest hypothesis wins; prioritisation settles ties between
    /// camera hand-over clones sharing one init time.
    fn best_ball_filter_index(&mut self) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        for (index, ball_filter) in self.ball_filters.iter().enumerate() {
            if best.is_none() || ball_filter.init_time() < best.unwrap().1 {
                best = Some((index, ball_filter.init_time()));
            }
        }
        let index = best.map(|(index, _)| index);
        self.current_ball_flying = index
            .map(|index| self.ball_filters[index].is_flying())
            .unwrap_or(false);
        index
    }

    /// Assembles the world state at `current_time`. `system_time` feeds the
    /// raw-measurement delay fields; pass `reset_raw` on the emission whose
    /// consumers want each raw measurement exactly once.
    pub fn world_state(&mut self, current_time: i64, system_time: i64, reset_raw: bool) -> WorldState {
        // after a reset, allow fast repopulation
        let min_frame_count = if current_time > self.reset_time + WORLD_STATE_RESET_TIMEOUT {
            MIN_FRAME_COUNT
        } else {
            0
        };

        let mut world = WorldState {
            time: current_time,
            has_vision_data: self.has_vision_data,
            ..Default::default()
        };

        let mut robot_infos = Vec::new();
        for (team, map) in [
            (TeamColor::Yellow, &mut self.robot_filters_yellow),
            (TeamColor::Blue, &mut self.robot_filters_blue),
        ] {
            let mut ids: Vec<u32> = map.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let filters = map.get_mut(&id).unwrap();
                if let Some(index) = best_filter_index(filters, min_frame_count) {
                    let filter = &mut filters[index];
                    filter.update(current_time);
                    robot_infos.push(robot_info(filter, team));
                    let robot = filter.get(self.flip, false, system_time);
                    match team {
                        TeamColor::Yellow => world.yellow.push(robot),
                        TeamColor::Blue => world.blue.push(robot),
                    }
                }
            }
        }

        if let Some(index) = self.best_ball_filter_index() {
            let ball_filter = &mut self.ball_filters[index];
            ball_filter.update(current_time);
            let camera_frame_time = self
                .camera_frame_times
                .get(&ball_filter.primary_camera())
                .copied()
                .unwrap_or(0);
            world.ball =
                Some(ball_filter.get(self.flip, reset_raw, &robot_infos, camera_frame_time));
        }

        if self.aoi_enabled {
            world.tracking_aoi = Some(self.aoi.clone());
        }

        world
    }

    /// Geometry for status attachment; `None` unless a geometry frame was
    /// consumed by the latest processing step.
    pub fn geometry_update(&self) -> Option<WorldGeometry> {
        self.geometry_updated.then(|| {
            let g = &self.geometry;
            WorldGeometry {
                field_width: g.field_width,
                field_height: g.field_height,
                goal_width: g.goal_width,
                goal_depth: g.goal_depth,
                boundary_width: g.boundary_width,
                line_width: g.line_width,
                center_circle_radius: g.center_circle_radius,
                defense_width: g.defense_width,
                defense_height: g.defense_height,
                defense_radius: g.defense_radius,
                is_2014_type: g.geometry_type == GeometryType::Type2014,
            }
        })
    }

    /// Number of live ball hypotheses (camera hand-over clones included).
    pub fn ball_hypothesis_count(&self) -> usize {
        self.ball_filters.len()
    }

    /// Whether the currently selected ball hypothesis tracks a flight.
    pub fn ball_is_flying(&self) -> bool {
        self.current_ball_flying
    }

    fn invalidate_ball(&mut self, current_time: i64) {
        let multiple = self.ball_filters.len() > 1;
        self.ball_filters.retain(|ball_filter| {
            // a ball that is plausibly just occluded by a robot keeps the
            // full grace period even while competing hypotheses exist
            let time_limit = if ball_filter.is_feasibly_invisible() {
                BALL_TIMEOUT_LAST
            } else if multiple || ball_filter.frame_counter() < MIN_FRAME_COUNT {
                BALL_TIMEOUT_MULTI
            } else {
                BALL_TIMEOUT_LAST
            };
            ball_filter.last_update() + time_limit >= current_time
        });
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

fn invalidate_robots(map: &mut RobotMap, current_time: i64) {
    for filters in map.values_mut() {
        let multiple = filters.len() > 1;
        filters.retain(|filter| {
            // the last filter gets more time, but only while it is credible
            let time_limit = if multiple || filter.frame_counter() < MIN_FRAME_COUNT {
                ROBOT_TIMEOUT_MULTI
            } else {
                ROBOT_TIMEOUT_LAST
            };
            filter.last_update() + time_limit >= current_time
        });
    }
    map.retain(|_, filters| !filters.is_empty());
}

/// First filter reaching the frame-count bar, moved to the front for a
/// stable selection across ticks.
fn best_filter_index(filters: &mut [RobotFilter], min_frame_count: u32) -> Option<usize> {
    let index = filters
        .iter()
        .position(|filter| filter.frame_counter() >= min_frame_count)?;
    filters[0..=index].rotate_right(1);
    Some(0)
}

fn robot_info(filter: &RobotFilter, team: TeamColor) -> RobotInfo {
    let identifier = match team {
        TeamColor::Yellow => filter.id(),
        TeamColor::Blue => filter.id() + BLUE_IDENTIFIER_OFFSET,
    };
    let (past_robot_pos, past_dribbler_pos) = filter.past_pose();
    RobotInfo {
        identifier,
        robot_pos: filter.robot_pos(),
        dribbler_pos: filter.dribbler_pos(),
        past_robot_pos,
        past_dribbler_pos,
        speed: filter.speed(),
        angular_velocity: filter.angular_velocity(),
        chip_command: filter.kick_is_chip(),
        linear_command: filter.kick_is_linear(),
    }
}

fn nearest_robot_info(robots: &[RobotInfo], ball: &DetectionBall) -> RobotInfo {
    let ball_pos = field_position(ball.x, ball.y);
    let mut best = RobotInfo::default();
    let mut min_dist = f32::MAX;
    for info in robots {
        let dist = (ball_pos - info.dribbler_pos).norm();
        if dist < min_dist {
            min_dist = dist;
            best = *info;
        }
    }
    best
}

fn in_aoi(detection_x: f32, detection_y: f32, flip: bool, aoi: &TrackingAoi) -> bool {
    let mut pos = field_position(detection_x, detection_y);
    if flip {
        pos = -pos;
    }
    pos.x > aoi.x1 && pos.x < aoi.x2 && pos.y > aoi.y1 && pos.y < aoi.y2
}

#[allow(clippy::too_many_arguments)]
fn track_robot(
    robot_map: &mut RobotMap,
    robot: &DetectionRobot,
    source_time: i64,
    camera_id: u32,
    vision_processing_time: i64,
    aoi: Option<(&TrackingAoi, bool)>,
    noise: NoiseProfile,
) {
    let Some(robot_id) = robot.robot_id else {
        return;
    };
    if let Some((aoi, flip)) = aoi {
        if !in_aoi(robot.x, robot.y, flip, aoi) {
            return;
        }
    }

    // nearest predicted filter with the same id, spawning a fresh filter
    // when every candidate is farther than the association radius
    let filters = robot_map.entry(robot_id).or_default();
    let mut nearest = ROBOT_ASSOCIATION_RADIUS;
    let mut nearest_index = None;
    for (index, filter) in filters.iter_mut().enumerate() {
        filter.update(source_time);
        let dist = filter.distance_to(robot);
        if dist < nearest {
            nearest = dist;
            nearest_index = Some(index);
        }
    }

    let index = match nearest_index {
        Some(index) => index,
        None => {
            filters.push(RobotFilter::new(robot, source_time, noise));
            filters.len() - 1
        }
    };
    filters[index].add_vision_frame(camera_id, robot.clone(), source_time, vision_processing_time);
}
