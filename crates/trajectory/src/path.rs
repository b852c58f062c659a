//! The trajectory planner: obstacle preprocessing, the direct/sampler
//! decision tree and result sampling.

use crate::alpha_time::AlphaTimeTrajectory;
use crate::obstacles::{MovingObstacle, Obstacle};
pub use crate::profile::TrajectoryPoint;
pub use crate::sampler::{PlanningWorld, TrajectoryInput};
use crate::sampler::{
    EndInObstacleSampler, EscapeObstacleSampler, StandardSampler, TrajectoryGenerationInfo,
    OBSTACLE_AVOIDANCE_RADIUS,
};
use crate::Vector;

/// Number of samples each planned trajectory part contributes.
const SAMPLES_PER_TRAJECTORY: usize = 40;

/// A target inside an obstacle is projected out when it is at most this
/// deep.
const PROJECT_OUT_DEPTH: f32 = 0.2;

pub struct TrajectoryPath {
    world: PlanningWorld,
    standard_sampler: StandardSampler,
    end_in_obstacle_sampler: EndInObstacleSampler,
    escape_obstacle_sampler: EscapeObstacleSampler,
}

impl TrajectoryPath {
    pub fn new(rng_seed: u64) -> Self {
        Self {
            world: PlanningWorld::default(),
            standard_sampler: StandardSampler::new(rng_seed),
            end_in_obstacle_sampler: EndInObstacleSampler::new(rng_seed.wrapping_add(1)),
            escape_obstacle_sampler: EscapeObstacleSampler::new(rng_seed.wrapping_add(2)),
        }
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.world.radius = radius;
    }

    pub fn clear_obstacles(&mut self) {
        self.world.obstacles.clear();
        self.world.moving_obstacles.clear();
    }

    pub fn add_obstacle(&mut self, obstacle: Obstacle) {
        self.world.obstacles.push(obstacle);
    }

    pub fn add_moving_obstacle(&mut self, obstacle: MovingObstacle) {
        self.world.moving_obstacles.push(obstacle);
    }

    /// Plans from (s0, v0) to (s1, v1) and samples the result. An empty
    /// input or a planner failure yields the resting fallback path.
    pub fn calculate_trajectory(
        &mut self,
        s0: Vector,
        v0: Vector,
        s1: Vector,
        v1: Vector,
        max_speed: f32,
        acceleration: f32,
    ) -> Vec<TrajectoryPoint> {
        if max_speed < 0.01 || acceleration < 0.01 {
            tracing::debug!(max_speed, acceleration, "invalid trajectory input");
            return vec![];
        }

        let mut input = TrajectoryInput {
            s0,
            s1,
            v0,
            v1,
            distance: s1 - s0,
            max_speed,
            acceleration,
            exponential_slow_down: v1 == Vector::zeros(),
        };

        let generation_info = self.find_path(&mut input);
        self.result_path(&input, &generation_info)
    }

    fn find_path(&mut self, input: &mut TrajectoryInput) -> Vec<TrajectoryGenerationInfo> {
        self.escape_obstacle_sampler.max_intersecting_obstacle_prio = -1;

        let mut world = self.world.clone();
        world.inflate_by_radius();

        // start point inside an obstacle: escape first, then keep planning
        // from the escape endpoint
        if world.is_in_static_obstacle(input.s0) || world.is_in_moving_obstacle(input.s0, 0.0) {
            let Some(escape) = self.escape_obstacle_sampler.compute(input, &world) else {
                return vec![];
            };
            let escape_info = escape.into_iter().next().unwrap();
            let escape_end = escape_info.profile.end_position();
            let escape_end_speed = escape_info
                .profile
                .speed_for_time(escape_info.profile.time());

            let mut continuation = TrajectoryInput {
                s0: input.s0 + escape_end,
                v0: escape_end_speed,
                distance: input.s1 - (input.s0 + escape_end),
                ..*input
            };
            let mut result = vec![escape_info];
            result.extend(self.plan_from_free_start(&mut continuation, &world));
            return result;
        }

        self.plan_from_free_start(input, &world)
    }

    fn plan_from_free_start(
        &mut self,
        input: &mut TrajectoryInput,
        world: &PlanningWorld,
    ) -> Vec<TrajectoryGenerationInfo> {
        // end point inside an obstacle: try to project it out
        if world.is_in_static_obstacle(input.s1) {
            for obstacle in &world.obstacles {
                let dist = obstacle.distance(input.s1);
                if dist > -PROJECT_OUT_DEPTH && dist < 0.0 {
                    input.s1 = obstacle.project_out(input.s1, 0.03);
                }
            }
            input.distance = input.s1 - input.s0;
            // may have been moved into another obstacle
            if world.is_in_static_obstacle(input.s1) {
                if let Some(result) = self.end_in_obstacle_sampler.compute(input, world) {
                    return result;
                }
                if let Some(result) = self.escape_obstacle_sampler.compute(input, world) {
                    return result;
                }
                return vec![];
            }
        }

        // direct trajectory
        let direct_slow_down_time = input.slow_down_time();
        let use_high_precision = input.distance.norm() < 0.1
            && input.v1 == Vector::zeros()
            && input.v0.norm() < 0.2;
        let direct = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            input.v0,
            input.v1,
            input.distance,
            input.acceleration,
            input.max_speed,
            direct_slow_down_time,
            use_high_precision,
        );

        let mut direct_score = None;
        if let Some(direct) = &direct {
            let (distance, last_part_distance) =
                world.min_obstacle_distance(direct, 0.0, direct_slow_down_time, input.s0);
            if distance > OBSTACLE_AVOIDANCE_RADIUS
                || (last_part_distance > 0.0 && last_part_distance < OBSTACLE_AVOIDANCE_RADIUS)
            {
                return vec![TrajectoryGenerationInfo {
                    profile: direct.clone(),
                    slow_down_time: direct_slow_down_time,
                    desired_distance: Some(input.distance),
                }];
            }
            direct_score =
                StandardSampler::score(direct, direct_slow_down_time, world, input.s0);
        }

        if let Some(result) = self.standard_sampler.compute(input, world) {
            return result;
        }
        // the scored direct trajectory beats the remaining fallbacks
        if direct_score.is_some() {
            return vec![TrajectoryGenerationInfo {
                profile: direct.unwrap(),
                slow_down_time: direct_slow_down_time,
                desired_distance: Some(input.distance),
            }];
        }
        if let Some(result) = self.end_in_obstacle_sampler.compute(input, world) {
            return result;
        }
        if let Some(result) = self.escape_obstacle_sampler.compute(input, world) {
            return result;
        }
        vec![]
    }

    /// Samples the planned parts into a time-parameterized point list.
    fn result_path(
        &self,
        input: &TrajectoryInput,
        generation_info: &[TrajectoryGenerationInfo],
    ) -> Vec<TrajectoryPoint> {
        if generation_info.is_empty() {
            // resting fallback: stay where we are
            return vec![
                TrajectoryPoint {
                    pos: input.s0,
                    speed: input.v0,
                    time: 0.0,
                },
                TrajectoryPoint {
                    pos: input.s0,
                    speed: Vector::zeros(),
                    time: f32::MAX,
                },
            ];
        }

        let mut to_end_time = 0.0;
        for info in generation_info {
            let total_time = if info.slow_down_time == 0.0 {
                info.profile.time()
            } else {
                info.profile.time_with_slow_down(info.slow_down_time)
            };
            to_end_time += total_time;
        }

        let mut result = Vec::new();
        let mut start_pos = input.s0;
        let mut current_time = 0.0;
        let mut current_total_time = 0.0;
        let sampling_interval =
            (to_end_time / (SAMPLES_PER_TRAJECTORY * generation_info.len()) as f32).max(1e-4);

        for (index, info) in generation_info.iter().enumerate() {
            let trajectory = &info.profile;
            let part_time = if info.slow_down_time == 0.0 {
                trajectory.time()
            } else {
                trajectory.time_with_slow_down(info.slow_down_time)
            };

            if part_time > 20.0 || part_time.is_infinite() || part_time.is_nan() || part_time < 0.0
            {
                tracing::debug!(part_time, "trying to use an invalid trajectory");
                return result;
            }

            // trajectory positions are not exact; spread the residual over
            // the samples so the path ends exactly on target
            let end_pos = if info.slow_down_time == 0.0 {
                trajectory.position_for_time(part_time)
            } else {
                trajectory.calculate_slow_down_pos(info.slow_down_time)
            };
            let correction_offset = match info.desired_distance {
                Some(desired) => desired - end_pos,
                None => Vector::zeros(),
            };

            let mut was_at_end_point = false;
            loop {
                if current_time > part_time {
                    if index < generation_info.len() - 1 {
                        current_time -= part_time;
                        break;
                    }
                    if was_at_end_point {
                        break;
                    }
                    was_at_end_point = true;
                }
                let sample_time = current_time.min(part_time);
                let (position, speed) = if info.slow_down_time == 0.0 {
                    (
                        trajectory.position_for_time(sample_time),
                        trajectory.speed_for_time(sample_time),
                    )
                } else {
                    (
                        trajectory.position_for_time_slow_down(sample_time, info.slow_down_time),
                        trajectory.speed_for_time_slow_down(sample_time, info.slow_down_time),
                    )
                };
                result.push(TrajectoryPoint {
                    pos: start_pos + position + correction_offset * (sample_time / part_time),
                    speed,
                    time: current_total_time,
                });

                current_time += sampling_interval;
                current_total_time += sampling_interval;
            }
            start_pos += end_pos + correction_offset;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> TrajectoryPath {
        let mut path = TrajectoryPath::new(42);
        path.set_radius(0.09);
        path
    }

    #[test]
    fn direct_trajectory_in_the_open() {
        let mut path = planner();
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(1.0, 0.0),
            Vector::zeros(),
            2.0,
            3.0,
        );
        assert!(points.len() > 10);
        assert_eq!(points[0].time, 0.0);
        assert!((points[0].pos - Vector::zeros()).norm() < 1e-4);

        // strictly increasing times
        for pair in points.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
        // stays on the x axis and ends on target
        for point in &points {
            assert!(point.pos.y.abs() < 0.01, "off axis: {:?}", point.pos);
        }
        let last = points.last().unwrap();
        assert!((last.pos - Vector::new(1.0, 0.0)).norm() < 0.02, "end {:?}", last.pos);
    }

    #[test]
    fn planned_path_avoids_a_static_obstacle() {
        let mut path = planner();
        path.add_obstacle(Obstacle::Circle {
            center: Vector::new(1.0, 0.0),
            radius: 0.2,
            prio: 1,
            name: "opponent",
        });
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(2.0, 0.0),
            Vector::zeros(),
            2.0,
            3.0,
        );
        assert!(points.len() > 2);
        // inflated radius: 0.2 + 0.09
        for point in &points {
            let dist = (point.pos - Vector::new(1.0, 0.0)).norm();
            assert!(dist > 0.29 - 0.02, "sample inside the obstacle: {:?}", point.pos);
        }
    }

    #[test]
    fn target_inside_shallow_obstacle_is_projected_out() {
        let mut path = planner();
        path.add_obstacle(Obstacle::Circle {
            center: Vector::new(1.0, 0.0),
            radius: 0.15,
            prio: 1,
            name: "opponent",
        });
        // target 5 cm inside the inflated obstacle
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(1.0, 0.2),
            Vector::zeros(),
            2.0,
            3.0,
        );
        let last = points.last().unwrap();
        assert!(
            (last.pos - Vector::new(1.0, 0.0)).norm() > 0.23,
            "end still inside: {:?}",
            last.pos
        );
    }

    #[test]
    fn start_inside_obstacle_escapes_first() {
        let mut path = planner();
        path.add_obstacle(Obstacle::Circle {
            center: Vector::zeros(),
            radius: 0.3,
            prio: 1,
            name: "trap",
        });
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(2.0, 0.0),
            Vector::zeros(),
            2.0,
            3.0,
        );
        assert!(points.len() > 2);
        let last = points.last().unwrap();
        // ends free of the trap, and ideally on target
        assert!((last.pos - Vector::zeros()).norm() > 0.39 - 0.02);
    }

    #[test]
    fn impossible_input_returns_the_resting_fallback() {
        let mut path = planner();
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(1.0, 0.0),
            Vector::zeros(),
            0.001,
            0.001,
        );
        assert!(points.is_empty());
    }

    #[test]
    fn moving_obstacle_is_respected() {
        let mut path = planner();
        // crosses our straight-line path around the time we would be there
        path.add_moving_obstacle(MovingObstacle {
            start_pos: Vector::new(1.0, -1.0),
            speed: Vector::new(0.0, 1.2),
            radius: 0.15,
            prio: 1,
        });
        let points = path.calculate_trajectory(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(2.0, 0.0),
            Vector::zeros(),
            2.0,
            3.0,
        );
        assert!(points.len() > 2);
        for point in &points {
            let obstacle_pos = Vector::new(1.0, -1.0) + Vector::new(0.0, 1.2) * point.time;
            let dist = (point.pos - obstacle_pos).norm();
            assert!(dist > 0.02, "collides with moving obstacle at t={}", point.time);
        }
    }
}
