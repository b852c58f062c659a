//! Randomized trajectory samplers, tried when the direct solution
//! collides: standard (around the direct solution), end-in-obstacle
//! (target unreachable) and escape-obstacle (start unreachable).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alpha_time::AlphaTimeTrajectory;
use crate::obstacles::{MovingObstacle, Obstacle};
use crate::profile::SpeedProfile;
use crate::{Vector, SLOW_DOWN_TIME};

/// Clearance the planner aims to keep from every obstacle.
pub const OBSTACLE_AVOIDANCE_RADIUS: f32 = 0.1;

/// Time step for obstacle sweeps along candidate trajectories.
const COLLISION_CHECK_INTERVAL: f32 = 0.025;

/// Everything the samplers know about the world.
#[derive(Debug, Clone, Default)]
pub struct PlanningWorld {
    pub obstacles: Vec<Obstacle>,
    pub moving_obstacles: Vec<MovingObstacle>,
    pub radius: f32,
}

impl PlanningWorld {
    /// Inflates every static obstacle by the robot radius; called once per
    /// planning request.
    pub fn inflate_by_radius(&mut self) {
        for obstacle in &mut self.obstacles {
            obstacle.inflate(self.radius);
        }
        for moving in &mut self.moving_obstacles {
            moving.radius += self.radius;
        }
    }

    pub fn is_in_static_obstacle(&self, pos: Vector) -> bool {
        self.obstacles.iter().any(|obstacle| obstacle.is_inside(pos))
    }

    pub fn is_in_moving_obstacle(&self, pos: Vector, time: f32) -> bool {
        self.moving_obstacles
            .iter()
            .any(|moving| moving.is_inside(pos, time))
    }

    pub fn static_obstacle_distance(&self, pos: Vector) -> f32 {
        self.obstacles
            .iter()
            .map(|obstacle| obstacle.distance(pos))
            .fold(f32::MAX, f32::min)
    }

    pub fn obstacle_distance(&self, pos: Vector, time: f32) -> f32 {
        let moving = self
            .moving_obstacles
            .iter()
            .map(|obstacle| obstacle.distance(pos, time))
            .fold(f32::MAX, f32::min);
        self.static_obstacle_distance(pos).min(moving)
    }

    /// Sweeps a trajectory and returns (overall minimum distance, minimum
    /// distance over the final 0.2 seconds). The second value lets the
    /// planner accept trajectories that only get close to an obstacle right
    /// at a target that sits next to one.
    pub fn min_obstacle_distance(
        &self,
        profile: &SpeedProfile,
        time_offset: f32,
        slow_down_time: f32,
        start_pos: Vector,
    ) -> (f32, f32) {
        let total_time = if slow_down_time == 0.0 {
            profile.time()
        } else {
            profile.time_with_slow_down(slow_down_time)
        };
        let mut min_distance = f32::MAX;
        let mut last_part_distance = f32::MAX;

        let mut time = 0.0;
        while time <= total_time {
            let pos = if slow_down_time == 0.0 {
                profile.position_for_time(time)
            } else {
                profile.position_for_time_slow_down(time, slow_down_time)
            };
            let distance = self.obstacle_distance(start_pos + pos, time + time_offset);
            min_distance = min_distance.min(distance);
            if time >= total_time - 0.2 {
                last_part_distance = last_part_distance.min(distance);
            }
            time += COLLISION_CHECK_INTERVAL;
        }
        (min_distance, last_part_distance)
    }
}

/// Planning request shared by the samplers.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryInput {
    pub s0: Vector,
    pub s1: Vector,
    pub v0: Vector,
    pub v1: Vector,
    pub distance: Vector,
    pub max_speed: f32,
    pub acceleration: f32,
    pub exponential_slow_down: bool,
}

impl TrajectoryInput {
    pub fn slow_down_time(&self) -> f32 {
        if self.exponential_slow_down {
            SLOW_DOWN_TIME
        } else {
            0.0
        }
    }
}

/// One piece of a planned path.
#[derive(Debug, Clone)]
pub struct TrajectoryGenerationInfo {
    pub profile: SpeedProfile,
    pub slow_down_time: f32,
    /// Correction offsets may only be applied when the profile was built
    /// toward this exact target distance.
    pub desired_distance: Option<Vector>,
}

/// Two-segment trajectory parameters: the robot accelerates to a sampled
/// intermediate speed, then from there to the requested end speed. The
/// intermediate speed is what lets paths curve around obstacles.
#[derive(Debug, Clone, Copy)]
struct StandardSample {
    mid_speed: Vector,
    time1: f32,
    time2: f32,
    alpha1: f32,
    alpha2: f32,
}

/// Randomized exploration of two-segment trajectories, re-centered on the
/// best candidate found so far.
pub struct StandardSampler {
    rng: StdRng,
    iterations: usize,
}

impl StandardSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            iterations: 160,
        }
    }

    fn random_sample(&mut self, input: &TrajectoryInput, rough_time: f32) -> StandardSample {
        let speed = self.rng.gen_range(0.0..input.max_speed);
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        StandardSample {
            mid_speed: Vector::new(angle.cos(), angle.sin()) * speed,
            time1: self.rng.gen_range(0.1..1.5) * rough_time,
            time2: self.rng.gen_range(0.1..1.5) * rough_time,
            alpha1: self.rng.gen_range(0.0001..std::f32::consts::FRAC_PI_2 - 0.0001),
            alpha2: self.rng.gen_range(0.0001..std::f32::consts::FRAC_PI_2 - 0.0001),
        }
    }

    fn perturbed_sample(
        &mut self,
        center: &StandardSample,
        input: &TrajectoryInput,
        rough_time: f32,
        spread: f32,
    ) -> StandardSample {
        let mut mid_speed = center.mid_speed
            + Vector::new(
                self.rng.gen_range(-1.0..1.0f32),
                self.rng.gen_range(-1.0..1.0f32),
            ) * (0.4 * spread * input.max_speed);
        if mid_speed.norm() > input.max_speed {
            mid_speed = mid_speed.normalize() * input.max_speed;
        }
        let wiggle = 0.4 * spread * rough_time;
        StandardSample {
            mid_speed,
            time1: (center.time1 + self.rng.gen_range(-wiggle..wiggle)).max(0.02),
            time2: (center.time2 + self.rng.gen_range(-wiggle..wiggle)).max(0.02),
            alpha1: (center.alpha1 + self.rng.gen_range(-0.5 * spread..0.5 * spread))
                .clamp(0.0001, std::f32::consts::FRAC_PI_2 - 0.0001),
            alpha2: (center.alpha2 + self.rng.gen_range(-0.5 * spread..0.5 * spread))
                .clamp(0.0001, std::f32::consts::FRAC_PI_2 - 0.0001),
        }
    }

    fn evaluate(
        sample: &StandardSample,
        input: &TrajectoryInput,
        slow_down_time: f32,
    ) -> Option<(SpeedProfile, SpeedProfile, Vector, f32)> {
        let part1 = AlphaTimeTrajectory::calculate_trajectory_exact_end_speed(
            input.v0,
            sample.mid_speed,
            sample.time1,
            sample.alpha1,
            input.distance,
            input.acceleration,
            input.max_speed,
            0.0,
        )?;
        let end1 = part1.end_position();
        let part2 = AlphaTimeTrajectory::calculate_trajectory_exact_end_speed(
            sample.mid_speed,
            input.v1,
            sample.time2,
            sample.alpha2,
            input.distance - end1,
            input.acceleration,
            input.max_speed,
            slow_down_time,
        )?;
        let end2 = if slow_down_time == 0.0 {
            part2.end_position()
        } else {
            part2.calculate_slow_down_pos(slow_down_time)
        };
        let error = (end1 + end2 - input.distance).norm();
        Some((part1, part2, end1, error))
    }

    /// Best collision-free trajectory toward the target, judged by end
    /// time; `None` when no sample survives.
    pub fn compute(
        &mut self,
        input: &TrajectoryInput,
        world: &PlanningWorld,
    ) -> Option<Vec<TrajectoryGenerationInfo>> {
        let slow_down_time = input.slow_down_time();
        let distance_norm = input.distance.norm();
        let rough_time = (distance_norm / input.max_speed.max(0.01)
            + input.max_speed / input.acceleration)
            .max(0.1);

        let direction = if distance_norm > 1e-4 {
            input.distance / distance_norm
        } else {
            Vector::new(1.0, 0.0)
        };
        let initial_alpha = input
            .distance
            .x
            .abs()
            .max(1e-4)
            .atan2(input.distance.y.abs().max(1e-4))
            .clamp(0.0001, std::f32::consts::FRAC_PI_2 - 0.0001);
        let mut center = StandardSample {
            mid_speed: direction * (input.max_speed * 0.7),
            time1: rough_time * 0.5,
            time2: rough_time * 0.5,
            alpha1: initial_alpha,
            alpha2: initial_alpha,
        };
        let mut center_error = f32::MAX;

        let mut best: Option<(f32, Vec<TrajectoryGenerationInfo>)> = None;
        let mut spread = 1.0f32;
        for iteration in 0..self.iterations {
            let sample = if iteration % 4 == 0 {
                self.random_sample(input, rough_time)
            } else {
                self.perturbed_sample(&center, input, rough_time, spread)
            };
            spread *= 0.985;

            let Some((part1, part2, end1, error)) = Self::evaluate(&sample, input, slow_down_time)
            else {
                continue;
            };
            if error < center_error {
                center = sample;
                center_error = error;
            }
            // the result path blends away small target misses; large ones
            // would distort the checked trajectory
            if error > 0.1 {
                continue;
            }

            let (distance1, _) = world.min_obstacle_distance(&part1, 0.0, 0.0, input.s0);
            if distance1 <= 0.0 {
                continue;
            }
            let time1 = part1.time();
            let (distance2, _) =
                world.min_obstacle_distance(&part2, time1, slow_down_time, input.s0 + end1);
            if distance2 <= 0.0 {
                continue;
            }
            let min_distance = distance1.min(distance2);

            let total_time = time1
                + if slow_down_time == 0.0 {
                    part2.time()
                } else {
                    part2.time_with_slow_down(slow_down_time)
                };
            // trade time against clearance below the avoidance radius
            let score = total_time + (OBSTACLE_AVOIDANCE_RADIUS - min_distance).max(0.0) * 10.0;

            if best.as_ref().map_or(true, |(s, _)| score < *s) {
                best = Some((
                    score,
                    vec![
                        TrajectoryGenerationInfo {
                            profile: part1,
                            slow_down_time: 0.0,
                            desired_distance: None,
                        },
                        TrajectoryGenerationInfo {
                            profile: part2,
                            slow_down_time,
                            desired_distance: Some(input.distance - end1),
                        },
                    ],
                ));
            }
        }
        best.map(|(_, infos)| infos)
    }

    /// Scores an externally generated trajectory by the same rule. Used to
    /// compare the direct solution against sampled ones.
    pub fn score(
        profile: &SpeedProfile,
        slow_down_time: f32,
        world: &PlanningWorld,
        start_pos: Vector,
    ) -> Option<f32> {
        let (min_distance, _) = world.min_obstacle_distance(profile, 0.0, slow_down_time, start_pos);
        if min_distance <= 0.0 {
            return None;
        }
        let total_time = if slow_down_time == 0.0 {
            profile.time()
        } else {
            profile.time_with_slow_down(slow_down_time)
        };
        Some(total_time + (OBSTACLE_AVOIDANCE_RADIUS - min_distance).max(0.0) * 10.0)
    }
}

/// Finds a reachable stopping point close to a target that sits inside an
/// obstacle.
pub struct EndInObstacleSampler {
    rng: StdRng,
    iterations: usize,
}

impl EndInObstacleSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            iterations: 40,
        }
    }

    pub fn compute(
        &mut self,
        input: &TrajectoryInput,
        world: &PlanningWorld,
    ) -> Option<Vec<TrajectoryGenerationInfo>> {
        let mut best: Option<(f32, Vector)> = None;
        for iteration in 0..self.iterations {
            // sampling radius grows as long as nothing was found
            let spread = 0.1 + 0.1 * iteration as f32 * if best.is_none() { 1.0 } else { 0.2 };
            let offset = Vector::new(
                self.rng.gen_range(-spread..spread),
                self.rng.gen_range(-spread..spread),
            );
            let candidate = input.s1 + offset;
            if world.is_in_static_obstacle(candidate) {
                continue;
            }
            let target_dist = (candidate - input.s1).norm();
            if best.as_ref().map_or(true, |(d, _)| target_dist < *d) {
                best = Some((target_dist, candidate));
            }
        }

        let (_, end_point) = best?;
        let distance = end_point - input.s0;
        let profile = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            input.v0,
            Vector::zeros(),
            distance,
            input.acceleration,
            input.max_speed,
            input.slow_down_time(),
            false,
        )?;
        let (min_distance, _) =
            world.min_obstacle_distance(&profile, 0.0, input.slow_down_time(), input.s0);
        if min_distance <= 0.0 {
            return None;
        }
        Some(vec![TrajectoryGenerationInfo {
            profile,
            slow_down_time: input.slow_down_time(),
            desired_distance: Some(distance),
        }])
    }
}

/// Short escape trajectories out of an obstacle the robot is already
/// inside. Minimizes the highest obstacle priority crossed, then the time
/// spent inside obstacles.
pub struct EscapeObstacleSampler {
    rng: StdRng,
    iterations: usize,
    pub max_intersecting_obstacle_prio: i32,
}

impl EscapeObstacleSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            iterations: 60,
            max_intersecting_obstacle_prio: -1,
        }
    }

    fn intersecting_prio(world: &PlanningWorld, pos: Vector, time: f32) -> Option<i32> {
        let mut prio = None;
        for obstacle in &world.obstacles {
            if obstacle.is_inside(pos) {
                prio = Some(prio.map_or(obstacle.prio(), |p: i32| p.max(obstacle.prio())));
            }
        }
        for moving in &world.moving_obstacles {
            if moving.is_inside(pos, time) {
                prio = Some(prio.map_or(moving.prio, |p: i32| p.max(moving.prio)));
            }
        }
        prio
    }

    pub fn compute(
        &mut self,
        input: &TrajectoryInput,
        world: &PlanningWorld,
    ) -> Option<Vec<TrajectoryGenerationInfo>> {
        // (max prio crossed, time to leave, total time)
        let mut best: Option<(i32, f32, SpeedProfile)> = None;
        for _ in 0..self.iterations {
            let time: f32 = self.rng.gen_range(0.05..1.0);
            let alpha = self
                .rng
                .gen_range(0.0001..std::f32::consts::FRAC_PI_2 - 0.0001);
            let direction = Vector::new(
                self.rng.gen_range(-1.0..1.0f32),
                self.rng.gen_range(-1.0..1.0f32),
            );

            let profile = AlphaTimeTrajectory::calculate_trajectory_fast_end_speed(
                input.v0,
                Vector::zeros(),
                time,
                alpha,
                direction,
                input.acceleration,
                input.max_speed,
                0.0,
            );

            // sweep: find when the candidate leaves all obstacles and the
            // highest priority it crosses
            let total_time = profile.time();
            let mut max_prio = -1;
            let mut escape_time = None;
            let mut t = 0.0;
            while t <= total_time {
                let pos = input.s0 + profile.position_for_time(t);
                match Self::intersecting_prio(world, pos, t) {
                    Some(prio) => {
                        max_prio = max_prio.max(prio);
                        escape_time = None;
                    }
                    None => {
                        if escape_time.is_none() {
                            escape_time = Some(t);
                        }
                    }
                }
                t += COLLISION_CHECK_INTERVAL;
            }
            let Some(escape_time) = escape_time else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((prio, escape, _)) => {
                    max_prio < *prio || (max_prio == *prio && escape_time < *escape)
                }
            };
            if better {
                best = Some((max_prio, escape_time, profile));
            }
        }

        let (max_prio, _, profile) = best?;
        self.max_intersecting_obstacle_prio = max_prio;
        Some(vec![TrajectoryGenerationInfo {
            profile,
            slow_down_time: 0.0,
            desired_distance: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_world() -> PlanningWorld {
        PlanningWorld::default()
    }

    fn input_to(target: Vector) -> TrajectoryInput {
        TrajectoryInput {
            s0: Vector::zeros(),
            s1: target,
            v0: Vector::zeros(),
            v1: Vector::zeros(),
            distance: target,
            max_speed: 2.0,
            acceleration: 2.0,
            exponential_slow_down: false,
        }
    }

    fn combined_end(result: &[TrajectoryGenerationInfo]) -> Vector {
        result.iter().fold(Vector::zeros(), |acc, info| {
            acc + if info.slow_down_time == 0.0 {
                info.profile.end_position()
            } else {
                info.profile.calculate_slow_down_pos(info.slow_down_time)
            }
        })
    }

    #[test]
    fn standard_sampler_finds_a_path_in_the_open() {
        let mut sampler = StandardSampler::new(7);
        let result = sampler
            .compute(&input_to(Vector::new(1.0, 0.5)), &free_world())
            .expect("no trajectory in an empty world");
        let end = combined_end(&result);
        assert!((end - Vector::new(1.0, 0.5)).norm() < 0.15, "end {end:?}");
    }

    #[test]
    fn standard_sampler_avoids_a_blocking_circle() {
        let mut world = free_world();
        world.obstacles.push(Obstacle::Circle {
            center: Vector::new(0.5, 0.0),
            radius: 0.2,
            prio: 1,
            name: "robot",
        });
        let mut sampler = StandardSampler::new(7);
        let input = input_to(Vector::new(1.0, 0.0));
        let result = sampler
            .compute(&input, &world)
            .expect("no way around the obstacle");
        let mut start = input.s0;
        let mut time_offset = 0.0;
        for info in &result {
            let (min_dist, _) =
                world.min_obstacle_distance(&info.profile, time_offset, info.slow_down_time, start);
            assert!(min_dist > 0.0, "sampled trajectory crosses the obstacle");
            start += info.profile.end_position();
            time_offset += info.profile.time();
        }
    }

    #[test]
    fn end_in_obstacle_sampler_stops_outside() {
        let mut world = free_world();
        world.obstacles.push(Obstacle::Circle {
            center: Vector::new(1.0, 0.0),
            radius: 0.3,
            prio: 1,
            name: "defense",
        });
        let mut sampler = EndInObstacleSampler::new(3);
        let input = input_to(Vector::new(1.0, 0.0));
        let result = sampler.compute(&input, &world).expect("no stopping point");
        let end = input.s0 + result[0].profile.end_position();
        assert!(!world.is_in_static_obstacle(end), "still ends inside: {end:?}");
        // close to the desired target
        assert!((end - input.s1).norm() < 0.6);
    }

    #[test]
    fn escape_sampler_leaves_the_obstacle() {
        let mut world = free_world();
        world.obstacles.push(Obstacle::Circle {
            center: Vector::zeros(),
            radius: 0.3,
            prio: 2,
            name: "trap",
        });
        let mut sampler = EscapeObstacleSampler::new(11);
        let input = input_to(Vector::new(2.0, 0.0));
        let result = sampler.compute(&input, &world).expect("no escape found");
        let profile = &result[0].profile;
        let end = input.s0 + profile.position_for_time(profile.time());
        assert!(!world.is_in_static_obstacle(end), "escape ends inside: {end:?}");
        assert_eq!(sampler.max_intersecting_obstacle_prio, 2);
    }

    #[test]
    fn min_obstacle_distance_flags_collisions() {
        let mut world = free_world();
        world.obstacles.push(Obstacle::Circle {
            center: Vector::new(0.5, 0.0),
            radius: 0.2,
            prio: 1,
            name: "robot",
        });
        // straight line through the obstacle
        let profile = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(1.0, 0.0),
            2.0,
            2.0,
            0.0,
            false,
        )
        .unwrap();
        let (min_dist, _) = world.min_obstacle_distance(&profile, 0.0, 0.0, Vector::zeros());
        assert!(min_dist < 0.0);
    }
}
