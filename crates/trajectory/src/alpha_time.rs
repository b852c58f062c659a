//! Closed-form 2-D trajectory generation.
//!
//! A trajectory is parameterized by its total time and an angle alpha that
//! splits the acceleration and speed budget between the axes
//! (`sin(alpha)` for x, `cos(alpha)` for y). The direct generator searches
//! (time, alpha) until the profile's end offset matches the requested
//! distance; the samplers explore the same parameter space randomly.

use crate::profile::{SpeedProfile, SpeedProfile1D};
use crate::Vector;

/// Alpha is kept away from the axes so neither per-axis acceleration
/// degenerates to zero.
const ALPHA_EPSILON: f32 = 1e-4;

const MAX_SEARCH_ITERATIONS: usize = 60;

pub struct AlphaTimeTrajectory;

impl AlphaTimeTrajectory {
    /// Shortest total time for which an exact-end-speed profile exists.
    pub fn minimum_time_exact_end_speed(v0: Vector, v1: Vector, acc: f32, alpha: f32) -> f32 {
        let alpha = alpha.clamp(ALPHA_EPSILON, std::f32::consts::FRAC_PI_2 - ALPHA_EPSILON);
        let acc_x = acc * alpha.sin();
        let acc_y = acc * alpha.cos();
        ((v1.x - v0.x).abs() / acc_x).max((v1.y - v0.y).abs() / acc_y)
    }

    /// Profile reaching `v1` approximately, adjusting the end speed when it
    /// is unreachable within `time`. The per-axis direction follows the
    /// sign of `distance`.
    pub fn calculate_trajectory_fast_end_speed(
        v0: Vector,
        v1: Vector,
        time: f32,
        alpha: f32,
        distance: Vector,
        acc: f32,
        v_max: f32,
        slow_down_time: f32,
    ) -> SpeedProfile {
        let alpha = alpha.clamp(ALPHA_EPSILON, std::f32::consts::FRAC_PI_2 - ALPHA_EPSILON);
        let (acc_x, acc_y) = (acc * alpha.sin(), acc * alpha.cos());
        let (v_max_x, v_max_y) = (v_max * alpha.sin(), v_max * alpha.cos());

        let mut x = SpeedProfile1D::default();
        x.calculate_1d_trajectory_fast_end_speed(v0.x, v1.x, time, distance.x >= 0.0, acc_x, v_max_x);
        x.integrate_time();
        let mut y = SpeedProfile1D::default();
        y.calculate_1d_trajectory_fast_end_speed(v0.y, v1.y, time, distance.y >= 0.0, acc_y, v_max_y);
        y.integrate_time();

        SpeedProfile::new(x, y, slow_down_time)
    }

    /// Profile hitting `v1` exactly; `None` when `time` is below the
    /// per-axis ramp minimum.
    pub fn calculate_trajectory_exact_end_speed(
        v0: Vector,
        v1: Vector,
        time: f32,
        alpha: f32,
        distance: Vector,
        acc: f32,
        v_max: f32,
        slow_down_time: f32,
    ) -> Option<SpeedProfile> {
        let alpha = alpha.clamp(ALPHA_EPSILON, std::f32::consts::FRAC_PI_2 - ALPHA_EPSILON);
        let (acc_x, acc_y) = (acc * alpha.sin(), acc * alpha.cos());
        let (v_max_x, v_max_y) = (v_max * alpha.sin(), v_max * alpha.cos());

        let ramp_x = (v1.x - v0.x).abs() / acc_x;
        let ramp_y = (v1.y - v0.y).abs() / acc_y;
        if time < ramp_x.max(ramp_y) {
            return None;
        }

        let rest_x = (time - ramp_x) * if distance.x >= 0.0 { 1.0 } else { -1.0 };
        let rest_y = (time - ramp_y) * if distance.y >= 0.0 { 1.0 } else { -1.0 };

        let mut x = SpeedProfile1D::default();
        x.calculate_1d_trajectory(v0.x, v1.x, rest_x, acc_x, v_max_x);
        x.integrate_time();
        let mut y = SpeedProfile1D::default();
        y.calculate_1d_trajectory(v0.y, v1.y, rest_y, acc_y, v_max_y);
        y.integrate_time();

        Some(SpeedProfile::new(x, y, slow_down_time))
    }

    fn end_position(profile: &SpeedProfile, slow_down_time: f32) -> Vector {
        if slow_down_time == 0.0 {
            profile.end_position()
        } else {
            profile.calculate_slow_down_pos(slow_down_time)
        }
    }

    /// Direct generator: damped fixed-point iteration on (time, alpha)
    /// until the end offset of the fast-end-speed profile matches
    /// `distance`.
    pub fn find_trajectory_fast_end_speed(
        v0: Vector,
        v1: Vector,
        distance: Vector,
        acc: f32,
        v_max: f32,
        slow_down_time: f32,
        high_precision: bool,
    ) -> Option<SpeedProfile> {
        let tolerance = if high_precision { 0.0005 } else { 0.01 };

        let distance_norm = distance.norm();
        let mut alpha = distance.x.abs().atan2(distance.y.abs());
        // rough initial duration: accelerate to the cruise speed and keep it
        let cruise = v_max.min((distance_norm * acc).sqrt().max(0.01));
        let mut time = (distance_norm / cruise + cruise / acc).max(0.01);

        let mut best: Option<(f32, SpeedProfile)> = None;
        for _ in 0..MAX_SEARCH_ITERATIONS {
            let profile = Self::calculate_trajectory_fast_end_speed(
                v0,
                v1,
                time,
                alpha,
                distance,
                acc,
                v_max,
                slow_down_time,
            );
            let achieved = Self::end_position(&profile, slow_down_time);
            let error = distance - achieved;
            let error_norm = error.norm();

            if best.as_ref().map_or(true, |(e, _)| error_norm < *e) {
                best = Some((error_norm, profile));
            }
            if error_norm < tolerance {
                break;
            }

            // move alpha toward the split the residual demands
            let achieved_angle = achieved.x.abs().max(1e-6).atan2(achieved.y.abs().max(1e-6));
            let desired_angle = distance.x.abs().max(1e-6).atan2(distance.y.abs().max(1e-6));
            alpha += 0.7 * (desired_angle - achieved_angle);
            alpha = alpha.clamp(ALPHA_EPSILON, std::f32::consts::FRAC_PI_2 - ALPHA_EPSILON);

            // scale the duration by the remaining distance along the target
            // direction
            let achieved_norm = achieved.norm().max(1e-5);
            let ratio = (distance_norm.max(1e-5) / achieved_norm).sqrt();
            time *= ratio.clamp(0.5, 2.0);
            time = time.clamp(1e-3, 30.0);
        }

        let (error_norm, profile) = best?;
        // never hand out a grossly wrong direct solution; the samplers take
        // over from here
        if error_norm > 0.05 + 0.02 * distance_norm {
            return None;
        }
        Some(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_point_to_point_profile() {
        // 1 m along x from rest to rest, acc 3, v_max 2
        let profile = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            Vector::zeros(),
            Vector::zeros(),
            Vector::new(1.0, 0.0),
            3.0,
            2.0,
            0.0,
            false,
        )
        .expect("no direct trajectory found");

        let expected_time = 2.0 * (1.0f32 / 3.0).sqrt();
        assert!(
            (profile.time() - expected_time).abs() < 0.05,
            "time {} vs {}",
            profile.time(),
            expected_time
        );

        // peak speed at the middle is sqrt(acc * dist)
        let mid_speed = profile.speed_for_time(profile.time() / 2.0).norm();
        assert!((mid_speed - 3.0f32.sqrt()).abs() < 0.1, "mid speed {mid_speed}");

        // the path never leaves the x axis by more than a centimeter
        for i in 0..=40 {
            let t = profile.time() * i as f32 / 40.0;
            let pos = profile.position_for_time(t);
            assert!(pos.y.abs() < 0.01, "sample strayed off-axis: {pos:?}");
        }
        let end = profile.end_position();
        assert!((end.x - 1.0).abs() < 0.02);
    }

    #[test]
    fn diagonal_target_is_reached() {
        let target = Vector::new(1.5, -2.0);
        let profile = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            Vector::zeros(),
            Vector::zeros(),
            target,
            2.5,
            3.0,
            0.0,
            false,
        )
        .expect("no direct trajectory found");
        let end = profile.end_position();
        assert!((end - target).norm() < 0.05, "end {end:?}");
    }

    #[test]
    fn moving_start_is_handled() {
        let profile = AlphaTimeTrajectory::find_trajectory_fast_end_speed(
            Vector::new(1.0, 0.5),
            Vector::zeros(),
            Vector::new(2.0, 1.0),
            3.0,
            2.0,
            0.0,
            false,
        )
        .expect("no direct trajectory found");
        let end = profile.end_position();
        assert!((end - Vector::new(2.0, 1.0)).norm() < 0.08, "end {end:?}");
        assert!(profile.speed_for_time(profile.time()).norm() < 0.1);
    }

    #[test]
    fn exact_end_speed_requires_enough_time() {
        let v0 = Vector::new(0.0, 0.0);
        let v1 = Vector::new(1.0, 1.0);
        let alpha = std::f32::consts::FRAC_PI_4;
        let min_time =
            AlphaTimeTrajectory::minimum_time_exact_end_speed(v0, v1, 2.0, alpha);
        assert!(AlphaTimeTrajectory::calculate_trajectory_exact_end_speed(
            v0,
            v1,
            min_time * 0.5,
            alpha,
            Vector::new(1.0, 1.0),
            2.0,
            3.0,
            0.0,
        )
        .is_none());

        let profile = AlphaTimeTrajectory::calculate_trajectory_exact_end_speed(
            v0,
            v1,
            min_time * 2.0,
            alpha,
            Vector::new(1.0, 1.0),
            2.0,
            3.0,
            0.0,
        )
        .expect("profile with sufficient time");
        let end_speed = profile.speed_for_time(profile.time() + 1.0);
        assert!((end_speed - v1).norm() < 1e-3);
    }
}
