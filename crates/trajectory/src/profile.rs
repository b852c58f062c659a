//! Piecewise-linear velocity profiles over time.
//!
//! A 1-D profile has at most four breakpoints: the start speed, an optional
//! plateau at the speed limit, and the final ramp. Trajectories ending at
//! rest can additionally be evaluated with an exponential slow-down tail
//! that linearly ramps the acceleration down to
//! [`MIN_ACC_FACTOR`](crate::MIN_ACC_FACTOR) times the limit over the last
//! [`SLOW_DOWN_TIME`](crate::SLOW_DOWN_TIME) seconds.

use crate::{Vector, MIN_ACC_FACTOR, SLOW_DOWN_TIME};

fn sign(x: f32) -> f32 {
    if x < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Distance covered while changing speed from `v0` to `v1` at `acc`.
fn dist(v0: f32, v1: f32, acc: f32) -> f32 {
    let time = (v0 - v1).abs() / acc;
    0.5 * (v0 + v1) * time
}

fn constant_distance(v: f32, time: f32) -> f32 {
    v * time
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfilePart {
    pub v: f32,
    pub t: f32,
}

/// End position and top speed of a profile computed without materialising
/// its parts.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryPosInfo1D {
    pub end_pos: f32,
    pub increase_at_speed: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SpeedProfile1D {
    pub profile: [ProfilePart; 4],
    pub counter: usize,
    pub acc: f32,
}

/// Spends `time` of extra time accelerating toward `v_max` and back,
/// returning the distance and the top speed reached.
fn free_extra_time_distance(v: f32, time: f32, acc: f32, v_max: f32) -> (f32, f32) {
    let v_max = v_max * sign(time);
    let time = time.abs();
    let to_max_time = 2.0 * (v_max - v).abs() / acc;
    if to_max_time < time {
        (
            2.0 * dist(v, v_max, acc) + constant_distance(v_max, time - to_max_time),
            v_max,
        )
    } else {
        let v1 = if v > v_max { -1.0 } else { 1.0 } * acc * time / 2.0 + v;
        (2.0 * dist(v, v1, acc), v1)
    }
}

impl SpeedProfile1D {
    /// Total time of the profile without a slow-down tail.
    pub fn time(&self) -> f32 {
        self.profile[self.counter - 1].t
    }

    pub fn end_speed(&self) -> f32 {
        self.profile[self.counter - 1].v
    }

    /// End position given `v0`, `v1` and a signed amount of extra time to
    /// spend on the way (the sign picks the direction), without building
    /// the profile.
    pub fn calculate_end_pos_1d(v0: f32, v1: f32, hint_dist: f32, acc: f32, v_max: f32) -> TrajectoryPosInfo1D {
        if hint_dist == 0.0 {
            return TrajectoryPosInfo1D {
                end_pos: dist(v0, v1, acc),
                increase_at_speed: v0.max(v1),
            };
        }
        // case analysis on the hint sign and the speed order; when exactly
        // one speed is past the limit, the extra distance is spent on a
        // plateau at the limit
        let limit = if hint_dist < 0.0 { -v_max } else { v_max };
        let v0_beyond = if hint_dist < 0.0 { v0 < limit } else { v0 > limit };
        let v1_beyond = if hint_dist < 0.0 { v1 < limit } else { v1 > limit };

        if v0_beyond != v1_beyond {
            return TrajectoryPosInfo1D {
                end_pos: dist(v0, v1, acc) + constant_distance(limit, hint_dist.abs()),
                increase_at_speed: limit,
            };
        }

        let around_v0 = if (hint_dist < 0.0) == (v0 <= v1) {
            !v0_beyond
        } else {
            v1_beyond
        };
        let (extra, top) = if around_v0 {
            free_extra_time_distance(v0, hint_dist, acc, v_max)
        } else {
            free_extra_time_distance(v1, hint_dist, acc, v_max)
        };
        TrajectoryPosInfo1D {
            end_pos: extra + dist(v0, v1, acc),
            increase_at_speed: top,
        }
    }

    /// End position when the end speed may be adjusted to make the profile
    /// realizable within `time`.
    pub fn calculate_end_pos_1d_fast_speed(
        v0: f32,
        v1: f32,
        time: f32,
        direction_positive: bool,
        acc: f32,
        v_max: f32,
    ) -> TrajectoryPosInfo1D {
        let (extra_time, real_v1) = adjust_end_speed(v0, v1, time, direction_positive, acc);
        if extra_time == 0.0 {
            TrajectoryPosInfo1D {
                end_pos: (v0 + real_v1) * 0.5 * time,
                increase_at_speed: if direction_positive { v0.max(v1) } else { v0.min(v1) },
            }
        } else {
            Self::calculate_end_pos_1d(
                v0,
                real_v1,
                if direction_positive { extra_time } else { -extra_time },
                acc,
                v_max,
            )
        }
    }

    /// Builds the profile for `v0 -> v1` over exactly `time`, adjusting the
    /// end speed when it is not reachable in that time.
    pub fn calculate_1d_trajectory_fast_end_speed(
        &mut self,
        v0: f32,
        v1: f32,
        time: f32,
        direction_positive: bool,
        acc: f32,
        v_max: f32,
    ) {
        let (extra_time, real_v1) = adjust_end_speed(v0, v1, time, direction_positive, acc);
        if extra_time == 0.0 {
            self.acc = acc;
            self.profile[0] = ProfilePart { v: v0, t: 0.0 };
            self.profile[1] = ProfilePart {
                v: real_v1,
                t: (real_v1 - v0).abs() / acc,
            };
            self.counter = 2;
        } else {
            self.calculate_1d_trajectory(
                v0,
                real_v1,
                if direction_positive { extra_time } else { -extra_time },
                acc,
                v_max,
            );
        }
    }

    fn create_free_extra_time_segment(
        &mut self,
        before_speed: f32,
        v: f32,
        next_speed: f32,
        time: f32,
        acc: f32,
        v_max: f32,
    ) {
        let v_max = v_max * sign(time);
        let time = time.abs();
        let to_max_time = 2.0 * (v_max - v).abs() / acc;
        if to_max_time < time {
            self.profile[1] = ProfilePart {
                v: v_max,
                t: (v_max - before_speed).abs() / acc,
            };
            self.profile[2] = ProfilePart {
                v: v_max,
                t: time - to_max_time,
            };
            self.profile[3] = ProfilePart {
                v: next_speed,
                t: (v_max - next_speed).abs() / acc,
            };
            self.counter = 4;
        } else {
            let v1 = if v > v_max { -1.0 } else { 1.0 } * acc * time / 2.0 + v;
            self.profile[1] = ProfilePart {
                v: v1,
                t: (before_speed - v1).abs() / acc,
            };
            self.profile[2] = ProfilePart {
                v: next_speed,
                t: (next_speed - v1).abs() / acc,
            };
            self.counter = 3;
        }
    }

    /// Builds the profile for `v0 -> v1` with a signed amount of extra time
    /// to spend on the way. The part times are durations here;
    /// [`integrate_time`](Self::integrate_time) turns them absolute.
    pub fn calculate_1d_trajectory(&mut self, v0: f32, v1: f32, hint_dist: f32, acc: f32, v_max: f32) {
        self.acc = acc;
        self.profile[0] = ProfilePart { v: v0, t: 0.0 };

        if hint_dist == 0.0 {
            self.profile[1] = ProfilePart {
                v: v1,
                t: (v0 - v1).abs() / acc,
            };
            self.counter = 2;
            return;
        }

        let limit = if hint_dist < 0.0 { -v_max } else { v_max };
        let v0_beyond = if hint_dist < 0.0 { v0 < limit } else { v0 > limit };
        let v1_beyond = if hint_dist < 0.0 { v1 < limit } else { v1 > limit };

        if v0_beyond && !v1_beyond || (!v0_beyond && v1_beyond) {
            // plateau at the limit between the two ramps
            self.profile[1] = ProfilePart {
                v: limit,
                t: (v0 - limit).abs() / acc,
            };
            self.profile[2] = ProfilePart {
                v: limit,
                t: hint_dist.abs(),
            };
            self.profile[3] = ProfilePart {
                v: v1,
                t: (v1 - limit).abs() / acc,
            };
            self.counter = 4;
        } else if (hint_dist < 0.0) == (v0 <= v1) {
            if !v0_beyond {
                self.create_free_extra_time_segment(v0, v0, v1, hint_dist, acc, v_max);
            } else {
                self.create_free_extra_time_segment(v0, v1, v1, hint_dist, acc, v_max);
            }
        } else if !v1_beyond {
            self.create_free_extra_time_segment(v0, v1, v1, hint_dist, acc, v_max);
        } else {
            self.create_free_extra_time_segment(v0, v0, v1, hint_dist, acc, v_max);
        }
    }

    /// Turns per-part durations into absolute times starting at zero.
    pub fn integrate_time(&mut self) {
        let mut total_time = 0.0;
        for part in self.profile[..self.counter].iter_mut() {
            total_time += part.t;
            part.t = total_time;
        }
    }

    pub fn end_offset(&self) -> f32 {
        let mut offset = 0.0;
        for i in 0..self.counter - 1 {
            offset += (self.profile[i].v + self.profile[i + 1].v)
                * 0.5
                * (self.profile[i + 1].t - self.profile[i].t);
        }
        offset
    }

    /// End offset with the exponential slow-down tail applied to the last
    /// `slow_down_time` seconds.
    pub fn end_offset_slow_down(&self, slow_down_time: f32) -> f32 {
        let mut pos = 0.0;
        let slow_down_start_time = self.time() - slow_down_time;
        let end_time = self.time() + SLOW_DOWN_TIME - slow_down_time;
        for i in 0..self.counter - 1 {
            let (p0, p1) = (self.profile[i], self.profile[i + 1]);
            if p1.t < slow_down_start_time || p0.v == p1.v {
                pos += (p0.v + p1.v) * 0.5 * (p1.t - p0.t);
            } else {
                let (v0, t0) = if p0.t < slow_down_start_time {
                    let diff = if p1.t == p0.t {
                        1.0
                    } else {
                        (slow_down_start_time - p0.t) / (p1.t - p0.t)
                    };
                    let v0 = p0.v + diff * (p1.v - p0.v);
                    pos += (p0.v + v0) * 0.5 * (slow_down_start_time - p0.t);
                    (v0, slow_down_start_time)
                } else {
                    (p0.v, p0.t)
                };
                let a0 = self.acc
                    * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - t0) / SLOW_DOWN_TIME);
                let a1 = self.acc
                    * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - p1.t) / SLOW_DOWN_TIME);
                let average_acc = (a0 + a1) * 0.5;
                let t = (v0 - p1.v).abs() / average_acc;
                let d = t * v0
                    + 0.5 * t * t * sign(p1.v - v0) * a0
                    + (1.0 / 6.0) * t * t * sign(p1.v - v0) * (a1 - a0);
                pos += d;
            }
        }
        pos
    }

    /// Total duration with the slow-down tail applied.
    pub fn time_with_slow_down(&self, slow_down_time: f32) -> f32 {
        let mut time = 0.0;
        let slow_down_start_time = self.time() - slow_down_time;
        let end_time = self.time() + SLOW_DOWN_TIME - slow_down_time;
        for i in 0..self.counter - 1 {
            let (p0, p1) = (self.profile[i], self.profile[i + 1]);
            if p1.t < slow_down_start_time || p0.v == p1.v {
                time += p1.t - p0.t;
            } else {
                let (v0, t0) = if p0.t < slow_down_start_time {
                    let diff = if p1.t == p0.t {
                        1.0
                    } else {
                        (slow_down_start_time - p0.t) / (p1.t - p0.t)
                    };
                    time += slow_down_start_time - p0.t;
                    (p0.v + diff * (p1.v - p0.v), slow_down_start_time)
                } else {
                    (p0.v, p0.t)
                };
                let a0 = self.acc
                    * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - t0) / SLOW_DOWN_TIME);
                let a1 = self.acc
                    * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - p1.t) / SLOW_DOWN_TIME);
                let average_acc = (a0 + a1) * 0.5;
                time += (v0 - p1.v).abs() / average_acc.abs();
            }
        }
        time
    }

    /// (offset, speed) at `time` without a slow-down tail.
    pub fn offset_and_speed_for_time(&self, time: f32) -> (f32, f32) {
        let mut offset = 0.0;
        for i in 0..self.counter - 1 {
            let (p0, p1) = (self.profile[i], self.profile[i + 1]);
            if p1.t >= time {
                let diff = if p1.t == p0.t {
                    1.0
                } else {
                    (time - p0.t) / (p1.t - p0.t)
                };
                let speed = p0.v + diff * (p1.v - p0.v);
                let part_dist = (p0.v + speed) * 0.5 * (time - p0.t);
                return (offset + part_dist, speed);
            }
            offset += (p0.v + p1.v) * 0.5 * (p1.t - p0.t);
        }
        (offset, self.profile[self.counter - 1].v)
    }

    /// (offset, speed) at `time` with the slow-down tail applied.
    pub fn offset_and_speed_for_time_slow_down(&self, time: f32, slow_down_time: f32) -> (f32, f32) {
        let mut pos = 0.0;
        let slow_down_start_time = self.time() - slow_down_time;
        let mut v0 = self.profile[0].v;
        let mut t0 = slow_down_start_time;
        let mut index = self.counter - 1;
        for i in 0..self.counter - 1 {
            let (p0, p1) = (self.profile[i], self.profile[i + 1]);
            if p1.t >= time || p1.t >= slow_down_start_time {
                let td = time.min(slow_down_start_time);
                let diff = if p1.t == p0.t {
                    1.0
                } else {
                    (td - p0.t) / (p1.t - p0.t)
                };
                let speed = p0.v + diff * (p1.v - p0.v);
                let part_dist = (p0.v + speed) * 0.5 * (td - p0.t);
                if time < slow_down_start_time {
                    return (pos + part_dist, speed);
                }
                pos += part_dist;
                v0 = speed;
                index = i;
                break;
            }
            pos += (p0.v + p1.v) * 0.5 * (p1.t - p0.t);
        }

        let end_time = self.time() + SLOW_DOWN_TIME - slow_down_time;
        let mut total_time = t0;
        for i in index..self.counter - 1 {
            let p1 = self.profile[i + 1];
            let a0 = self.acc
                * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - t0) / SLOW_DOWN_TIME);
            let a1 = self.acc
                * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - p1.t) / SLOW_DOWN_TIME);
            let average_acc = (a0 + a1) * 0.5;
            let t = (v0 - p1.v).abs() / average_acc;

            if total_time + t < time {
                let d = t * v0
                    + 0.5 * t * t * sign(p1.v - v0) * a0
                    + (1.0 / 6.0) * t * t * sign(p1.v - v0) * (a1 - a0);
                pos += d;
                v0 = p1.v;
                t0 = p1.t;
                total_time += t;
            } else {
                let tm = time - total_time;
                let speed =
                    v0 + tm * sign(p1.v - v0) * a0 + 0.5 * tm * tm * sign(p1.v - v0) * (a1 - a0) / t;
                let d = tm * v0
                    + 0.5 * tm * tm * sign(p1.v - v0) * a0
                    + (1.0 / 6.0) * tm * tm * tm * sign(p1.v - v0) * (a1 - a0) / t;
                return (pos + d, speed);
            }
        }
        (pos, self.profile[self.counter - 1].v)
    }

    /// Writes evenly spaced positions into one component of `out_points`.
    pub fn trajectory_positions(
        &self,
        out_points: &mut [Vector],
        out_index: usize,
        time_interval: f32,
        position_offset: f32,
    ) {
        let desired_count = out_points.len();
        let mut segment = 0;
        let mut current_time = 0.0;
        let mut current_offset = position_offset;

        let mut i = 0;
        while i < desired_count {
            while self.profile[segment + 1].t < current_time {
                current_offset += (self.profile[segment].v + self.profile[segment + 1].v)
                    * 0.5
                    * (self.profile[segment + 1].t - self.profile[segment].t);
                segment += 1;

                if segment == self.counter - 1 {
                    // fill the remainder with the end position
                    while i < desired_count {
                        out_points[i][out_index] = current_offset;
                        i += 1;
                    }
                    return;
                }
            }

            let (p0, p1) = (self.profile[segment], self.profile[segment + 1]);
            let diff = if p1.t == p0.t {
                1.0
            } else {
                (current_time - p0.t) / (p1.t - p0.t)
            };
            let speed = p0.v + diff * (p1.v - p0.v);
            let part_dist = (p0.v + speed) * 0.5 * (current_time - p0.t);
            out_points[i][out_index] = current_offset + part_dist;

            current_time += time_interval;
            i += 1;
        }
    }

    /// (min, max) positions over the whole profile with the slow-down tail.
    pub fn calculate_range(&self, slow_down_time: f32) -> (f32, f32) {
        let mut min_pos = 0.0f32;
        let mut max_pos = 0.0f32;

        let mut pos = 0.0;
        let slow_down_start_time = self.time() - slow_down_time;
        let mut v0 = self.profile[0].v;
        let mut t0 = slow_down_start_time;
        let mut index = self.counter - 1;
        for i in 0..self.counter - 1 {
            let (p0, p1) = (self.profile[i], self.profile[i + 1]);
            if p1.t >= slow_down_start_time {
                let td = slow_down_start_time;
                let diff = if p1.t == p0.t {
                    1.0
                } else {
                    (td - p0.t) / (p1.t - p0.t)
                };
                let speed = p0.v + diff * (p1.v - p0.v);
                pos += (p0.v + speed) * 0.5 * (td - p0.t);
                min_pos = min_pos.min(pos);
                max_pos = max_pos.max(pos);
                v0 = speed;
                index = i;
                break;
            }
            if (p0.v > 0.0) != (p1.v > 0.0) {
                // the extremum sits at the zero crossing
                let proportion = p0.v.abs() / (p0.v.abs() + p1.v.abs());
                let t = (p1.t - p0.t) * proportion;
                let zero_pos = pos + p0.v * 0.5 * t;
                min_pos = min_pos.min(zero_pos);
                max_pos = max_pos.max(zero_pos);
            }
            pos += (p0.v + p1.v) * 0.5 * (p1.t - p0.t);
            min_pos = min_pos.min(pos);
            max_pos = max_pos.max(pos);
        }

        let end_time = self.time() + SLOW_DOWN_TIME - slow_down_time;
        for i in index..self.counter - 1 {
            let p1 = self.profile[i + 1];
            let a0 = self.acc
                * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - t0) / SLOW_DOWN_TIME);
            let a1 = self.acc
                * (MIN_ACC_FACTOR + (1.0 - MIN_ACC_FACTOR) * (end_time - p1.t) / SLOW_DOWN_TIME);
            let average_acc = (a0 + a1) * 0.5;
            let t = (v0 - p1.v).abs() / average_acc;

            let d = t * v0
                + 0.5 * t * t * sign(p1.v - v0) * a0
                + (1.0 / 6.0) * t * t * sign(p1.v - v0) * (a1 - a0);
            pos += d;
            min_pos = min_pos.min(pos);
            max_pos = max_pos.max(pos);

            v0 = p1.v;
            t0 = p1.t;
        }

        (min_pos, max_pos)
    }

    /// Cuts the profile at `time`, interpolating the final speed.
    pub fn limit_to_time(&mut self, time: f32) {
        for i in 0..self.counter - 1 {
            if self.profile[i + 1].t >= time {
                let (p0, p1) = (self.profile[i], self.profile[i + 1]);
                let diff = if p1.t == p0.t {
                    1.0
                } else {
                    (time - p0.t) / (p1.t - p0.t)
                };
                let speed = p0.v + diff * (p1.v - p0.v);
                self.profile[i + 1] = ProfilePart { v: speed, t: time };
                self.counter = i + 2;
                return;
            }
        }
    }
}

/// Adjusts the desired end speed so the profile is realizable within
/// `time`; returns (extra time, adjusted v1).
fn adjust_end_speed(v0: f32, v1: f32, time: f32, direction_positive: bool, acc: f32) -> (f32, f32) {
    let mut extra_time = 0.0;
    let mut out_v1 = v1;

    if direction_positive {
        if v0 < 0.0 && v1 < 0.0 {
            let to_zero_time = v0.abs() / acc;
            if to_zero_time < time {
                out_v1 = 0.0;
                extra_time = time - to_zero_time;
            } else {
                out_v1 = v0 + time * acc;
            }
        } else if v0 < 0.0 && v1 >= 0.0 {
            let to_v1_time = (v1 - v0) / acc;
            if to_v1_time < time {
                extra_time = time - to_v1_time;
            } else {
                out_v1 = v0 + time * acc;
            }
        } else if v0 >= 0.0 && v1 < 0.0 {
            out_v1 = 0.0;
            extra_time = time - v0.abs() / acc;
        } else {
            let direct_time = (v0 - v1).abs() / acc;
            if direct_time < time {
                extra_time = time - direct_time;
            } else {
                out_v1 = v0 + time * acc;
            }
        }
    } else {
        // mirrored sign handling
        if v0 < 0.0 && v1 < 0.0 {
            let direct_time = (v0 - v1).abs() / acc;
            if direct_time < time {
                extra_time = time - direct_time;
            } else {
                out_v1 = v0 - time * acc;
            }
        } else if v0 < 0.0 && v1 >= 0.0 {
            out_v1 = 0.0;
            extra_time = time - v0.abs() / acc;
        } else if v0 >= 0.0 && v1 < 0.0 {
            let to_v1_time = (v0 - v1) / acc;
            if to_v1_time < time {
                extra_time = time - to_v1_time;
            } else {
                out_v1 = v0 - time * acc;
            }
        } else {
            let to_zero_time = v0.abs() / acc;
            if to_zero_time < time {
                out_v1 = 0.0;
                extra_time = time - to_zero_time;
            } else {
                out_v1 = v0 - time * acc;
            }
        }
    }
    (extra_time, out_v1)
}

/// Sample of a 2-D trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub pos: Vector,
    pub speed: Vector,
    pub time: f32,
}

/// Two 1-D profiles sharing an acceleration split and a slow-down time.
#[derive(Debug, Clone, Default)]
pub struct SpeedProfile {
    pub x: SpeedProfile1D,
    pub y: SpeedProfile1D,
    pub slow_down_time: f32,
    valid: bool,
}

impl SpeedProfile {
    pub fn new(x: SpeedProfile1D, y: SpeedProfile1D, slow_down_time: f32) -> Self {
        Self {
            x,
            y,
            slow_down_time,
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Total time without the slow-down tail.
    pub fn time(&self) -> f32 {
        self.x.time().max(self.y.time())
    }

    pub fn time_with_slow_down(&self, slow_down_time: f32) -> f32 {
        self.x
            .time_with_slow_down(slow_down_time)
            .max(self.y.time_with_slow_down(slow_down_time))
    }

    pub fn position_for_time(&self, time: f32) -> Vector {
        Vector::new(
            self.x.offset_and_speed_for_time(time).0,
            self.y.offset_and_speed_for_time(time).0,
        )
    }

    pub fn speed_for_time(&self, time: f32) -> Vector {
        Vector::new(
            self.x.offset_and_speed_for_time(time).1,
            self.y.offset_and_speed_for_time(time).1,
        )
    }

    pub fn position_for_time_slow_down(&self, time: f32, slow_down_time: f32) -> Vector {
        Vector::new(
            self.x.offset_and_speed_for_time_slow_down(time, slow_down_time).0,
            self.y.offset_and_speed_for_time_slow_down(time, slow_down_time).0,
        )
    }

    pub fn speed_for_time_slow_down(&self, time: f32, slow_down_time: f32) -> Vector {
        Vector::new(
            self.x.offset_and_speed_for_time_slow_down(time, slow_down_time).1,
            self.y.offset_and_speed_for_time_slow_down(time, slow_down_time).1,
        )
    }

    pub fn end_position(&self) -> Vector {
        Vector::new(self.x.end_offset(), self.y.end_offset())
    }

    pub fn calculate_slow_down_pos(&self, slow_down_time: f32) -> Vector {
        Vector::new(
            self.x.end_offset_slow_down(slow_down_time),
            self.y.end_offset_slow_down(slow_down_time),
        )
    }

    /// Bounding box of every position the trajectory reaches, relative to
    /// the start.
    pub fn calculate_range(&self, slow_down_time: f32) -> (Vector, Vector) {
        let (min_x, max_x) = self.x.calculate_range(slow_down_time);
        let (min_y, max_y) = self.y.calculate_range(slow_down_time);
        (Vector::new(min_x, min_y), Vector::new(max_x, max_y))
    }

    pub fn limit_to_time(&mut self, time: f32) {
        self.x.limit_to_time(time);
        self.y.limit_to_time(time);
    }

    /// Samples at every profile breakpoint; breakpoints of both axes closer
    /// than 5 ms merge into one sample.
    pub fn trajectory_points(&self) -> Vec<TrajectoryPoint> {
        if !self.is_valid() {
            return vec![];
        }
        const SAME_POINT_EPSILON: f32 = 0.005;

        let mut result = Vec::with_capacity(self.x.counter + self.y.counter);
        result.push(TrajectoryPoint {
            pos: Vector::zeros(),
            speed: Vector::new(self.x.profile[0].v, self.y.profile[0].v),
            time: 0.0,
        });

        let mut x_index = 0;
        let mut y_index = 0;
        while x_index < self.x.counter - 1 && y_index < self.y.counter - 1 {
            let x_next = self.x.profile[x_index + 1].t;
            let y_next = self.y.profile[y_index + 1].t;

            let time = if (x_next - y_next).abs() < SAME_POINT_EPSILON {
                x_index += 1;
                y_index += 1;
                (x_next + y_next) / 2.0
            } else if x_next < y_next {
                x_index += 1;
                x_next
            } else {
                y_index += 1;
                y_next
            };
            result.push(TrajectoryPoint {
                pos: self.position_for_time(time),
                speed: self.speed_for_time(time),
                time,
            });
        }

        // stand in for the missing exponential tail with a final resting
        // sample
        if self.slow_down_time != 0.0 {
            let end_time = self.time();
            result.push(TrajectoryPoint {
                pos: self.position_for_time(end_time),
                speed: result.last().map(|p| p.speed).unwrap_or_default(),
                time: end_time,
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(v0: f32, v1: f32, hint_dist: f32, acc: f32, v_max: f32) -> SpeedProfile1D {
        let mut p = SpeedProfile1D::default();
        p.calculate_1d_trajectory(v0, v1, hint_dist, acc, v_max);
        p.integrate_time();
        p
    }

    #[test]
    fn direct_ramp_covers_the_expected_distance() {
        let p = profile(0.0, 2.0, 0.0, 2.0, 3.0);
        assert_eq!(p.counter, 2);
        assert!((p.time() - 1.0).abs() < 1e-5);
        // 0 -> 2 m/s at 2 m/s^2 covers 1 m
        assert!((p.end_offset() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn extra_time_adds_a_bump() {
        // one second of extra time at acc 2 ramps to 1 m/s and back,
        // covering half a meter
        let p = profile(0.0, 0.0, 1.0, 2.0, 10.0);
        assert!(p.counter >= 3);
        assert!((p.time() - 1.0).abs() < 1e-5);
        assert!((p.end_offset() - 0.5).abs() < 1e-4);
        // comes back to rest
        assert!(p.end_speed().abs() < 1e-5);
    }

    #[test]
    fn extra_time_clamps_at_the_speed_limit() {
        let p = profile(0.0, 0.0, 10.0, 2.0, 1.0);
        assert_eq!(p.counter, 4);
        let top_speed = p.profile[1].v.max(p.profile[2].v);
        assert!(top_speed <= 1.0 + 1e-5);
        // ramp up, cruise the remaining 9 s at the limit, ramp down
        let expected = 9.0 + 2.0 * dist(0.0, 1.0, 2.0);
        assert!((p.end_offset() - expected).abs() < 1e-3);
    }

    #[test]
    fn end_pos_matches_built_profile() {
        for &(v0, v1, hint) in &[
            (0.0f32, 1.0f32, 0.5f32),
            (1.0, 0.0, -0.5),
            (0.5, 1.5, 2.0),
            (-1.0, 1.0, 1.0),
        ] {
            let info = SpeedProfile1D::calculate_end_pos_1d(v0, v1, hint, 2.0, 3.0);
            let p = profile(v0, v1, hint, 2.0, 3.0);
            assert!(
                (info.end_pos - p.end_offset()).abs() < 1e-3,
                "mismatch for ({v0}, {v1}, {hint}): {} vs {}",
                info.end_pos,
                p.end_offset()
            );
        }
    }

    #[test]
    fn fast_end_speed_adjusts_unreachable_targets() {
        let mut p = SpeedProfile1D::default();
        // v1 = 3 is not reachable within 0.5 s at 2 m/s^2
        p.calculate_1d_trajectory_fast_end_speed(0.0, 3.0, 0.5, true, 2.0, 5.0);
        p.integrate_time();
        assert!(p.end_speed() <= 1.0 + 1e-5);
    }

    #[test]
    fn offsets_and_speeds_are_consistent() {
        let p = profile(0.5, 0.0, 2.0, 2.0, 2.0);
        let total = p.time();
        let mut last_offset = 0.0;
        for i in 0..=20 {
            let t = total * i as f32 / 20.0;
            let (offset, speed) = p.offset_and_speed_for_time(t);
            assert!(offset >= last_offset - 1e-5, "position went backwards");
            assert!(speed >= -1e-5);
            last_offset = offset;
        }
        assert!((last_offset - p.end_offset()).abs() < 1e-4);
    }

    #[test]
    fn slow_down_extends_time_and_keeps_the_end_position_close() {
        let p = profile(1.0, 0.0, 1.0, 2.0, 2.0);
        let plain_time = p.time();
        let slow_time = p.time_with_slow_down(SLOW_DOWN_TIME);
        assert!(slow_time > plain_time);

        let end = p.end_offset();
        let end_slow = p.end_offset_slow_down(SLOW_DOWN_TIME);
        // the tail stretches the ramp in time, not in distance
        assert!((end - end_slow).abs() < 0.2 * end.abs().max(1.0));

        let (pos_at_end, speed_at_end) =
            p.offset_and_speed_for_time_slow_down(slow_time, SLOW_DOWN_TIME);
        assert!((pos_at_end - end_slow).abs() < 1e-3);
        assert!(speed_at_end.abs() < 0.05);
    }

    #[test]
    fn range_covers_backward_excursions() {
        // starts backwards, ends forward
        let p = profile(-1.0, 1.0, 1.0, 2.0, 3.0);
        let (min_pos, max_pos) = p.calculate_range(0.0);
        assert!(min_pos < 0.0);
        assert!(max_pos >= p.end_offset() - 1e-4);
    }

    #[test]
    fn limit_to_time_truncates() {
        let mut p = profile(0.0, 0.0, 4.0, 2.0, 1.0);
        let half = p.time() / 2.0;
        p.limit_to_time(half);
        assert!((p.time() - half).abs() < 1e-5);
    }

    #[test]
    fn trajectory_positions_fill_the_buffer() {
        let p = profile(0.0, 2.0, 0.0, 2.0, 3.0);
        let mut points = vec![Vector::zeros(); 10];
        p.trajectory_positions(&mut points, 0, p.time() / 9.0, 0.5);
        assert!((points[0].x - 0.5).abs() < 1e-5);
        assert!((points[9].x - (0.5 + p.end_offset())).abs() < 0.05);
        for pair in points.windows(2) {
            assert!(pair[1].x >= pair[0].x - 1e-5);
        }
    }

    #[test]
    fn two_dimensional_sampling_is_monotone_in_time() {
        let mut x = SpeedProfile1D::default();
        x.calculate_1d_trajectory(0.0, 0.0, 1.0, 2.0, 2.0);
        x.integrate_time();
        let mut y = SpeedProfile1D::default();
        y.calculate_1d_trajectory(0.5, 0.0, 0.0, 2.0, 2.0);
        y.integrate_time();
        let profile = SpeedProfile::new(x, y, 0.0);

        let points = profile.trajectory_points();
        assert!(points.len() >= 2);
        assert_eq!(points[0].time, 0.0);
        for pair in points.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
    }
}
