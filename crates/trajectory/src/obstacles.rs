//! Obstacles for planning: convex shapes with signed distances (negative
//! inside), plus linearly extrapolated moving circles for robots.

use crate::Vector;

fn perpendicular(dir: Vector) -> Vector {
    Vector::new(dir.y, -dir.x)
}

/// Distance from `point` to the segment `p1..p2`.
fn distance_to_segment(p1: Vector, p2: Vector, point: Vector) -> f32 {
    let dir = p2 - p1;
    let length_sq = dir.norm_squared();
    if length_sq == 0.0 {
        return (point - p1).norm();
    }
    let t = ((point - p1).dot(&dir) / length_sq).clamp(0.0, 1.0);
    (point - (p1 + dir * t)).norm()
}

/// Static obstacle variants. Every shape is convex; the distance inside an
/// obstacle is the negated distance to its border.
#[derive(Debug, Clone)]
pub enum Obstacle {
    Circle {
        center: Vector,
        radius: f32,
        prio: i32,
        name: &'static str,
    },
    Rect {
        bottom_left: Vector,
        top_right: Vector,
        prio: i32,
        name: &'static str,
    },
    Line {
        p1: Vector,
        p2: Vector,
        width: f32,
        prio: i32,
        name: &'static str,
    },
    Triangle {
        p1: Vector,
        p2: Vector,
        p3: Vector,
        line_width: f32,
        prio: i32,
        name: &'static str,
    },
}

impl Obstacle {
    pub fn prio(&self) -> i32 {
        match self {
            Self::Circle { prio, .. }
            | Self::Rect { prio, .. }
            | Self::Line { prio, .. }
            | Self::Triangle { prio, .. } => *prio,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Circle { name, .. }
            | Self::Rect { name, .. }
            | Self::Line { name, .. }
            | Self::Triangle { name, .. } => name,
        }
    }

    /// Grows the obstacle by `radius` in every direction.
    pub fn inflate(&mut self, extra: f32) {
        match self {
            Self::Circle { radius, .. } => *radius += extra,
            Self::Line { width, .. } => *width += extra,
            Self::Triangle { line_width, .. } => *line_width += extra,
            Self::Rect {
                bottom_left,
                top_right,
                ..
            } => {
                bottom_left.x -= extra;
                bottom_left.y -= extra;
                top_right.x += extra;
                top_right.y += extra;
            }
        }
    }

    /// Signed distance: negative inside the obstacle.
    pub fn distance(&self, pos: Vector) -> f32 {
        match self {
            Self::Circle { center, radius, .. } => (pos - center).norm() - radius,
            Self::Line { p1, p2, width, .. } => distance_to_segment(*p1, *p2, pos) - width,
            Self::Rect {
                bottom_left,
                top_right,
                ..
            } => {
                let dx = (bottom_left.x - pos.x).max(pos.x - top_right.x);
                let dy = (bottom_left.y - pos.y).max(pos.y - top_right.y);
                if dx <= 0.0 && dy <= 0.0 {
                    // inside: distance to the closest border
                    dx.max(dy)
                } else {
                    Vector::new(dx.max(0.0), dy.max(0.0)).norm()
                }
            }
            Self::Triangle {
                p1,
                p2,
                p3,
                line_width,
                ..
            } => {
                let d12 = distance_to_segment(*p1, *p2, pos);
                let d23 = distance_to_segment(*p2, *p3, pos);
                let d31 = distance_to_segment(*p3, *p1, pos);
                let border = d12.min(d23).min(d31);

                // signed area test for containment, orientation-independent
                let sign = |a: Vector, b: Vector, c: Vector| {
                    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
                };
                let s1 = sign(*p1, *p2, pos);
                let s2 = sign(*p2, *p3, pos);
                let s3 = sign(*p3, *p1, pos);
                let inside = (s1 >= 0.0 && s2 >= 0.0 && s3 >= 0.0)
                    || (s1 <= 0.0 && s2 <= 0.0 && s3 <= 0.0);
                if inside {
                    -border - line_width
                } else {
                    border - line_width
                }
            }
        }
    }

    pub fn is_inside(&self, pos: Vector) -> bool {
        self.distance(pos) < 0.0
    }

    /// Moves `pos` out of the obstacle with `extra_distance` of clearance.
    pub fn project_out(&self, pos: Vector, extra_distance: f32) -> Vector {
        match self {
            Self::Circle { center, radius, .. } => {
                let dir = pos - center;
                if dir.norm() < 1e-6 {
                    return center + Vector::new(radius + extra_distance, 0.0);
                }
                center + dir.normalize() * (radius + extra_distance)
            }
            Self::Line { p1, p2, width, .. } => {
                let dir = (p2 - p1).normalize();
                let t = (pos - p1).dot(&dir).clamp(0.0, (p2 - p1).norm());
                let closest = p1 + dir * t;
                let mut away = pos - closest;
                if away.norm() < 1e-6 {
                    away = perpendicular(dir);
                }
                closest + away.normalize() * (width + extra_distance)
            }
            Self::Rect {
                bottom_left,
                top_right,
                ..
            } => {
                // push across the closest border
                let candidates = [
                    Vector::new(bottom_left.x - extra_distance, pos.y),
                    Vector::new(top_right.x + extra_distance, pos.y),
                    Vector::new(pos.x, bottom_left.y - extra_distance),
                    Vector::new(pos.x, top_right.y + extra_distance),
                ];
                candidates
                    .into_iter()
                    .min_by(|a, b| (a - pos).norm().total_cmp(&(b - pos).norm()))
                    .unwrap()
            }
            Self::Triangle { p1, p2, p3, line_width, .. } => {
                let center = (p1 + p2 + p3) / 3.0;
                let mut away = pos - center;
                if away.norm() < 1e-6 {
                    away = Vector::new(1.0, 0.0);
                }
                let mut out = pos;
                // step outward until clear
                for _ in 0..16 {
                    if self.distance(out) >= extra_distance {
                        break;
                    }
                    out += away.normalize() * (line_width.max(0.02));
                }
                out
            }
        }
    }
}

/// A robot in motion: a circle sliding with constant velocity.
#[derive(Debug, Clone)]
pub struct MovingObstacle {
    pub start_pos: Vector,
    pub speed: Vector,
    pub radius: f32,
    pub prio: i32,
}

impl MovingObstacle {
    pub fn position_at(&self, time: f32) -> Vector {
        self.start_pos + self.speed * time
    }

    /// Signed distance at `time`.
    pub fn distance(&self, pos: Vector, time: f32) -> f32 {
        (pos - self.position_at(time)).norm() - self.radius
    }

    pub fn is_inside(&self, pos: Vector, time: f32) -> bool {
        self.distance(pos, time) < 0.0
    }
}
