//! Trajectory planning: time-parameterized velocity profiles respecting
//! static and moving obstacles.
//!
//! The planner builds on a closed-form 2-D generator (the alpha-time
//! trajectory) and falls back through randomized samplers when the direct
//! solution collides.

use nalgebra::Vector2;

pub mod alpha_time;
pub mod obstacles;
pub mod path;
pub mod profile;
pub mod sampler;

pub use obstacles::{MovingObstacle, Obstacle};
pub use path::{TrajectoryInput, TrajectoryPath, TrajectoryPoint};
pub use profile::{SpeedProfile, SpeedProfile1D};

pub type Vector = Vector2<f32>;

/// Exponential slow-down tail appended to trajectories ending at rest,
/// seconds.
pub const SLOW_DOWN_TIME: f32 = 0.2;

/// Acceleration never drops below this fraction of the limit inside the
/// slow-down tail.
pub const MIN_ACC_FACTOR: f32 = 0.3;
