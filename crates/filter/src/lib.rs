use nalgebra::{SMatrix, SVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Innovation covariance is not invertible")]
    Inversion,
}

pub type Result<T> = std::result::Result<T, Error>;

pub type StateVec<const D: usize> = SVector<f32, D>;
pub type CovMat<const D: usize> = SMatrix<f32, D, D>;
pub type ObsVec<const D: usize> = SVector<f32, D>;
pub type ObsMat<const D_OBS: usize, const D_STATE: usize> = SMatrix<f32, D_OBS, D_STATE>;

/// Linear Kalman filter with an explicit per-step model.
///
/// The caller fills in the transition matrix `f`, the covariance jacobian
/// `b` (usually equal to `f`, but carrying extra linearisation terms for
/// rotated state models), the control vector `u`, the process noise `q`,
/// the measurement matrix `h`, the observation `z` and its noise `r`
/// before calling [`predict`](Self::predict) or [`update`](Self::update).
/// This mirrors how the tracking filters re-derive their model from the
/// elapsed time on every step.
///
/// The filter is `Clone`; speculative prediction is done on a copy so the
/// permanent history is never corrupted.
#[derive(Debug, Clone)]
pub struct KalmanFilter<const D_STATE: usize, const D_OBS: usize> {
    state: StateVec<D_STATE>,
    covariance: CovMat<D_STATE>,

    pub f: CovMat<D_STATE>,
    pub b: CovMat<D_STATE>,
    pub u: StateVec<D_STATE>,
    pub q: CovMat<D_STATE>,
    pub h: ObsMat<D_OBS, D_STATE>,
    pub z: ObsVec<D_OBS>,
    pub r: CovMat<D_OBS>,
}

impl<const D_STATE: usize, const D_OBS: usize> KalmanFilter<D_STATE, D_OBS> {
    #[must_use]
    pub fn new<S>(state_0: S) -> Self
    where
        S: Into<StateVec<D_STATE>>,
    {
        Self {
            state: state_0.into(),
            covariance: CovMat::identity(),
            f: CovMat::identity(),
            b: CovMat::identity(),
            u: StateVec::zeros(),
            q: CovMat::zeros(),
            h: ObsMat::zeros(),
            z: ObsVec::zeros(),
            r: CovMat::identity(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &StateVec<D_STATE> {
        &self.state
    }

    #[must_use]
    pub fn covariance(&self) -> &CovMat<D_STATE> {
        &self.covariance
    }

    /// Overwrites a single state component, e.g. to re-wrap an angle.
    pub fn modify_state(&mut self, index: usize, value: f32) {
        self.state[index] = value;
    }

    /// Resets state and covariance, keeping the model matrices.
    pub fn reset<S>(&mut self, state: S)
    where
        S: Into<StateVec<D_STATE>>,
    {
        self.state = state.into();
        self.covariance = CovMat::identity();
    }

    /// Time update: `x <- f x + u`, `P <- b P bᵀ + q`.
    pub fn predict(&mut self) {
        self.state = self.f * self.state + self.u;
        self.covariance = self.b * self.covariance * self.b.transpose() + self.q;
        self.symmetrize();
    }

    /// Measurement update against the current `h`, `z` and `r`.
    ///
    /// Angular measurement components must be wrapped against the predicted
    /// state by the caller before they are written to `z`.
    pub fn update(&mut self) -> Result<()> {
        let innovation = self.z - self.h * self.state;
        let innovation_cov = self.h * self.covariance * self.h.transpose() + self.r;
        let gain = self.covariance
            * self.h.transpose()
            * innovation_cov.try_inverse().ok_or(Error::Inversion)?;

        self.state += gain * innovation;
        self.covariance -= gain * self.h * self.covariance;
        self.symmetrize();
        Ok(())
    }

    // covariance updates leave tiny asymmetries that accumulate over
    // thousands of steps
    fn symmetrize(&mut self) {
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{matrix, vector};

    type Kf = KalmanFilter<2, 1>;

    fn constant_velocity(dt: f32) -> Kf {
        let mut kf = Kf::new(vector![0.0, 0.0]);
        kf.f = matrix![1.0, dt; 0.0, 1.0];
        kf.b = kf.f;
        kf.q = matrix![0.01, 0.0; 0.0, 0.01];
        kf.h = matrix![1.0, 0.0];
        kf.r = matrix![0.01];
        kf
    }

    #[test]
    fn converges_on_constant_velocity_track() {
        let mut kf = constant_velocity(0.1);
        // measurements along x = t (1 m/s)
        for step in 1..=50 {
            kf.predict();
            kf.z = vector![step as f32 * 0.1];
            kf.update().unwrap();
        }
        assert!((kf.state()[0] - 5.0).abs() < 0.05);
        assert!((kf.state()[1] - 1.0).abs() < 0.1);
    }

    #[test]
    fn covariance_stays_positive_semi_definite() {
        let mut kf = constant_velocity(0.01);
        for step in 0..1000 {
            kf.predict();
            kf.z = vector![(step as f32 * 0.01).sin()];
            kf.update().unwrap();

            let cov = kf.covariance();
            // symmetric by construction, eigenvalues of a symmetric 2x2
            let trace = cov[(0, 0)] + cov[(1, 1)];
            let det = cov[(0, 0)] * cov[(1, 1)] - cov[(0, 1)] * cov[(1, 0)];
            let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
            let min_eig = trace / 2.0 - disc;
            assert!(min_eig > -1e-6, "covariance lost PSD at step {step}");
        }
    }

    #[test]
    fn control_input_shifts_the_state() {
        let mut kf = constant_velocity(0.1);
        kf.u = vector![0.0, 0.5];
        kf.predict();
        assert!((kf.state()[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn singular_innovation_is_reported() {
        let mut kf = constant_velocity(0.1);
        kf.r = matrix![0.0];
        kf.covariance = CovMat::zeros();
        // with P = 0 and R = 0 the innovation covariance is singular
        assert!(matches!(kf.update(), Err(Error::Inversion)));
    }
}
