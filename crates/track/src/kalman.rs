//! Constant-velocity Kalman filter over box centers.
//!
//! State is `(cx, cy, vx, vy, ax, ay)`. The transition matrix carries the
//! acceleration terms into the velocity rows but zeroes both acceleration
//! rows, so acceleration is forgotten after every step; with process noise on
//! all six components this behaves as a noise-driven velocity model. The
//! measurement takes `(cx, cy)` only.

use nalgebra::{SMatrix, SVector};

type Vec6 = SVector<f32, 6>;
type Vec2 = SVector<f32, 2>;
type Mat6 = SMatrix<f32, 6, 6>;
type Mat2x6 = SMatrix<f32, 2, 6>;
type Mat2 = SMatrix<f32, 2, 2>;

#[derive(Debug, Clone)]
pub struct Kalman {
    x: Vec6,
    p: Mat6,
    a: Mat6,
    h: Mat2x6,
    q: Mat6,
    r: Mat2,
}

impl Kalman {
    /// Filter seeded at a measured center with zero velocity, unit noise.
    pub fn new(cx: f32, cy: f32) -> Self {
        Self::with_noise(cx, cy, 1.0, 1.0, 1.0)
    }

    /// `sigma0_sq` scales the initial covariance, `sigma_p_sq` the process
    /// noise, `sigma_m_sq` the measurement noise.
    pub fn with_noise(cx: f32, cy: f32, sigma0_sq: f32, sigma_p_sq: f32, sigma_m_sq: f32) -> Self {
        #[rustfmt::skip]
        let a = Mat6::from_row_slice(&[
            1.0, 0.0, 1.0, 0.0, 0.5, 0.0,
            0.0, 1.0, 0.0, 1.0, 0.0, 0.5,
            0.0, 0.0, 1.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        #[rustfmt::skip]
        let h = Mat2x6::from_row_slice(&[
            1.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        Self {
            x: Vec6::new(cx, cy, 0.0, 0.0, 0.0, 0.0),
            p: Mat6::identity() * sigma0_sq,
            a,
            h,
            q: Mat6::identity() * sigma_p_sq,
            r: Mat2::identity() * sigma_m_sq,
        }
    }

    /// First-measurement seeding: velocity becomes the offset from the
    /// current position to the measurement.
    pub fn seed_velocity(&mut self, mx: f32, my: f32) {
        self.x[2] = mx - self.x[0];
        self.x[3] = my - self.x[1];
    }

    /// Time update: `X ← A·X`, `P ← A·P·Aᵀ + Q`.
    pub fn predict(&mut self) {
        self.x = self.a * self.x;
        self.p = self.a * self.p * self.a.transpose() + self.q;
    }

    /// Measurement update with `Z = (mx, my)`.
    pub fn correct(&mut self, mx: f32, my: f32) {
        let z = Vec2::new(mx, my);
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k = self.p * self.h.transpose() * s_inv;
        self.x += k * (z - self.h * self.x);
        self.p = (Mat6::identity() - k * self.h) * self.p;
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x[0], self.x[1])
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.x[2], self.x[3])
    }

    /// Where the next time update would put the center, without committing.
    pub fn predicted_center(&self) -> (f32, f32) {
        let x = self.a * self.x;
        (x[0], x[1])
    }
}
