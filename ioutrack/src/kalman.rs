//! Linear Kalman filter over fixed-size state and observation vectors

use anyhow::Result;
use nalgebra::{SMatrix, SVector};

#[derive(Debug, Clone)]
pub struct KalmanFilterParams<const X: usize, const Z: usize> {
    pub x: SVector<f32, X>,    // Initial state
    pub p: SMatrix<f32, X, X>, // Initial state covariance
    pub f: SMatrix<f32, X, X>, // State transition matrix
    pub h: SMatrix<f32, Z, X>, // Observation matrix
    pub r: SMatrix<f32, Z, Z>, // Observation noise covariance
    pub q: SMatrix<f32, X, X>, // Process noise covariance
}

#[derive(Debug, Clone)]
pub struct KalmanFilter<const X: usize, const Z: usize> {
    pub x: SVector<f32, X>,    // State vector
    pub p: SMatrix<f32, X, X>, // State covariance matrix
    f: SMatrix<f32, X, X>,
    h: SMatrix<f32, Z, X>,
    r: SMatrix<f32, Z, Z>,
    q: SMatrix<f32, X, X>,
}

impl<const X: usize, const Z: usize> KalmanFilter<X, Z> {
    pub fn new(params: KalmanFilterParams<X, Z>) -> Self {
        Self {
            x: params.x,
            p: params.p,
            f: params.f,
            h: params.h,
            r: params.r,
            q: params.q,
        }
    }

    /// Predict the next state
    pub fn predict(&mut self) {
        // x = F * x
        self.x = self.f * self.x;

        // P = F * P * F^T + Q
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Correct the state with an observation
    pub fn update(&mut self, z: SVector<f32, Z>) -> Result<()> {
        // Residual: y = z - H * x
        let y = z - self.h * self.x;

        // Innovation covariance: S = H * P * H^T + R
        let s = self.h * self.p * self.h.transpose() + self.r;

        let s_inv = s
            .try_inverse()
            .ok_or_else(|| anyhow::anyhow!("Failed to invert innovation covariance matrix"))?;

        // Kalman gain: K = P * H^T * S^-1
        let k = self.p * self.h.transpose() * s_inv;

        self.x += k * y;
        self.p = (SMatrix::<f32, X, X>::identity() - k * self.h) * self.p;

        Ok(())
    }

    pub fn state(&self) -> &SVector<f32, X> {
        &self.x
    }

    pub fn covariance(&self) -> &SMatrix<f32, X, X> {
        &self.p
    }
}
