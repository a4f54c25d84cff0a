//! [`VelocityLimiter`] – clamps requested twists to configured limits.
//!
//! Linear components are limited by magnitude: a vector whose norm exceeds
//! `max_linear` is scaled down so that its norm equals `max_linear`, which
//! keeps the direction of travel.  The angular rate is clamped on its own to
//! `[-max_angular, max_angular]`.  Non-finite inputs are replaced by zero and
//! reported as clamped.

/// Requested planar twist.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VelocityInput {
    pub linear_x: f64,
    pub linear_y: f64,
    pub angular_z: f64,
}

/// Twist after limiting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitResult {
    pub linear_x: f64,
    pub linear_y: f64,
    pub angular_z: f64,
    /// `true` when any component differs from the input.
    pub clamped: bool,
}

/// Pure velocity clamp.
///
/// # Example
///
/// ```
/// use robogate_kernel::velocity_limiter::{VelocityInput, VelocityLimiter};
///
/// let limiter = VelocityLimiter::new(1.0, 1.5);
/// let out = limiter.limit(VelocityInput { linear_x: 2.0, linear_y: 0.0, angular_z: 0.5 });
/// assert_eq!(out.linear_x, 1.0);
/// assert!(out.clamped);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityLimiter {
    max_linear: f64,
    max_angular: f64,
}

impl VelocityLimiter {
    /// Negative or non-finite limits are treated as zero.
    pub fn new(max_linear: f64, max_angular: f64) -> Self {
        Self {
            max_linear: sanitize_limit(max_linear),
            max_angular: sanitize_limit(max_angular),
        }
    }

    pub fn max_linear(&self) -> f64 {
        self.max_linear
    }

    pub fn max_angular(&self) -> f64 {
        self.max_angular
    }

    /// Clamp `input` to the configured limits.
    pub fn limit(&self, input: VelocityInput) -> LimitResult {
        let (mut lx, mut ly, mut az) = (input.linear_x, input.linear_y, input.angular_z);
        let mut clamped = false;

        for v in [&mut lx, &mut ly, &mut az] {
            if !v.is_finite() {
                *v = 0.0;
                clamped = true;
            }
        }

        let norm = lx.hypot(ly);
        if norm > self.max_linear {
            let scale = self.max_linear / norm;
            lx *= scale;
            ly *= scale;
            clamped = true;
        }

        if az.abs() > self.max_angular {
            az = az.signum() * self.max_angular;
            clamped = true;
        }

        LimitResult {
            linear_x: lx,
            linear_y: ly,
            angular_z: az,
            clamped,
        }
    }
}

fn sanitize_limit(limit: f64) -> f64 {
    if limit.is_finite() && limit > 0.0 { limit } else { 0.0 }
}
