//! `robogate-kernel` – Safety Subsystem
//!
//! The rules every motion command must satisfy before it reaches a robot.
//! Nothing here talks to clients; the gateway's message handler consults the
//! kernel and reports refusals.
//!
//! # Modules
//!
//! - [`estop`] – [`EmergencyStopManager`][estop::EmergencyStopManager]:
//!   per-robot stop latch that invokes the adapter's stop primitive.
//! - [`velocity_limiter`] – [`VelocityLimiter`][velocity_limiter::VelocityLimiter]:
//!   direction-preserving linear clamp plus independent angular clamp.
//! - [`operation_lock`] – [`OperationLock`][operation_lock::OperationLock]:
//!   exclusive, time-bounded command lease per robot with a periodic expiry
//!   sweep.
//! - [`watchdog`] – [`CommandWatchdog`][watchdog::CommandWatchdog]:
//!   sends a zero-velocity command to robots whose operator went silent.
//! - [`safety_kernel`] – [`SafetyKernel`][safety_kernel::SafetyKernel]:
//!   bundles the four policies and owns their background tasks.

pub mod estop;
pub mod operation_lock;
pub mod safety_kernel;
pub mod velocity_limiter;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use estop::{EmergencyStopManager, EstopTally};
pub use operation_lock::OperationLock;
pub use safety_kernel::{MotionGrant, SafetyConfig, SafetyKernel};
pub use velocity_limiter::{LimitResult, VelocityInput, VelocityLimiter};
pub use watchdog::{CommandWatchdog, TripCallback};
