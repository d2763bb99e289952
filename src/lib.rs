//! # Rust Gator Core Library
//!
//! Alignment core for photonic chip probing: it maps chip-layout coordinates onto a
//! motorized stage and drives the stage there under supervision.
//!
//! ## Crate Structure
//!
//! - **`geometry`**: design and stage point types, axes, correspondences.
//! - **`error`**: the `GatorError` taxonomy shared by every layer.
//! - **`config`**: figment-based configuration (TOML plus `RUST_GATOR_` environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`hardware`**: device transports, links, bounded message queues, the handle-based
//!   registry, capability traits and their adapters, and mock devices.
//! - **`supervisor`**: background status polling with liveness monitoring.
//! - **`stage`**: multi-axis motion with settle detection, stop and backlash handling.
//! - **`calibration`**: the design-to-stage affine solve and its persistence.
//! - **`planner`**: moves in design coordinates.
//! - **`session`**: wires everything together from a configuration.

pub mod calibration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod hardware;
pub mod logging;
pub mod planner;
pub mod session;
pub mod stage;
pub mod supervisor;

pub use calibration::{AffineTransform, CalibrationEngine, FitQuality};
pub use error::{GatorError, GatorResult};
pub use geometry::{Axis, Correspondence, DesignPoint, StagePoint};
pub use planner::MotionPlanner;
pub use session::Session;
pub use stage::{MotionRequest, StageController};
pub use supervisor::PollingSupervisor;
