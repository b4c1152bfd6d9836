//! Inference accelerators.
//!
//! The pipeline talks to the accelerator only through `Accelerator::submit`
//! and the completion callback it hands over. Backends:
//! - `stub`: deterministic detections on a worker thread, with scriptable
//!   rejections and hardware errors for tests and demos
//! - `tract`: ONNX YOLO model (feature: backend-tract)

mod accelerator;
mod backends;
pub mod postprocess;
mod registry;
mod result;

pub use accelerator::{Accelerator, BatchImage, CompletionCallback, CompletionToken};
pub use backends::{StubAccelerator, StubConfig, StubControl};
#[cfg(feature = "backend-tract")]
pub use backends::{TractAccelerator, TractConfig};
pub use registry::{resolve_model_path, AcceleratorRegistry};
pub use result::{BoundingBox, DetectionResult, RawDetections};
