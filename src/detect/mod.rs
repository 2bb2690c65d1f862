mod backend;
pub mod backends;
mod registry;
mod result;
mod retry;
pub mod vision_response;

pub use backend::{DetectError, FrameDetector, FrameInput};
pub use backends::{EdgeHeuristicBackend, ObjectClassifierBackend, ObjectModel, StubBackend};
pub use registry::{DetectorRegistry, SharedDetector};
pub use result::DetectedObject;
pub use retry::RetryPolicy;

#[cfg(feature = "backend-vision")]
pub use backends::VisionModelBackend;

#[cfg(feature = "backend-tract")]
pub use backends::TractObjectModel;
