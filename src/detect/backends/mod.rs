pub mod edge;
pub mod objects;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

#[cfg(feature = "backend-vision")]
pub mod vision;

pub use edge::{analyze_luma, EdgeHeuristicBackend, EdgeSignal};
pub use objects::{ObjectClassifierBackend, ObjectModel};
pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractObjectModel;

#[cfg(feature = "backend-vision")]
pub use vision::VisionModelBackend;
