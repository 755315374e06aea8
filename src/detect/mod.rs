//! Region detection: a binary window classifier swept over the frame at
//! multiple scales, with overlapping hits merged into regions.

mod backend;
pub mod backends;
mod group;
mod region;
mod scan;

pub use backend::{load_classifier, WindowClassifier};
pub use backends::IntensityClassifier;
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use group::{group_regions, GROUP_EPS};
pub use region::{sort_regions, Region};
pub use scan::{detect_regions, ScanParams, DEFAULT_MAX_HITS};
