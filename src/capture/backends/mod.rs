pub mod synthetic;
#[cfg(feature = "capture-xcap")]
pub mod screen;

#[cfg(feature = "capture-xcap")]
pub use screen::{XcapBackend, XcapWindows};
pub use synthetic::{SyntheticBackend, SyntheticCounters, SyntheticDesktop, STUB_PREFIX};
