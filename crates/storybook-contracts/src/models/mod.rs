mod registry;
mod selectors;

pub use registry::{BackendId, BackendRegistry, BackendSpec};
pub use selectors::{BackendSelection, BackendSelector};
