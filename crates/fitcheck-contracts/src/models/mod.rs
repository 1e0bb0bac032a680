mod registry;
mod selectors;

pub use registry::{ModelRegistry, ECOM_VTON_VERSION, IDM_VTON_VERSION};
pub use selectors::{ModelSelection, ModelSelector};
