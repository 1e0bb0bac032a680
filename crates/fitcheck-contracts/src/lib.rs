pub mod errors;
pub mod events;
pub mod models;
pub mod plan;
pub mod receipts;
pub mod tryon;
