pub mod images;
pub mod price;
pub mod retailer;
pub mod structured;

pub use price::{BrlPrice, PriceConfidence, ReconciledPrice, reconcile};
pub use retailer::{RetailerAdapter, Store, adapter_for};
pub use structured::extract;
