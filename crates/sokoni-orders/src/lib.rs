pub mod tracker;

pub use tracker::{OrderConfig, OrderError, OrderHandle, OrderTracker, OrderUpdate, OrderView};
