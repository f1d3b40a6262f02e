pub mod events;
pub mod language;
pub mod models;
