pub mod broadcast;
pub mod stats;
