//! Read path: piece scheduling, piece materialization, and cursors.

pub mod piece_reader;
pub mod reader;
pub mod scheduler;

pub use reader::ContentReader;
pub use scheduler::{PriorityPlan, PriorityScheduler};
