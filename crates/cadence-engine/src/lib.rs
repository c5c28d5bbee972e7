pub mod calendar;
pub mod completions;
pub mod config;
pub mod engine;
pub mod recurrence;
pub mod scheduler;
pub mod spawner;
pub mod streaks;

pub use engine::CadenceEngine;
