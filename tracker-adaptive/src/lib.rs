pub mod controller;
pub mod supervisor;

pub use controller::{HealthReport, ModeController};
pub use supervisor::run;
