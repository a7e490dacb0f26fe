pub mod wakeup;

pub use wakeup::{WakeupConfig, WakeupJob};
