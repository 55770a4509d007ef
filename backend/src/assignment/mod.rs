pub mod backoff;
pub mod commit;
pub mod engine;
pub mod lock;
pub mod picker;
pub mod types;

pub use engine::{AssignmentEngine, InitReport};
