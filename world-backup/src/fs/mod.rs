pub mod collector;

pub use collector::{collect_files, CollectedFile};
