pub mod config;
pub mod message;
pub mod reprocess;
pub mod scale;

pub use config::Config;
pub use message::{Stage, StageMessage};
pub use reprocess::{ReprocessItem, ReprocessMode, ReprocessOutcome, ReprocessPlan};
pub use scale::{ScaleDecision, ScaleRule, StageRunRecord};
