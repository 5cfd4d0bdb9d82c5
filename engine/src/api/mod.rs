pub mod auth;
pub mod control;
pub mod dlq;
pub mod health;
pub mod router;
pub mod state;

pub use router::serve;
pub use state::ApiState;
