pub mod api;
pub mod controller;
pub mod engine;
pub mod guard;
pub mod handler;
pub mod monitor;
pub mod reprocess;
pub mod runner;
pub mod scheduler;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use crate::engine::Engine;
