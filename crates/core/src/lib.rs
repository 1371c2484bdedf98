pub mod action;
pub mod clock;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod failure;
pub mod lock;
pub mod logger;
pub mod machine;
pub mod monitor;
pub mod orchestrator;
pub mod perception;
pub mod platform;
pub mod scene;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod state;
pub mod types;

#[cfg(test)]
mod testutil;
