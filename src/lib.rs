pub mod command_file;
pub mod config;
pub mod configuration;
pub mod dashboard;
pub mod device;
pub mod error;
pub mod handover;
pub mod scheduler;
pub mod shutdown;
pub mod watcher;
pub mod worker;
