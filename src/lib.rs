//! Automation and integration execution substrate for the managed-services
//! portal: cron tasks, persisted automations, outbound module calls with a
//! durable retry log, and realtime refresh fan-out.

pub mod api;
pub mod app;
pub mod automation;
pub mod clock;
pub mod collaborators;
pub mod compliance;
pub mod config;
pub mod crontab;
pub mod db;
pub mod error;
pub mod integrations;
pub mod modules;
pub mod monitor;
pub mod refresh;
pub mod scheduler;

pub use app::App;
pub use config::Config;
