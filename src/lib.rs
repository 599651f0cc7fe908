#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod page;
pub mod render;
pub mod scheduler;
pub mod sync;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
