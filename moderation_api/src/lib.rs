mod content_filter;
mod detection;
mod detector;
mod frame_sampler;
mod retention;
mod routes;
mod server;
mod telemetry;
mod uploads;

pub mod app;
pub mod config;

pub use app::start_app;
