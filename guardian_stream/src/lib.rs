mod image_utils;
mod routes;
mod stream;

pub mod app;
pub mod capture;
pub mod config;
pub mod guard;
pub mod pump;
pub mod render;
pub mod server;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod transport;

pub use app::start_app;
