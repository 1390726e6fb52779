pub mod config;
pub mod config_io;
pub mod download;
pub mod logging;
