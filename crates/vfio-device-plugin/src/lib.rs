pub mod config;
pub mod controller;
pub mod device_plugin;
pub mod discovery;
pub mod logging;
