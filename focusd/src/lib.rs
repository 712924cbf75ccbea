pub mod communication;
pub mod config;
pub mod logging;
pub mod models;
pub mod service;
pub mod worker;
