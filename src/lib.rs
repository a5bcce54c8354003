pub mod app;
pub mod config;
pub mod logger;
pub mod videoroom;
