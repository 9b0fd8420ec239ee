pub mod app;
pub mod config;
pub mod orchestration;
pub mod profiles;
pub mod runtime;
pub mod shared;
