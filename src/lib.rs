pub mod config;
pub mod controller;
pub mod gateway;
pub mod shutdown;
