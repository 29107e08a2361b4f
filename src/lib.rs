pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod streaming;
pub mod upstream;
pub mod utils;
pub mod web;
