mod cache;
mod config;
mod utils;
