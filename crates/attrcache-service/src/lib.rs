#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod test;
