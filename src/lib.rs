// Library exports for migro
// This allows integration tests and the binary to use migro's modules

pub mod cli;
pub mod coordinator;
pub mod core;
pub mod db;
pub mod logging;
pub mod services;
pub mod utils;
