//! This module contains the core logic of the pingpep policy enforcement proxy.
//!
//! It defines the modules for configuration, the access-decision pipeline,
//! proxying and service management.

pub mod config;
pub mod logging;
pub mod pep;
pub mod proxy;
pub mod service;
pub(crate) mod utils;
