//! Sakura Fleet — GPU translation worker manager.

pub mod config;
pub mod error;
pub mod fleet;
pub mod store;
pub mod translate;
pub mod worker;
