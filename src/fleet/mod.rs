//! Fleet of Sakura workers and its admin HTTP surface.

mod manager;
pub mod routes;

pub use manager::FleetManager;
pub use routes::{FleetRouteState, fleet_routes};
