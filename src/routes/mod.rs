pub mod default_route;
pub mod harvest_route;
