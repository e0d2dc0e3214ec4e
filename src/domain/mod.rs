// Domain layer: core models and ports (interfaces) for grid, search API and storage.

pub mod model;
pub mod ports;
