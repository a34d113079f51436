// Domain layer: core models and ports (interfaces) shared by provisioning and supervision.

pub mod model;
pub mod ports;
