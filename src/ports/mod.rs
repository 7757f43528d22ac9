//! Port traits: the narrow interfaces between the pipeline and the outside world.

pub mod alert_port;
pub mod config_port;
pub mod data_port;
pub mod persistence_port;
