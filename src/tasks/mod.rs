//! Background tasks owned by the server process.

pub mod maintenance;

pub use maintenance::{MaintenanceHandle, MaintenanceReport, MaintenanceTask};
