mod api;
mod principal;

pub use api::{EchoResponse, HealthResponse, MaintenanceStatus, MaintenanceUpdate};
pub use principal::{Principal, describe_user};
