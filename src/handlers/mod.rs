mod echo;
mod health;
mod maintenance;

pub use echo::echo;
pub use health::health_check;
pub use maintenance::{get_maintenance, set_maintenance};
