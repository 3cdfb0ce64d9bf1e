pub mod config;
pub mod error;
pub mod routes;
pub mod usage;

pub use config::{controller_options_from_env, quantity_config_from_env};
pub use routes::{api_routes, app};
