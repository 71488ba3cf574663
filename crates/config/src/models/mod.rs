pub mod api_agent;
pub mod app_config;
pub mod database;
pub mod execution;
pub mod ledger;
pub mod logging;

pub use api_agent::*;
pub use app_config::*;
pub use database::*;
pub use execution::*;
pub use ledger::*;
pub use logging::*;
