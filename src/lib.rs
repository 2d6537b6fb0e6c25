pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod protocol;
pub mod provider;
pub mod reconstruct;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;

pub(crate) mod json_scan;
mod util;
