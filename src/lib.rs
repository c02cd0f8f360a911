pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod identity;
pub mod middleware;
pub mod ratelimit;
pub mod routes;
