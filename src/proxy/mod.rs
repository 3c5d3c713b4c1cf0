mod auth;
mod distribute;
mod error;
mod handler;
mod router;

pub use router::create_proxy_router;
