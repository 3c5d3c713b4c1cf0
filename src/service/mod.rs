pub mod app_state;
pub mod batch;
pub mod cache;
pub mod distributor;
pub mod ledger;
pub mod metric;
pub mod monitor;
pub mod notify;
pub mod redis;
pub mod relay;
pub mod store;
pub mod token_auth;

#[cfg(test)]
pub mod testing;
