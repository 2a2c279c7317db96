#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod connection;
pub mod context;
pub mod engine;
pub mod filter;
pub mod health;
pub mod publisher;
pub mod session;
pub mod subscriptions;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod engine_tests;
