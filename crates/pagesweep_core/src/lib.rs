pub mod cache;
pub mod config;
pub mod confluence;
pub mod error;
pub mod layout;
pub mod listing;
pub mod pattern;
pub mod pipeline;
pub mod query;
pub mod report;
pub mod review;
pub mod store;
pub mod transform;

#[cfg(test)]
mod mock;
