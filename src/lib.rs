// src/lib.rs

//! Bike-share ingestion library.
//!
//! Loads monthly historical trip exports into a deduplicated trip log,
//! samples the real-time station feed into snapshots, and crawls supporting
//! content, all behind one shared rate, concurrency and retry policy.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod throttle;
pub mod utils;
