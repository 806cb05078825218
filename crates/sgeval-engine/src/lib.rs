#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod accumulate;
pub mod cache;
pub mod collate;
pub mod driver;
pub mod inference;
pub mod model;
pub mod preprocess;
pub mod scores;
pub mod synthetic;
