#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod boxes;
pub mod config;
pub mod device;
pub mod graph;
pub mod image_list;
pub mod tensor;
pub mod types;
