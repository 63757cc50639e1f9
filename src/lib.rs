pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod filter;
pub mod fs_util;
pub mod output;
pub mod pipeline;
pub mod store;
pub mod transfer;
