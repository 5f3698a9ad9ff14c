//! HTTP front end for the `routing` crate.

pub mod api;
pub mod config;
pub mod providers;
