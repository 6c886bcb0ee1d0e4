//! Shared types for the genstore generation store.
//!
//! This crate provides the pieces every genstore crate agrees on:
//! - [`Handle`] and [`GenId`], the packed addressing scheme for stored items
//! - Store configuration with validating builders ([`config::StoreConfig`])

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handle;

pub use handle::{GenId, Handle};
