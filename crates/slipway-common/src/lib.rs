//! Shared domain types for the slipway build-and-deploy pipeline.
//!
//! The worker crate and any front-end that persists Assembly/Image rows agree
//! on these shapes and on the artifact naming convention in [`naming`].

pub mod models;
pub mod naming;

pub use models::*;
