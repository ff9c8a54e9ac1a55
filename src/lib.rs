//! slipway: a build-and-deploy worker.
//!
//! A job clones an application's repository, runs its unit tests and builds
//! it on top of a language pack image, persists the result to Swift or a
//! Docker registry, and hands it to the [`deploy`] engine, which provisions a
//! Heat stack for it. Progress is tracked as Assembly status in the metadata
//! [`store`].

pub mod clone;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod errors;
pub mod image;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod store;
pub mod workdir;
