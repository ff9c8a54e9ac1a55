//! Image building: generated Dockerfiles and the retrying builder.

pub mod builder;
pub mod dockerfile;

pub use builder::ImageBuilder;
