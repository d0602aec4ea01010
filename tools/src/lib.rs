//! # Ember Tools
//!
//! Offline preprocessing for Ember assets.
//!
//! - [`env_map_gen`] - Irradiance and prefiltered environment maps from an
//!   equirectangular source image

pub mod env_map_gen;
