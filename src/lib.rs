//! Distributed 2D heat-diffusion solver with dynamic load balancing and
//! domain redecomposition.

pub mod config;
pub mod dlb;
pub mod error;
pub mod kernel;
pub mod material;
pub mod output;
pub mod simulation;
