//! DAB/DAB+ command-line receiver
//!
//! Tunes a sample source to an ensemble, drives an external decoding
//! library and writes the selected service as PCM to stdout, with labels,
//! DL-Plus tags and slideshow images saved alongside.

pub mod band;
pub mod config;
pub mod controller;
pub mod device;
pub mod engine;
pub mod sink;
pub mod state;
