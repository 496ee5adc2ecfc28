//! `AirPods` proximity advertisement handling.
//!
//! This module contains the AirPods-specific pieces of the pipeline:
//! advertisement recognition, candidate arbitration and payload decoding.

pub mod arbiter;
pub mod parser;
pub mod protocol;
pub mod recognition;
