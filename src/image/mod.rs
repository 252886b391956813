//! Firmware image formats.

pub mod merged;
