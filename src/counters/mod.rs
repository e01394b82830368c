//! Event-counting measurements.

pub mod ring;
