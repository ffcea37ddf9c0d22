//! Intermediate representations.
//!
//! SIR is the only one: a structured SIMT IR the OpenMP lowering emits
//! into and the simulator executes.

pub mod sir;
