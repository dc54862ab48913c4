//! Smart fridge gateway library
//!
//! Turns button presses and proximity readings into camera captures,
//! classifies the frames and keeps the fridge inventory current.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
