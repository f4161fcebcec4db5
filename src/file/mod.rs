//! Low-level byte access.

pub mod io;
