//! Low-level byte access shared by the IL decoder and encoder.

pub mod io;
pub mod parser;
