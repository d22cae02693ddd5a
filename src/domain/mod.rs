//! Domain Layer
//!
//! Pure types, ports and services of the distribution fabric. Nothing in
//! here performs I/O.

pub mod entities;
pub mod error;
pub mod ports;
pub mod services;
pub mod value_objects;
