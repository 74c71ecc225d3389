// src/bindings/mod.rs
pub mod python;
