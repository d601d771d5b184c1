//! Platform primitives: the only layer that issues kernel debug calls.
//!
//! One implementation per OS behind this seam, selected at compile time.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::*;
