//! SIMI utilities

#[cfg(feature = "mmw")]
pub mod mmw;

#[cfg(feature = "syscall")]
pub mod syscall;

#[cfg(test)]
mod mock;
