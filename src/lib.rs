//! Introspection of guests running inside a full-system simulator.
//!
//! This crate re-exports the building blocks:
//!
//! - [`simi_core`]: the simulator interface, memory access, paging and
//!   event handling (re-exported at the top level)
//! - `arch_x86`, `arch_arm`: architecture definitions
//! - `os_linux`: Linux kernel layout discovery and task enumeration
//! - `utils`: syscall tracking and missing mapping watches

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use simi_core::*;

#[cfg(feature = "arch-arm")]
#[cfg_attr(docsrs, doc(cfg(feature = "arch-arm")))]
pub use simi_arch_arm as arch_arm;

#[cfg(feature = "arch-x86")]
#[cfg_attr(docsrs, doc(cfg(feature = "arch-x86")))]
pub use simi_arch_x86 as arch_x86;

#[cfg(feature = "os-linux")]
#[cfg_attr(docsrs, doc(cfg(feature = "os-linux")))]
pub use simi_os_linux as os_linux;

#[cfg(feature = "utils")]
#[cfg_attr(docsrs, doc(cfg(feature = "utils")))]
pub use simi_utils as utils;
