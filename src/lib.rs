//! Loader for PE/COFF and TE executable images in firmware environments.
//!
//! The crate pulls image bytes through a caller-supplied [`ImageSource`],
//! interprets the PE/COFF (or Terse Executable) headers, copies the image
//! into a caller-provided buffer, and applies base relocations so the
//! image can run away from its link-time base. See [`ImageContext`] for
//! the three-phase flow.

#![no_std]

#[cfg(feature = "std")]
mod alloc_containers {
    pub extern crate std;
    pub use std::vec;
}
#[cfg(not(feature = "std"))]
mod alloc_containers {
    extern crate alloc;
    pub use alloc::vec;
}

pub(crate) use alloc_containers::*;

pub mod error;
pub mod io;
pub mod loader;
pub mod pe;

pub use error::{ImageError, PeloadError};
pub use io::ImageSource;
pub use loader::{FixupLog, ImageContext};
pub use pe::coff::MachineType;
pub use pe::optional_header::ImageSubsystem;
