//! Shared utilities: aligned buffers, clocks, temp directories, logging

pub mod buffer;
pub mod logging;
pub mod time;
pub mod tmpdir;
