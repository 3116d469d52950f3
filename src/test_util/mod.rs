//! Utilities for testing code that uses groups. They are used by this crate's own tests, and
//!  they are exported for application tests as well.

pub mod recording;
