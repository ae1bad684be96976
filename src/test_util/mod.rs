//! This module contains utilities that are useful for testing code built on the switching
//!  and multicast core. They are used for testing the core itself, but they are also
//!  exported for application testing: deterministic constructors for addresses and groups,
//!  and recording test doubles for the collaborator traits.
//!
//! Making test utilities part of the crate's regular (non-#[cfg(test)]) code is what allows
//!  third-party crates to use them at all.

pub mod peer;
pub mod topology;
