//! Integration test crate for VidSeek.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the engine front-ends over the synthetic media backend.

#[cfg(test)]
mod seek;

#[cfg(test)]
mod session;

#[cfg(test)]
mod cache;

#[cfg(test)]
mod threaded;
