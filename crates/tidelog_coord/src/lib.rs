//! Coordination-ensemble client crate.
//!
//! This crate provides the client capability set the tidelog epoch store
//! consumes to talk to its coordination ensemble. The API surface is
//! intentionally small: higher layers supply a `CoordClientFactory`, then
//! drive versioned reads, conditional sets, and atomic multi-ops through
//! `CoordClient`. An in-process ensemble is included for tests and tooling.

pub mod coord;
