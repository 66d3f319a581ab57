//! Mock filesystem and fixture scenarios for reader tests.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
