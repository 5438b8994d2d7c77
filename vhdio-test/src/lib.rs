//! Helpers shared by the tests and the fixture generator of `vhdio`.
pub mod build;
