//! Integration test modules

mod lifecycle;
mod ordering;
mod scenarios;
