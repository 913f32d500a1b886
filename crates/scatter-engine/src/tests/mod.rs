//! Tests for the scatter-engine crate.

mod helpers;

mod basic;
