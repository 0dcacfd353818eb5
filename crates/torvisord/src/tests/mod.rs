//! Test suites for the daemon composition root.

#![expect(clippy::expect_used, reason = "tests use expect for clarity")]

mod daemon_behaviour;
mod support;
mod unit;
