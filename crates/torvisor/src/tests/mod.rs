//! Test suites for the helper lifecycle.

#![expect(clippy::expect_used, reason = "tests use expect for clarity")]

mod controller_unit;
