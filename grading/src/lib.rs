//! Attributes for grader test cases.
//!
//! - `#[assert_output(b"...")]` compares everything user programs printed on
//!   the test's machine with the given bytes once the test body returns.
//! - `#[validate_alloc]` destroys every environment left on the test's
//!   machine once the test body returns, and fails the test if a frame
//!   allocated during the body is still in use.
//!
//! Both run against the machine the [`TestDriver`](exokernel::TestDriver)
//! installed for the test.
#![no_std]

extern crate grading_derive;

pub use grading_derive::*;

/// Asserts that `$result`, the outcome of [`Process::run`], is an exit by
/// panic whose message contains `$needle`.
///
/// [`Process::run`]: exokernel::Process::run
#[macro_export]
macro_rules! assert_panicked {
    ($result:expr, $needle:expr) => {
        match $result {
            Err(exokernel::Exit::Panicked(msg)) => assert!(
                msg.contains($needle),
                "panic message {:?} does not mention {:?}",
                msg,
                $needle
            ),
            other => panic!("expected a panic mentioning {:?}, got {:?}", $needle, other),
        }
    };
}
