//! Test utilities.
//!
//! Test cases are plain functions. The driver runs each of them on its own
//! host thread with a freshly booted [`Machine`] installed as the thread's
//! current machine, and reports the result in the format of the `cargo test`
//! harness.

use crate::{Machine, MachineConfig};
use std::collections::BTreeSet;

#[doc(hidden)]
pub trait TestCase
where
    Self: Sync + Send,
{
    fn name(&'static self) -> &'static str;
    fn run(&'static self, config: MachineConfig) -> bool;
}

impl<T> TestCase for T
where
    T: Fn() + Send + Sync + 'static,
{
    fn name(&'static self) -> &'static str {
        core::any::type_name::<T>()
    }

    fn run(&'static self, config: MachineConfig) -> bool {
        std::print!("test {} ... ", core::any::type_name::<T>());
        let passed = std::thread::Builder::new()
            .name(core::any::type_name::<T>().to_string())
            .spawn(move || {
                crate::set_current(Some(Machine::new(config)));
                self();
                crate::set_current(None);
            })
            .map(|handle| handle.join().is_ok())
            .unwrap_or(false);
        if passed {
            std::println!("ok");
        } else {
            std::println!("FAILED");
        }
        passed
    }
}

/// A driver for running tests.
pub struct TestDriver {
    config: MachineConfig,
    filter: BTreeSet<String>,
}

impl TestDriver {
    /// A driver booting every test machine with `config`.
    ///
    /// Command line arguments that do not start with `-` select tests by
    /// name, without the crate prefix.
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            filter: std::env::args()
                .skip(1)
                .filter(|arg| !arg.starts_with('-'))
                .collect(),
        }
    }

    /// Run the given tests with the default configuration.
    ///
    /// Returns `true` if every test passed.
    pub fn start<const TC: usize>(tests: [&'static dyn TestCase; TC]) -> bool {
        Self::new(MachineConfig::default()).run(&tests)
    }

    /// Run the given tests.
    pub fn run(&self, tests: &[&'static dyn TestCase]) -> bool {
        let tests = tests
            .iter()
            .filter(|test| {
                if self.filter.is_empty() {
                    return true;
                }
                let name = test.name();
                let r = name.split("::").next().map(|n| n.len() + 2).unwrap_or(0);
                name.get(r..).is_some_and(|n| self.filter.contains(n))
            })
            .collect::<Vec<_>>();
        let (total, mut succ) = (tests.len(), 0);
        std::println!(
            "Running {} test{}",
            total,
            if total == 1 { "" } else { "s" }
        );

        for test in tests {
            if test.run(self.config) {
                succ += 1;
            }
        }
        std::println!(
            "test result: {}. {} passed; {} failed",
            if total == succ { "ok" } else { "FAILED" },
            succ,
            total - succ
        );
        total == succ
    }
}
