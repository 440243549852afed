//! Grader for the copy-on-write `fork`.
//!
//! Every test boots a fresh machine, spawns a small program on it and forks
//! it through `ulib`. Tests run one after another; pass test names (without
//! the `fork_grader::` prefix) on the command line to select some of them.

#[macro_use]
extern crate grading;

pub mod cow;
pub mod fork;
pub mod pgfault;

use abyss::addressing::PAGE_SIZE;
use exokernel::{Process, ProgramImage, TestDriver};

/// A program with one page each of text, data and bss.
pub(crate) fn image(name: &'static str) -> ProgramImage {
    ProgramImage::new(name)
        .text(&[0x90; 16])
        .data(&[0xab; PAGE_SIZE])
        .bss(PAGE_SIZE)
}

/// Spawns `image` on the current machine.
pub(crate) fn spawn(image: &ProgramImage) -> Process {
    match exokernel::current().spawn(image) {
        Ok(p) => p,
        Err(e) => panic!("cannot spawn {}: {e}", image.name()),
    }
}

/// Forks `parent` and resumes the child.
pub(crate) fn fork_child(parent: &mut Process) -> Process {
    let child = parent.fork().expect("fork failed");
    parent.resume_child(child).expect("cannot resume the child")
}

pub fn run() -> bool {
    TestDriver::start([
        &fork::stack_isolation,
        &fork::data_isolation,
        &fork::child_sees_its_own_thisenv,
        &fork::chain_fork,
        &fork::nested_fork,
        &fork::forked_output,
        &fork::failed_fork_leaves_nothing,
        &fork::exited_processes_release_memory,
        &cow::shared_read_does_not_copy,
        &cow::write_after_shared_read,
        &cow::copies_are_lazy,
        &cow::readonly_pages_stay_shared,
        &cow::parent_downgrade_faults,
        &cow::concurrent_writers,
        &pgfault::write_to_readonly_page,
        &pgfault::read_of_unmapped_page,
        &pgfault::exception_stack_is_fresh,
        &pgfault::pftemp_is_released,
        &pgfault::shared_exception_stack_is_fatal,
    ])
}
