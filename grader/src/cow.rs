use crate::{fork_child, image, spawn};
use abyss::{addressing::PAGE_SIZE, memlayout::USTACKTOP, paging::PteFlags, trap::UTrapframe};
use core::sync::atomic::{AtomicUsize, Ordering};
use exokernel::EnvHandle;
use ulib::fork::pgfault;

fn cow() -> PteFlags {
    PteFlags::P | PteFlags::U | PteFlags::COW
}

fn rw() -> PteFlags {
    PteFlags::P | PteFlags::U | PteFlags::W
}

#[validate_alloc]
pub fn shared_read_does_not_copy() {
    let img = image("share");
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let machine = exokernel::current();
    let (p, c) = (parent.envid(), child.envid());

    for va in [img.data_start(), img.bss_start(), USTACKTOP - PAGE_SIZE] {
        assert_eq!(parent.read_u32(va), child.read_u32(va));
        assert_eq!(machine.frame_of(p, va), machine.frame_of(c, va));
        assert!(machine.frame_of(p, va).is_some());
        assert_eq!(machine.pte_of(p, va).flags(), cow());
        assert_eq!(machine.pte_of(c, va).flags(), cow());
    }
    assert_eq!(machine.pgfault_count(p), 0);
    assert_eq!(machine.pgfault_count(c), 0);
}

#[validate_alloc]
pub fn write_after_shared_read() {
    let img = image("write");
    let x = img.data_start();
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let machine = exokernel::current();
    let (p, c) = (parent.envid(), child.envid());
    let shared = machine.frame_of(p, x);

    assert_eq!(child.read_u32(x), 0xabab_abab);
    parent.write_u32(x, 1);
    assert_eq!(machine.pgfault_count(p), 1);
    assert_eq!(machine.pgfault_count(c), 0);
    assert_eq!(child.read_u32(x), 0xabab_abab);

    // Only the writer's mapping moved.
    assert_ne!(machine.frame_of(p, x), shared);
    assert_eq!(machine.frame_of(c, x), shared);
    assert_eq!(machine.pte_of(p, x).flags(), rw());
    assert_eq!(machine.pte_of(c, x).flags(), cow());

    // Further writes to a private page do not fault.
    parent.write_u32(x + 4, 2);
    assert_eq!(machine.pgfault_count(p), 1);
    assert_eq!(parent.read_u32(x), 1);
}

#[validate_alloc]
pub fn copies_are_lazy() {
    let img = image("lazy").data(&[0x11; 4 * PAGE_SIZE]);
    let data = img.data_start();
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let machine = exokernel::current();

    // The first fault of each side also builds a page table for the
    // temporary mapping.
    parent.write_u32(img.bss_start(), 1);
    child.write_u32(img.bss_start(), 2);
    let frames = machine.frames_in_use();

    child.write_u32(data, 3);
    assert_eq!(machine.frames_in_use(), frames + 1);
    child.write_u32(data + 8, 3);
    assert_eq!(machine.frames_in_use(), frames + 1);
    child.write_u32(data + PAGE_SIZE, 3);
    assert_eq!(machine.frames_in_use(), frames + 2);
    // The last sharer of a frame copies it too, and the original is freed.
    parent.write_u32(data, 4);
    assert_eq!(machine.frames_in_use(), frames + 2);
    parent.write_u32(data + 2 * PAGE_SIZE, 4);
    assert_eq!(machine.frames_in_use(), frames + 3);

    assert_eq!(machine.pgfault_count(child.envid()), 3);
    assert_eq!(machine.pgfault_count(parent.envid()), 3);
    let untouched = data + 3 * PAGE_SIZE;
    assert_eq!(
        machine.frame_of(parent.envid(), untouched),
        machine.frame_of(child.envid(), untouched)
    );
    assert_eq!(parent.read_u32(data), 4);
    assert_eq!(child.read_u32(data), 3);
    assert_eq!(child.read_u32(data + 2 * PAGE_SIZE), 0x1111_1111);
}

#[validate_alloc]
pub fn readonly_pages_stay_shared() {
    let img = image("text");
    let text = img.text_start();
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let machine = exokernel::current();

    parent.write_u32(img.data_start(), 1);
    child.write_u32(img.data_start(), 2);
    for id in [parent.envid(), child.envid()] {
        assert_eq!(machine.pte_of(id, text).flags(), PteFlags::P | PteFlags::U);
    }
    assert_eq!(
        machine.frame_of(parent.envid(), text),
        machine.frame_of(child.envid(), text)
    );
    assert_eq!(child.read_u32(text), 0x9090_9090);
}

static COUNTED: AtomicUsize = AtomicUsize::new(0);

fn counting(kernel: &EnvHandle, utf: &UTrapframe) {
    COUNTED.fetch_add(1, Ordering::SeqCst);
    pgfault(kernel, utf)
}

#[validate_alloc]
pub fn parent_downgrade_faults() {
    COUNTED.store(0, Ordering::SeqCst);
    let img = image("downgrade");
    let x = img.data_start();
    let mut parent = spawn(&img);
    let machine = exokernel::current();
    assert_eq!(machine.pte_of(parent.envid(), x).flags(), rw());

    let child = fork_child(&mut parent);
    parent.lib_mut().set_pgfault_handler(counting).unwrap();
    // The parent lost write access to its own page.
    assert_eq!(machine.pte_of(parent.envid(), x).flags(), cow());

    parent.write_u32(x, 7);
    assert_eq!(COUNTED.load(Ordering::SeqCst), 1);
    assert_eq!(machine.pgfault_count(parent.envid()), 1);

    child.write_u32(x, 8);
    assert_eq!(COUNTED.load(Ordering::SeqCst), 1);
    assert_eq!(machine.pgfault_count(child.envid()), 1);
    assert_eq!(parent.read_u32(x), 7);
    assert_eq!(child.read_u32(x), 8);
}

#[validate_alloc]
pub fn concurrent_writers() {
    const WORDS: usize = PAGE_SIZE / 4;
    let img = image("race");
    let x = img.data_start();
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| {
            for i in 0..WORDS {
                parent.write_u32(x + 4 * i, i as u32);
            }
        });
        s.spawn(|_| {
            for i in 0..WORDS {
                child.write_u32(x + 4 * i, !(i as u32));
            }
        });
    })
    .unwrap();

    for i in 0..WORDS {
        assert_eq!(parent.read_u32(x + 4 * i), i as u32);
        assert_eq!(child.read_u32(x + 4 * i), !(i as u32));
    }
    let machine = exokernel::current();
    assert_eq!(machine.pgfault_count(parent.envid()), 1);
    assert_eq!(machine.pgfault_count(child.envid()), 1);
}
