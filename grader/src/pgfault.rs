use crate::{fork_child, image, spawn};
use abyss::{
    addressing::{NPTENTRIES, PAGE_SIZE, Va},
    memlayout::{PFTEMP, UTOP_PDX, UXSTACKTOP},
    paging::PteFlags,
    trap::{PFErrorCode, UTrapframe},
};
use exokernel::Exit;
use ulib::{
    EnvStatus, Exokernel,
    fork::{duppage, pgfault},
};

#[validate_alloc]
pub fn write_to_readonly_page() {
    let img = image("rdonly");
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let sibling = fork_child(&mut parent);
    let child_id = child.envid();
    let machine = exokernel::current();

    let r = child.run(|c| c.write_u32(img.text_start(), 0xdead_beef));
    assert_panicked!(r, "is not copy-on-write");
    assert!(machine.env(child_id).is_none());

    assert_eq!(parent.read_u32(img.text_start()), 0x9090_9090);
    assert_eq!(sibling.read_u32(img.text_start()), 0x9090_9090);
    sibling.write_u32(img.data_start(), 1);
    assert_eq!(parent.read_u32(img.data_start()), 0xabab_abab);
}

#[validate_alloc]
pub fn read_of_unmapped_page() {
    let mut parent = spawn(&image("unmapped"));
    let child = fork_child(&mut parent);
    let r = child.run(|c| c.read_u32(Va::from_u32(0x1000_0000)));
    assert_panicked!(r, "is not a write");
    assert_eq!(exokernel::current().env_count(), 1);
}

#[validate_alloc]
pub fn exception_stack_is_fresh() {
    let img = image("xstack");
    let xstack = UXSTACKTOP - PAGE_SIZE;
    let mut parent = spawn(&img);
    parent.lib_mut().set_pgfault_handler(pgfault).unwrap();
    parent.write(xstack, &[0x5a; PAGE_SIZE]);

    let child = fork_child(&mut parent);
    let machine = exokernel::current();
    assert_ne!(
        machine.frame_of(parent.envid(), xstack),
        machine.frame_of(child.envid(), xstack)
    );
    for id in [parent.envid(), child.envid()] {
        assert_eq!(
            machine.pte_of(id, xstack).flags(),
            PteFlags::P | PteFlags::U | PteFlags::W
        );
    }
    assert_eq!(child.read_u32(xstack), 0);

    child.write_u32(img.data_start(), 1);
    let mut frame = [0; UTrapframe::SIZE];
    child.read(UXSTACKTOP - UTrapframe::SIZE, &mut frame);
    let utf = UTrapframe::from_bytes(&frame).unwrap();
    let write_fault = PFErrorCode::WRITE_ACCESS | PFErrorCode::USER;
    assert_eq!(utf.fault_va().page_down(), img.data_start());
    assert!(utf.err().contains(write_fault));

    let mut page = [0; PAGE_SIZE];
    parent.read(xstack, &mut page);
    assert!(page.iter().all(|&b| b == 0x5a));

    // The other way around: the parent's fault leaves the child's stack alone.
    child.write(xstack, &[0xc3; PAGE_SIZE]);
    parent.write_u32(img.data_start(), 2);
    child.read(xstack, &mut page);
    assert!(page.iter().all(|&b| b == 0xc3));

    parent.read(UXSTACKTOP - UTrapframe::SIZE, &mut frame);
    let utf = UTrapframe::from_bytes(&frame).unwrap();
    assert_eq!(utf.fault_va().page_down(), img.data_start());
    assert!(utf.err().contains(write_fault));
    parent.read(xstack, &mut page);
    let below_frame = &page[..PAGE_SIZE - UTrapframe::SIZE];
    assert!(below_frame.iter().all(|&b| b == 0x5a));
    assert_eq!(machine.pgfault_count(parent.envid()), 1);
    assert_eq!(machine.pgfault_count(child.envid()), 1);
}

#[validate_alloc]
pub fn pftemp_is_released() {
    let img = image("pftemp");
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let machine = exokernel::current();

    child.write_u32(img.data_start(), 1);
    parent.write_u32(img.bss_start(), 2);
    for id in [parent.envid(), child.envid()] {
        assert!(!machine.pte_of(id, PFTEMP).is_present());
    }
}

/// Sharing the exception stack copy-on-write leaves neither side able to
/// take a page fault.
#[validate_alloc]
pub fn shared_exception_stack_is_fatal() {
    let img = image("badfork");
    let x = img.data_start();
    let mut parent = spawn(&img);
    parent.lib_mut().set_pgfault_handler(pgfault).unwrap();

    let kernel = parent.lib().kernel();
    let id = kernel.sys_exofork().unwrap();
    for pdx in 0..UTOP_PDX {
        if !kernel.uvpd(pdx).is_present() {
            continue;
        }
        for ptx in 0..NPTENTRIES {
            let va = Va::from_indices(pdx, ptx, 0);
            if kernel.uvpt(va.pgnum()).is_present() {
                duppage(kernel, id, va.pgnum()).unwrap();
            }
        }
    }
    kernel
        .sys_env_set_pgfault_upcall(id, kernel.upcall_entry())
        .unwrap();
    kernel.sys_env_set_status(id, EnvStatus::Runnable).unwrap();

    let machine = exokernel::current();
    let xstack = UXSTACKTOP - PAGE_SIZE;
    let pte = machine.pte_of(parent.envid(), xstack);
    assert!(pte.flags().contains(PteFlags::COW));

    let child = parent.resume_child(id).unwrap();
    assert_eq!(child.run(|c| c.write_u32(x, 1)), Err(Exit::Killed));
    assert_eq!(parent.run(|p| p.write_u32(x, 2)), Err(Exit::Killed));
    assert_eq!(machine.env_count(), 0);
}
