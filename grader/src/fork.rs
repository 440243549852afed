use crate::{fork_child, image, spawn};
use abyss::{addressing::PAGE_SIZE, memlayout::USTACKTOP};
use core::fmt::Write;
use exokernel::{Machine, MachineConfig};
use ulib::{EnvStatus, Envid, Exokernel, KernelError, fork::pgfault};

#[validate_alloc]
pub fn stack_isolation() {
    let mut parent = spawn(&image("stack"));
    let x = USTACKTOP - 4;
    parent.write_u32(x, 1);
    let child = fork_child(&mut parent);
    assert_eq!(child.read_u32(x), 1);

    parent.write_u32(x, 2);
    child.write_u32(x, 3);
    assert_eq!(parent.read_u32(x), 2);
    assert_eq!(child.read_u32(x), 3);
}

#[validate_alloc]
pub fn data_isolation() {
    let img = image("data");
    let mut parent = spawn(&img);
    let x = img.data_start() + 0x10;
    let child = fork_child(&mut parent);

    child.write(x, b"child");
    let mut buf = [0; 5];
    parent.read(x, &mut buf);
    assert_eq!(&buf, &[0xab; 5]);

    parent.write(x, b"dad!!");
    child.read(x, &mut buf);
    assert_eq!(&buf, b"child");
    parent.read(x, &mut buf);
    assert_eq!(&buf, b"dad!!");
}

#[validate_alloc]
pub fn child_sees_its_own_thisenv() {
    let mut parent = spawn(&image("thisenv"));
    let id = parent.fork().unwrap();
    assert_ne!(id, Envid::CURRENT);
    assert_eq!(parent.lib().thisenv().id, parent.envid());

    let child = parent.resume_child(id).unwrap();
    let me = child.lib().thisenv();
    assert_eq!(me.id, id);
    assert_eq!(me.parent_id, parent.envid());
    assert_eq!(me.status, EnvStatus::Runnable);
    assert_eq!(child.lib().kernel().sys_getenvid(), id);
}

#[validate_alloc]
pub fn chain_fork() {
    let img = image("chain");
    let mut parent = spawn(&img);
    let x = img.bss_start();
    parent.write_u32(x, 1);
    let mut child = fork_child(&mut parent);
    child.write_u32(x, 2);
    let grandchild = fork_child(&mut child);
    assert_eq!(grandchild.read_u32(x), 2);

    grandchild.write_u32(x, 3);
    assert_eq!(parent.read_u32(x), 1);
    assert_eq!(child.read_u32(x), 2);
    assert_eq!(grandchild.read_u32(x), 3);
    assert_eq!(grandchild.lib().thisenv().parent_id, child.envid());
}

#[validate_alloc]
pub fn nested_fork() {
    let img = image("nested");
    let x = img.data_start();
    let mut p0 = spawn(&img);
    let mut p1 = fork_child(&mut p0);
    let p2 = fork_child(&mut p0);
    let p3 = fork_child(&mut p1);

    let procs = [&p0, &p1, &p2, &p3];
    for (i, p) in procs.iter().enumerate() {
        p.write_u32(x, 100 + i as u32);
    }
    for (i, p) in procs.iter().enumerate() {
        assert_eq!(p.read_u32(x), 100 + i as u32);
    }
    let ids = procs.map(|p| p.envid());
    for (i, id) in ids.iter().enumerate() {
        assert!(!ids[..i].contains(id));
    }
    assert_eq!(exokernel::current().env_count(), 4);
}

#[assert_output(
    b"child: 18
parent: 17
"
)]
pub fn forked_output() {
    let img = image("output");
    let x = img.data_start();
    let mut parent = spawn(&img);
    parent.write_u32(x, 17);
    let child = fork_child(&mut parent);

    let r = child.run(|c| {
        c.write_u32(x, c.read_u32(x) + 1);
        writeln!(c.lib().console(), "child: {}", c.read_u32(x))
    });
    assert_eq!(r, Ok(Ok(())));
    let r = parent.run(|p| writeln!(p.lib().console(), "parent: {}", p.read_u32(x)));
    assert_eq!(r, Ok(Ok(())));
    assert_eq!(exokernel::current().env_count(), 0);
}

pub fn failed_fork_leaves_nothing() {
    let img = image("oom");
    let (mut exofork_failures, mut populate_failures) = (0, 0);
    for frames in 2..64 {
        let machine = Machine::new(MachineConfig::builder().frames(frames).quiet(true).build());
        let Ok(mut parent) = machine.spawn(&img) else {
            continue;
        };
        if parent.lib_mut().set_pgfault_handler(pgfault).is_err() {
            continue;
        }
        let (frames_before, envs_before) = (machine.frames_in_use(), machine.env_count());
        match parent.fork() {
            Ok(child) => {
                assert!(machine.env(child).is_some());
                assert!(populate_failures > 0, "fork never failed while populating");
                assert!(exofork_failures > 0, "fork never failed creating the child");
                return;
            }
            Err(e) => {
                assert_eq!(e, KernelError::NoMemory);
                assert_eq!(machine.env_count(), envs_before);
                assert_eq!(machine.frames_in_use(), frames_before);
                if frames_before == frames - 1 {
                    exofork_failures += 1;
                } else {
                    populate_failures += 1;
                }
                // The parent is left intact.
                assert_eq!(parent.read_u32(img.data_start()), 0xabab_abab);
                assert_eq!(machine.pgfault_count(parent.envid()), 0);
            }
        }
    }
    panic!("fork never succeeded");
}

#[validate_alloc]
pub fn exited_processes_release_memory() {
    let img = image("exit").bss(4 * PAGE_SIZE);
    let mut parent = spawn(&img);
    let child = fork_child(&mut parent);
    let (parent_id, child_id) = (parent.envid(), child.envid());
    let machine = exokernel::current();

    assert_eq!(child.run(|c| c.write_u32(img.bss_start(), 9)), Ok(()));
    assert!(machine.env(child_id).is_none());
    assert_eq!(parent.read_u32(img.bss_start()), 0);
    assert_eq!(parent.run(|p| p.lib().exit()), Ok(Ok(())));
    assert!(machine.env(parent_id).is_none());
    assert_eq!(machine.frames_in_use(), 0);
}
