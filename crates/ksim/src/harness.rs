//! Helpers for driving a booted kernel from tests.

use std::sync::Arc;

use nutshell::error::Result;
use nutshell::task::{Channel, Priority, Process, Thread};
use nutshell::{Kernel, KernelConfig};

use crate::machine::SimMachine;
use crate::logger;

/// A booted kernel whose boot context has become the first thread.
pub struct Sim {
    pub machine: &'static SimMachine,
    pub kernel: &'static Kernel,
    /// Process the boot thread runs in.
    pub process: Arc<Process>,
    pub boot: Arc<Thread>,
}

/// Starts a machine with `memory_size` bytes, boots the kernel and adopts
/// the calling host thread as a `Normal` thread.
pub fn boot(memory_size: usize, config: KernelConfig) -> Sim {
    boot_on(SimMachine::new(memory_size), config)
}

pub fn boot_on(machine: SimMachine, config: KernelConfig) -> Sim {
    logger::init();
    let machine = machine.start();
    let kernel = match Kernel::boot(machine, config) {
        Ok(kernel) => kernel,
        Err(err) => panic!("kernel failed to boot: {}", err),
    };
    let process = match kernel.create_process() {
        Ok(process) => process,
        Err(err) => panic!("boot process: {}", err),
    };
    machine.set_boot_directory(process.pageable().directory());
    let boot = kernel.adopt_boot_thread(&process, Priority::Normal);
    Sim {
        machine,
        kernel,
        process,
        boot,
    }
}

type Job = Box<dyn FnOnce() + Send>;

fn run_job(argument: usize) {
    // SAFETY: `argument` is the pointer `spawn` leaked for this task, and
    // the task runs its entry point exactly once.
    let job = unsafe { Box::from_raw(argument as *mut Job) };
    job();
}

/// Where finished jobs sleep. Nothing ever wakes this channel.
static RETIRED: u8 = 0;

/// Spawns a thread that runs `body` and then sleeps for good.
pub fn spawn<F>(
    kernel: &'static Kernel,
    process: &Arc<Process>,
    priority: Priority,
    body: F,
) -> Result<Arc<Thread>>
where
    F: FnOnce() + Send + 'static,
{
    let job: Job = Box::new(move || {
        body();
        loop {
            kernel.scheduler().sleep(Channel::of(&RETIRED), 0, None);
        }
    });
    let argument = Box::into_raw(Box::new(job)) as usize;
    kernel
        .spawn(process, run_job, argument, priority)
        .inspect_err(|_| {
            // SAFETY: the task was never created, so nothing else owns it.
            drop(unsafe { Box::from_raw(argument as *mut Job) });
        })
}

/// Switches until `done` holds, giving up after `limit` switches.
pub fn run_until(kernel: &Kernel, limit: usize, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..limit {
        if done() {
            return true;
        }
        kernel.clock();
    }
    done()
}

/// Writes `value` at `address` in the running task's address space,
/// resolving at most one page fault on the way.
pub fn store(sim: &Sim, address: usize, value: u8) -> Result<()> {
    let directory = current_directory(sim);
    if let Err(fault) = sim.machine.write_u8(directory, address, value) {
        sim.kernel.page_fault(fault.address)?;
        if sim.machine.write_u8(directory, address, value).is_err() {
            panic!("fault at {:#010x} persisted after the pager resolved it", address);
        }
    }
    Ok(())
}

/// Reads the byte at `address`, resolving at most one page fault.
pub fn load(sim: &Sim, address: usize) -> Result<u8> {
    let directory = current_directory(sim);
    match sim.machine.read_u8(directory, address) {
        Ok(value) => Ok(value),
        Err(fault) => {
            sim.kernel.page_fault(fault.address)?;
            match sim.machine.read_u8(directory, address) {
                Ok(value) => Ok(value),
                Err(_) => panic!("fault at {:#010x} persisted after the pager resolved it", address),
            }
        }
    }
}

fn current_directory(sim: &Sim) -> nutshell::arch::DirectoryId {
    match sim.machine.current_directory() {
        Some(directory) => directory,
        None => panic!("the running task has no address space"),
    }
}
