//! A process is an address space shared by a group of threads.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::memory::Pageable;

// ── Process identifiers ─────────────────────────────────────────

/// Monotonically increasing PID counter.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique PID.
fn alloc_pid() -> u64 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

pub struct Process {
    pid: u64,
    kernel: &'static Kernel,
    pageable: Pageable,
}

impl Process {
    /// Creates an empty address space with the kernel half already mapped.
    pub fn new(kernel: &'static Kernel) -> Result<Arc<Process>> {
        let pageable = Pageable::new(kernel.machine())?;
        kernel.pager().add_pageable(&pageable)?;

        let process = Process {
            pid: alloc_pid(),
            kernel,
            pageable,
        };
        log::info!(
            "process {} created (directory {:?})",
            process.pid,
            process.pageable.directory()
        );
        Ok(Arc::new(process))
    }

    pub fn id(&self) -> u64 {
        self.pid
    }

    pub fn pageable(&self) -> &Pageable {
        &self.pageable
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("directory", &self.pageable.directory())
            .finish()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Err(err) = self.kernel.pager().remove_pageable(&self.pageable) {
            log::warn!("process {}: {}", self.pid, err);
        }
        log::info!("process {} destroyed", self.pid);
    }
}
