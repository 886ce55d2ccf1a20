//! Minimal single-task machine for unit tests.
//!
//! Page tables are plain vectors of entries, tasks never actually run, and
//! the boot mapping places the kernel image right above 1 MiB.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use crate::arch::{
    DirectoryId, Machine, TableId, TaskId, ThreadEntry, KERNEL_LOAD_ADDRESS, KERNEL_SPACE_BOUNDARY,
    PAGE_SIZE, PAGE_TABLE_CAPACITY,
};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    pub frame: usize,
    pub present: bool,
    pub accessed: bool,
    pub dirty: bool,
}

#[derive(Default)]
struct State {
    tables: Vec<Option<Vec<Entry>>>,
    directories: Vec<Option<Vec<Option<TableId>>>>,
    zeroed: BTreeSet<usize>,
    invalidated: Vec<usize>,
    next_task: usize,
}

pub struct FakeMachine {
    memory_size: usize,
    interrupts: AtomicBool,
    current: AtomicUsize,
    state: Mutex<State>,
}

impl FakeMachine {
    pub const BOOT_TASK: TaskId = TaskId(1);

    pub fn new(memory_size: usize) -> Self {
        Self {
            memory_size,
            interrupts: AtomicBool::new(true),
            current: AtomicUsize::new(Self::BOOT_TASK.0),
            state: Mutex::new(State {
                next_task: 2,
                ..State::default()
            }),
        }
    }

    /// Leaks a machine so it can back a `&'static` kernel.
    pub fn leak(memory_size: usize) -> &'static Self {
        Box::leak(Box::new(Self::new(memory_size)))
    }

    pub fn set_current_task(&self, task: TaskId) {
        self.current.store(task.0, Ordering::Relaxed);
    }

    pub fn entry(&self, table: TableId, page: usize) -> Entry {
        let state = self.state.lock().unwrap();
        state.tables[table.0].as_ref().unwrap()[page]
    }

    /// Simulates the processor touching a mapped page.
    pub fn touch(&self, table: TableId, page: usize, write: bool) {
        let mut state = self.state.lock().unwrap();
        let entry = &mut state.tables[table.0].as_mut().unwrap()[page];
        assert!(entry.present, "touching a page that is not present");
        entry.accessed = true;
        entry.dirty |= write;
    }

    pub fn table_at(&self, directory: DirectoryId, index: usize) -> Option<TableId> {
        let state = self.state.lock().unwrap();
        state.directories[directory.0].as_ref().unwrap()[index]
    }

    pub fn was_zeroed(&self, frame: usize) -> bool {
        self.state.lock().unwrap().zeroed.contains(&frame)
    }

    pub fn invalidated(&self) -> Vec<usize> {
        self.state.lock().unwrap().invalidated.clone()
    }

    pub fn live_tables(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.tables.iter().filter(|t| t.is_some()).count()
    }
}

impl Machine for FakeMachine {
    fn memory_size(&self) -> usize {
        self.memory_size
    }

    fn disable_interrupts(&self) -> bool {
        self.interrupts.swap(false, Ordering::Relaxed)
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::Relaxed);
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed)
    }

    fn current_task(&self) -> TaskId {
        TaskId(self.current.load(Ordering::Relaxed))
    }

    fn allocate_task(&self, _: DirectoryId, _: usize, _: ThreadEntry, _: usize) -> Result<TaskId> {
        let mut state = self.state.lock().unwrap();
        let task = TaskId(state.next_task);
        state.next_task += 1;
        Ok(task)
    }

    fn release_task(&self, _task: TaskId) {}

    fn switch_to_task(&self, task: TaskId) {
        panic!("the fake machine cannot run task {:?}", task);
    }

    fn allocate_page_directory(&self) -> Result<DirectoryId> {
        let mut state = self.state.lock().unwrap();
        state.directories.push(Some(vec![None; PAGE_TABLE_CAPACITY]));
        Ok(DirectoryId(state.directories.len() - 1))
    }

    fn release_page_directory(&self, directory: DirectoryId) {
        self.state.lock().unwrap().directories[directory.0] = None;
    }

    fn allocate_page_table(&self) -> Result<TableId> {
        let mut state = self.state.lock().unwrap();
        state.tables.push(Some(vec![Entry::default(); PAGE_TABLE_CAPACITY]));
        Ok(TableId(state.tables.len() - 1))
    }

    fn release_page_table(&self, table: TableId) {
        self.state.lock().unwrap().tables[table.0] = None;
    }

    fn map_table_to_directory(&self, directory: DirectoryId, table: TableId, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.directories[directory.0].as_mut().unwrap()[index] = Some(table);
    }

    fn unmap_table_from_directory(&self, directory: DirectoryId, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.directories[directory.0].as_mut().unwrap()[index] = None;
    }

    fn map_page_to_frame(&self, table: TableId, page: usize, frame: usize) {
        let mut state = self.state.lock().unwrap();
        state.tables[table.0].as_mut().unwrap()[page] = Entry {
            frame,
            present: true,
            accessed: false,
            dirty: false,
        };
    }

    fn unmap_page(&self, table: TableId, page: usize) {
        let mut state = self.state.lock().unwrap();
        state.tables[table.0].as_mut().unwrap()[page] = Entry::default();
    }

    fn reset_page_accessed(&self, table: TableId, page: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry = &mut state.tables[table.0].as_mut().unwrap()[page];
        core::mem::replace(&mut entry.accessed, false)
    }

    fn page_dirty(&self, table: TableId, page: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.tables[table.0].as_ref().unwrap()[page].dirty
    }

    fn invalidate_tlb_entry(&self, address: usize) {
        self.state.lock().unwrap().invalidated.push(address);
    }

    fn physical_address(&self, address: usize) -> usize {
        KERNEL_LOAD_ADDRESS + (address - KERNEL_SPACE_BOUNDARY)
    }

    fn zero_frame(&self, frame: usize) {
        assert!(frame * PAGE_SIZE < self.memory_size);
        self.state.lock().unwrap().zeroed.insert(frame);
    }
}
