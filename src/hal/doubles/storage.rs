use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Error;
use crate::hal::storage::{ConfigBackend, StorageBackend};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FakeStorageError;

impl From<FakeStorageError> for Error {
    fn from(_: FakeStorageError) -> Self { Error::Storage("fake storage fault") }
}

/// In-memory NVM region. The memory is shared behind an `Rc` so a
/// "rebooted" instance created with [`FakeStorage::share`] observes the
/// bytes persisted by its predecessor.
pub struct FakeStorage {
    memory: Rc<RefCell<Vec<u8>>>,
    pub fail_begin_upgrade: bool,
    pub fail_end_upgrade: bool,
    pub fail_writes: bool,
    /// Fail this many upcoming erase calls.
    pub erase_faults: usize,
    /// Accept at most this many bytes per write call, to provoke
    /// short-write handling.
    pub write_capacity: Option<usize>,
    pub upgrade_in_progress: bool,
    /// `success` arguments of every `end_upgrade` call, in order.
    pub finalisations: Vec<bool>,
}

impl FakeStorage {
    pub fn new(size: usize) -> Self {
        Self::with_memory(Rc::new(RefCell::new(vec![0xFF; size])))
    }

    fn with_memory(memory: Rc<RefCell<Vec<u8>>>) -> Self {
        FakeStorage {
            memory,
            fail_begin_upgrade: false,
            fail_end_upgrade: false,
            fail_writes: false,
            erase_faults: 0,
            write_capacity: None,
            upgrade_in_progress: false,
            finalisations: Vec::new(),
        }
    }

    /// A new handle over the same memory, with fault injection reset.
    pub fn share(&self) -> Self { Self::with_memory(Rc::clone(&self.memory)) }

    /// Writes bytes directly, bypassing the backend interface.
    pub fn program(&mut self, offset: usize, bytes: &[u8]) {
        self.memory.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self) -> Vec<u8> { self.memory.borrow().clone() }

    fn size(&self) -> usize { self.memory.borrow().len() }
}

impl StorageBackend for FakeStorage {
    type Error = FakeStorageError;

    fn begin_upgrade(&mut self) -> Result<(), Self::Error> {
        if self.fail_begin_upgrade {
            return Err(FakeStorageError);
        }
        self.memory.borrow_mut().fill(0xFF);
        self.upgrade_in_progress = true;
        Ok(())
    }

    fn end_upgrade(&mut self, success: bool) -> Result<(), Self::Error> {
        self.upgrade_in_progress = false;
        self.finalisations.push(success);
        if self.fail_end_upgrade { Err(FakeStorageError) } else { Ok(()) }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<usize, Self::Error> {
        if self.fail_writes {
            return Err(FakeStorageError);
        }
        let accepted = match self.write_capacity {
            Some(capacity) => bytes.len().min(capacity),
            None => bytes.len(),
        };
        let accepted = accepted.min(self.size().saturating_sub(offset));
        self.memory.borrow_mut()[offset..offset + accepted].copy_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<usize, Self::Error> {
        let available = self.size().saturating_sub(offset);
        let count = bytes.len().min(available);
        bytes[..count].copy_from_slice(&self.memory.borrow()[offset..offset + count]);
        Ok(count)
    }
}

impl ConfigBackend for FakeStorage {
    type Error = FakeStorageError;

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if offset + bytes.len() > self.size() {
            return Err(FakeStorageError);
        }
        bytes.copy_from_slice(&self.memory.borrow()[offset..offset + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes || offset + bytes.len() > self.size() {
            return Err(FakeStorageError);
        }
        self.memory.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), Self::Error> {
        if self.erase_faults > 0 {
            self.erase_faults -= 1;
            return Err(FakeStorageError);
        }
        self.memory.borrow_mut().fill(0xFF);
        Ok(())
    }
}
