/// Scoped memory reservation held for the lifetime of a launch
use crate::types::AllocationError;
use log::debug;

/// Hands out a reservation whose drop releases the memory
pub trait Reserver {
    type Handle;

    fn reserve(&mut self, bytes: u64) -> Result<Self::Handle, AllocationError>;
}

/// Reserves from the process heap in a single allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapReserver;

impl Reserver for HeapReserver {
    type Handle = Reservation;

    fn reserve(&mut self, bytes: u64) -> Result<Reservation, AllocationError> {
        Reservation::new(bytes)
    }
}

/// A fixed-size block of address space. The pages are not touched until written.
#[derive(Debug)]
pub struct Reservation {
    buf: Vec<u8>,
    size: usize,
}

impl Reservation {
    pub fn new(bytes: u64) -> Result<Self, AllocationError> {
        let oom = AllocationError::OutOfMemory { requested: bytes };
        let size = usize::try_from(bytes).map_err(|_| oom.clone())?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| oom)?;
        debug!("Allocated {} bytes of memory", size);

        Ok(Self { buf, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.size - self.buf.len()
    }

    /// Append `data` after the bytes already written. Never grows the block.
    pub fn write(&mut self, data: &[u8]) -> Result<(), AllocationError> {
        if data.len() > self.remaining() {
            return Err(AllocationError::InsufficientSpace {
                requested: data.len(),
                available: self.remaining(),
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// The written prefix, or `None` if nothing has been written yet.
    pub fn read(&self) -> Option<&[u8]> {
        if self.buf.is_empty() {
            None
        } else {
            Some(&self.buf)
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        debug!("Released {} bytes of reserved memory", self.size);
    }
}
