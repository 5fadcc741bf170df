//! Host-backed simulated device
//!
//! `SimulatedDevice` behaves like a fixed-size device pool: every block is
//! backed by host bytes, fresh blocks come back filled with a poison pattern
//! rather than zeros, and the free/total query reflects what is currently
//! reserved. Two knobs model other processes sharing the GPU:
//! [`SimulatedDevice::set_external_reserved`] removes capacity behind the
//! allocator's back and [`SimulatedDevice::fail_next_allocations`] makes the
//! next allocations fail even when capacity is reported free.

use std::collections::HashMap;
use std::sync::Mutex;

use super::device::{DeviceError, DeviceMemory, DevicePtr, DeviceResult};

/// Byte pattern written into freshly allocated blocks
pub const POISON_BYTE: u8 = 0xA5;

/// Address of the first block handed out
const BASE_ADDRESS: usize = 0x7f00_0000_0000;

/// Spacing between blocks so distinct allocations never share an address
const ADDRESS_ALIGNMENT: usize = 256;

#[derive(Debug, Default)]
struct SimState {
    next_addr: usize,
    blocks: HashMap<DevicePtr, Vec<u8>>,
    reserved: usize,
    external_reserved: usize,
    fail_next: usize,
    allocate_calls: u64,
    release_calls: u64,
    zero_calls: u64,
}

/// Device with a fixed capacity and host-side storage
#[derive(Debug)]
pub struct SimulatedDevice {
    capacity: usize,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(capacity: usize) -> Self {
        SimulatedDevice {
            capacity,
            state: Mutex::new(SimState {
                next_addr: BASE_ADDRESS,
                ..SimState::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held by live blocks
    pub fn reserved_bytes(&self) -> DeviceResult<usize> {
        Ok(self.state.lock()?.reserved)
    }

    /// Number of live blocks
    pub fn live_blocks(&self) -> DeviceResult<usize> {
        Ok(self.state.lock()?.blocks.len())
    }

    pub fn is_live(&self, ptr: DevicePtr) -> DeviceResult<bool> {
        Ok(self.state.lock()?.blocks.contains_key(&ptr))
    }

    /// Capacity taken by some other consumer of the device
    pub fn set_external_reserved(&self, bytes: usize) -> DeviceResult<()> {
        self.state.lock()?.external_reserved = bytes;
        Ok(())
    }

    /// Make the next `count` allocations fail regardless of capacity
    pub fn fail_next_allocations(&self, count: usize) -> DeviceResult<()> {
        self.state.lock()?.fail_next = count;
        Ok(())
    }

    pub fn allocate_calls(&self) -> DeviceResult<u64> {
        Ok(self.state.lock()?.allocate_calls)
    }

    pub fn release_calls(&self) -> DeviceResult<u64> {
        Ok(self.state.lock()?.release_calls)
    }

    pub fn zero_calls(&self) -> DeviceResult<u64> {
        Ok(self.state.lock()?.zero_calls)
    }

    /// Copy a whole block back to the host
    pub fn read(&self, ptr: DevicePtr) -> DeviceResult<Vec<u8>> {
        let state = self.state.lock()?;
        state
            .blocks
            .get(&ptr)
            .cloned()
            .ok_or(DeviceError::UnknownPointer(ptr))
    }

    /// Copy host bytes into a block starting at `offset`
    pub fn write(&self, ptr: DevicePtr, offset: usize, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock()?;
        let block = state
            .blocks
            .get_mut(&ptr)
            .ok_or(DeviceError::UnknownPointer(ptr))?;

        let end = offset.checked_add(data.len()).filter(|end| *end <= block.len());
        match end {
            Some(end) => {
                block[offset..end].copy_from_slice(data);
                Ok(())
            }
            None => Err(DeviceError::CopyFailed(format!(
                "write of {} bytes at offset {} overruns block {} of {} bytes",
                data.len(),
                offset,
                ptr,
                block.len()
            ))),
        }
    }
}

impl DeviceMemory for SimulatedDevice {
    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr> {
        let mut state = self.state.lock()?;
        state.allocate_calls += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DeviceError::AllocationFailed {
                size,
                reason: "injected failure".to_string(),
            });
        }

        let in_use = state.reserved + state.external_reserved;
        if in_use.saturating_add(size) > self.capacity {
            return Err(DeviceError::AllocationFailed {
                size,
                reason: format!(
                    "out of memory ({} of {} bytes in use)",
                    in_use, self.capacity
                ),
            });
        }

        let ptr = DevicePtr::from_addr(state.next_addr);
        let stride = size.max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        state.next_addr += stride;
        state.blocks.insert(ptr, vec![POISON_BYTE; size]);
        state.reserved += size;

        tracing::trace!(%ptr, size, "simulated device allocation");
        Ok(ptr)
    }

    fn release(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock()?;
        state.release_calls += 1;
        let block = state
            .blocks
            .remove(&ptr)
            .ok_or(DeviceError::UnknownPointer(ptr))?;
        state.reserved -= block.len();
        Ok(())
    }

    fn zero(&self, ptr: DevicePtr, size: usize) -> DeviceResult<()> {
        let mut state = self.state.lock()?;
        state.zero_calls += 1;
        let block = state
            .blocks
            .get_mut(&ptr)
            .ok_or(DeviceError::UnknownPointer(ptr))?;
        if size > block.len() {
            return Err(DeviceError::ZeroFailed {
                ptr,
                size,
                reason: format!("block holds only {} bytes", block.len()),
            });
        }
        block[..size].fill(0);
        Ok(())
    }

    fn query_free_and_total(&self) -> DeviceResult<(usize, usize)> {
        let state = self.state.lock()?;
        let free = self
            .capacity
            .saturating_sub(state.reserved + state.external_reserved);
        Ok((free, self.capacity))
    }
}
