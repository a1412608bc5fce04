//! Host-initiated writes into linear memory.
//!
//! Every byte the host places in guest memory goes through a [`Marshaler`]:
//! it asks the module's allocator for a span, bounds-checks the returned
//! offset, copies the payload, and records the allocation.
//!
//! Allocations are either [`AllocationScope::Persistent`] (the bootstrap argv,
//! which the runtime keeps pointers into forever) or
//! [`AllocationScope::Scratch`] (per-call buffers, released after the call
//! when the module exports a deallocator).

use tracing::{debug, warn};

use crate::backend::ModuleInstance;
use pandoc_unwasm_common::RuntimeError;

/// Lifetime of a host-initiated allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationScope {
    /// Must stay valid for the life of the instance.
    Persistent,
    /// Only needed for the duration of one call.
    Scratch,
}

/// One span handed out by the module's allocator on the host's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Offset in linear memory.
    pub offset: u32,
    /// Number of bytes requested.
    pub len: u32,
    /// Lifetime of the span.
    pub scope: AllocationScope,
}

/// Ordered list of live host-initiated allocations.
#[derive(Debug, Clone, Default)]
pub struct AllocationRecord {
    entries: Vec<Allocation>,
}

impl AllocationRecord {
    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offsets in allocation order.
    pub fn offsets(&self) -> Vec<u32> {
        self.entries.iter().map(|a| a.offset).collect()
    }

    /// Iterate over the recorded allocations.
    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.entries.iter()
    }

    /// Total bytes held by live allocations.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|a| u64::from(a.len)).sum()
    }
}

/// Writes host data into linear memory through the module's allocator.
#[derive(Debug, Default)]
pub struct Marshaler {
    record: AllocationRecord,
}

impl Marshaler {
    /// Create a marshaler with an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocations made so far and not yet released.
    pub fn record(&self) -> &AllocationRecord {
        &self.record
    }

    /// Allocate `len` bytes and record the span.
    ///
    /// A zero-length request still allocates one byte so the offset is unique.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::OutOfMemory` if `len` exceeds the linear memory limit,
    ///   or the allocator returned null while memory cannot grow by `len`
    /// - `RuntimeError::Allocation` for any other null or out-of-bounds result
    /// - `RuntimeError::RuntimeTrap` if the allocator traps
    pub async fn allocate(
        &mut self,
        instance: &mut dyn ModuleInstance,
        len: usize,
        scope: AllocationScope,
    ) -> Result<u32, RuntimeError> {
        let limit = instance.memory_limit();
        let out_of_memory = RuntimeError::OutOfMemory {
            requested: len,
            limit_bytes: limit,
        };
        if len as u64 > limit {
            return Err(out_of_memory);
        }
        let size = u32::try_from(len.max(1)).map_err(|_| out_of_memory.clone())?;

        let offset = instance.allocate(size).await?;
        if offset == 0 {
            if instance.memory_size() + u64::from(size) > limit {
                warn!(requested = len, limit_bytes = limit, "Allocator exhausted linear memory");
                return Err(out_of_memory);
            }
            return Err(RuntimeError::allocation(len, "allocator returned null"));
        }
        if u64::from(offset) + u64::from(size) > instance.memory_size() {
            return Err(RuntimeError::allocation(
                len,
                format!("allocator returned span at {offset} outside linear memory"),
            ));
        }

        self.record.entries.push(Allocation {
            offset,
            len: size,
            scope,
        });
        Ok(offset)
    }

    /// Copy `bytes` into a fresh allocation.
    ///
    /// Returns the offset and length of the written span.
    pub async fn write_bytes(
        &mut self,
        instance: &mut dyn ModuleInstance,
        bytes: &[u8],
        scope: AllocationScope,
    ) -> Result<(u32, u32), RuntimeError> {
        let offset = self.allocate(instance, bytes.len(), scope).await?;
        instance.write_memory(offset, bytes)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| RuntimeError::allocation(bytes.len(), "length exceeds 32 bits"))?;
        Ok((offset, len))
    }

    /// Encode `text` as UTF-8 into a fresh allocation (no terminator).
    ///
    /// Returns the offset and byte length.
    pub async fn write_string(
        &mut self,
        instance: &mut dyn ModuleInstance,
        text: &str,
        scope: AllocationScope,
    ) -> Result<(u32, u32), RuntimeError> {
        self.write_bytes(instance, text.as_bytes(), scope).await
    }

    /// Encode `text` as a NUL-terminated C string.
    pub async fn write_c_string(
        &mut self,
        instance: &mut dyn ModuleInstance,
        text: &str,
        scope: AllocationScope,
    ) -> Result<u32, RuntimeError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let (offset, _) = self.write_bytes(instance, &bytes, scope).await?;
        Ok(offset)
    }

    /// Store a little-endian `u32` in a fresh 4-byte allocation.
    pub async fn write_u32(
        &mut self,
        instance: &mut dyn ModuleInstance,
        value: u32,
        scope: AllocationScope,
    ) -> Result<u32, RuntimeError> {
        let (offset, _) = self.write_bytes(instance, &value.to_le_bytes(), scope).await?;
        Ok(offset)
    }

    /// Lay out `args` the way a C `main` expects them and return pointers to
    /// the `argc` cell and to a cell holding the `argv` array address.
    ///
    /// The array holds one pointer per NUL-terminated string followed by a
    /// null entry. Everything is allocated as persistent.
    pub async fn write_argv(
        &mut self,
        instance: &mut dyn ModuleInstance,
        args: &[String],
    ) -> Result<(u32, u32), RuntimeError> {
        let scope = AllocationScope::Persistent;
        let argc = u32::try_from(args.len())
            .map_err(|_| RuntimeError::allocation(args.len(), "too many arguments"))?;
        let argc_ptr = self.write_u32(instance, argc, scope).await?;

        let mut array = Vec::with_capacity((args.len() + 1) * 4);
        for arg in args {
            let ptr = self.write_c_string(instance, arg, scope).await?;
            array.extend_from_slice(&ptr.to_le_bytes());
        }
        array.extend_from_slice(&0u32.to_le_bytes());

        let (array_ptr, _) = self.write_bytes(instance, &array, scope).await?;
        let argv_ptr = self.write_u32(instance, array_ptr, scope).await?;

        debug!(argc, argc_ptr, argv_ptr, "Argument vector marshaled");
        Ok((argc_ptr, argv_ptr))
    }

    /// Release every scratch allocation through the module's deallocator.
    ///
    /// Without a deallocator the spans stay recorded. Returns the number of
    /// allocations released.
    pub async fn release_scratch(
        &mut self,
        instance: &mut dyn ModuleInstance,
    ) -> Result<usize, RuntimeError> {
        let mut released = 0;
        let mut kept = Vec::with_capacity(self.record.entries.len());
        let mut entries = std::mem::take(&mut self.record.entries).into_iter();

        while let Some(entry) = entries.next() {
            if entry.scope == AllocationScope::Scratch {
                match instance.deallocate(entry.offset).await {
                    Ok(true) => {
                        released += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        kept.push(entry);
                        kept.extend(entries);
                        self.record.entries = kept;
                        return Err(e);
                    }
                }
            }
            kept.push(entry);
        }

        self.record.entries = kept;
        Ok(released)
    }
}
