//! Addresses handed to the computational collaborator.
//!
//! Step addresses are raw `u64`s (they may live in another process image),
//! tagged with the memory space they resolve in. The type parameter keeps a
//! host-staged address from being passed where a device address is expected.

use std::marker::PhantomData;

mod private {
    pub trait Sealed {}
}

/// Marker trait for memory spaces.
pub trait MemorySpace: private::Sealed {
    const KIND: MemKind;
}

/// Host memory (pinned / mapped for staging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {}
impl private::Sealed for Host {}
impl MemorySpace for Host {
    const KIND: MemKind = MemKind::Host;
}

/// Device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {}
impl private::Sealed for Device {}
impl MemorySpace for Device {
    const KIND: MemKind = MemKind::Device;
}

/// Run-time tag for the memory space of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    Device,
    Host,
}

/// A typed address in memory space `S`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferPtr<S: MemorySpace> {
    addr: u64,
    _space: PhantomData<S>,
}

impl<S: MemorySpace> BufferPtr<S> {
    /// # Safety
    /// `addr` must resolve in memory space `S`.
    pub unsafe fn new(addr: u64) -> Self {
        Self {
            addr,
            _space: PhantomData,
        }
    }

    /// Get the raw `u64` address.
    pub fn as_u64(&self) -> u64 {
        self.addr
    }

    /// Memory space this address resolves in.
    pub fn kind(&self) -> MemKind {
        S::KIND
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferPtr<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@0x{:x}", S::KIND, self.addr)
    }
}

/// A typed, sized region in memory space `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef<S: MemorySpace> {
    ptr: BufferPtr<S>,
    len_bytes: usize,
}

impl<S: MemorySpace> BufferRef<S> {
    /// # Safety
    /// `addr` must point to at least `len_bytes` of memory in space `S`.
    pub unsafe fn new(addr: u64, len_bytes: usize) -> Self {
        Self {
            ptr: unsafe { BufferPtr::new(addr) },
            len_bytes,
        }
    }

    /// Get a reference to the typed pointer.
    pub fn ptr(&self) -> &BufferPtr<S> {
        &self.ptr
    }

    /// Size of the region in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    /// Returns true if the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    /// Get the raw `u64` address.
    pub fn as_u64(&self) -> u64 {
        self.ptr.as_u64()
    }
}

impl<S: MemorySpace> std::fmt::Display for BufferRef<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}B", self.ptr, self.len_bytes)
    }
}

/// An address whose memory space is only known at run time, i.e. one
/// resolved through a peer link that may be device-direct or host-staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedRef {
    Device(BufferRef<Device>),
    Host(BufferRef<Host>),
}

impl StagedRef {
    /// # Safety
    /// `addr` must point to at least `len_bytes` of memory of kind `kind`.
    pub unsafe fn new(kind: MemKind, addr: u64, len_bytes: usize) -> Self {
        unsafe {
            match kind {
                MemKind::Device => StagedRef::Device(BufferRef::new(addr, len_bytes)),
                MemKind::Host => StagedRef::Host(BufferRef::new(addr, len_bytes)),
            }
        }
    }

    /// Memory space of the address, resolved at run time.
    pub fn kind(&self) -> MemKind {
        match self {
            StagedRef::Device(_) => MemKind::Device,
            StagedRef::Host(_) => MemKind::Host,
        }
    }

    /// Get the raw `u64` address.
    pub fn as_u64(&self) -> u64 {
        match self {
            StagedRef::Device(b) => b.as_u64(),
            StagedRef::Host(b) => b.as_u64(),
        }
    }

    /// Size of the region in bytes.
    pub fn len_bytes(&self) -> usize {
        match self {
            StagedRef::Device(b) => b.len_bytes(),
            StagedRef::Host(b) => b.len_bytes(),
        }
    }

    /// The device-typed view, or `None` for a host-staged address.
    pub fn as_device(&self) -> Option<&BufferRef<Device>> {
        match self {
            StagedRef::Device(b) => Some(b),
            StagedRef::Host(_) => None,
        }
    }
}

impl std::fmt::Display for StagedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagedRef::Device(b) => b.fmt(f),
            StagedRef::Host(b) => b.fmt(f),
        }
    }
}

/// Copy direction the collaborator must use to move a step's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    DeviceToDevice,
    DeviceToHost,
    HostToDevice,
    HostToHost,
}

impl CopyKind {
    /// Copy direction from a `src` region to a `dst` region.
    pub fn between(src: MemKind, dst: MemKind) -> Self {
        match (src, dst) {
            (MemKind::Device, MemKind::Device) => CopyKind::DeviceToDevice,
            (MemKind::Device, MemKind::Host) => CopyKind::DeviceToHost,
            (MemKind::Host, MemKind::Device) => CopyKind::HostToDevice,
            (MemKind::Host, MemKind::Host) => CopyKind::HostToHost,
        }
    }

    /// True when the copy passes through host memory.
    pub fn is_staged(self) -> bool {
        self != CopyKind::DeviceToDevice
    }
}
