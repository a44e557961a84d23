//! Scoped owner of a writable-then-executable host memory region, used
//! by the JIT compiler to host freshly emitted ARM64 machine code.
//!
//! Mirrors `jit/code_buffer.h`'s `CodeBuffer`: anonymous `mmap`, a
//! position cursor for emission, a one-way `WRITING -> SEALED`
//! transition that flushes the instruction cache and flips the page
//! protection to read+execute, and unconditional release on drop.

use std::ffi::c_void;
use std::ptr;

use thiserror::Error;

/// Default code buffer capacity, matching the teacher's `CodeBuffer`.
pub const DEFAULT_CODE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CodeBufferError {
    #[error("failed to allocate executable memory: {0}")]
    Allocation(std::io::Error),
    #[error("failed to change memory protection: {0}")]
    Protect(std::io::Error),
    #[error("code buffer overflow: position {position} + {len} exceeds capacity {capacity}")]
    Overflow {
        position: usize,
        len: usize,
        capacity: usize,
    },
    #[error("buffer is sealed: no further emission is permitted")]
    AlreadySealed,
    #[error("buffer is not sealed: cannot be executed yet")]
    NotSealed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writing,
    Sealed,
}

/// A contiguous, page-aligned region of anonymous host memory. Starts
/// in `Writing` (read+write, never executable); `seal()` flushes the
/// instruction cache over the written range and transitions to
/// `Sealed` (read+execute, no further emission).
pub struct CodeBuffer {
    base: *mut u8,
    capacity: usize,
    position: usize,
    state: State,
}

// The buffer only exposes raw bytes and a function pointer after
// sealing; the caller is responsible for the thread-safety of
// invoking the resulting code, matching the single-threaded model of
// the interpreter this JIT feeds (spec.md section 5).
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Allocate at least `capacity` bytes of anonymous memory with a
    /// protection policy compatible with later execution.
    ///
    /// On platforms enforcing W^X (Apple Silicon under `MAP_JIT`), the
    /// region starts read+write and `seal()` flips it to read+execute.
    /// Elsewhere a single RWX mapping is used and `seal()` only flushes
    /// the instruction cache.
    pub fn new(capacity: usize) -> Result<Self, CodeBufferError> {
        let base = unsafe { map_writable(capacity)? };
        Ok(Self {
            base,
            capacity,
            position: 0,
            state: State::Writing,
        })
    }

    pub fn with_default_size() -> Result<Self, CodeBufferError> {
        Self::new(DEFAULT_CODE_BUFFER_SIZE)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_room(&self, len: usize) -> Result<(), CodeBufferError> {
        if self.state != State::Writing {
            return Err(CodeBufferError::AlreadySealed);
        }
        if self.position + len > self.capacity {
            return Err(CodeBufferError::Overflow {
                position: self.position,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn emit_u8(&mut self, byte: u8) -> Result<(), CodeBufferError> {
        self.check_room(1)?;
        unsafe { ptr::write(self.base.add(self.position), byte) };
        self.position += 1;
        Ok(())
    }

    /// Emit a little-endian 32-bit value: one ARM64 instruction word.
    pub fn emit_u32(&mut self, value: u32) -> Result<(), CodeBufferError> {
        self.check_room(4)?;
        for byte in value.to_le_bytes() {
            self.emit_u8(byte)?;
        }
        Ok(())
    }

    pub fn emit_u64(&mut self, value: u64) -> Result<(), CodeBufferError> {
        self.check_room(8)?;
        for byte in value.to_le_bytes() {
            self.emit_u8(byte)?;
        }
        Ok(())
    }

    /// Flush the instruction cache over `[base, base+position)` and
    /// transition to read+execute. After this call no further emission
    /// is permitted.
    pub fn seal(&mut self) -> Result<(), CodeBufferError> {
        if self.state != State::Writing {
            return Err(CodeBufferError::AlreadySealed);
        }
        unsafe {
            flush_icache(self.base, self.position);
            make_executable(self.base, self.capacity)?;
        }
        self.state = State::Sealed;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.state == State::Sealed
    }

    /// Raw entry pointer to the start of the buffer, valid only once
    /// sealed and only for as long as `self` (and the cache entry that
    /// co-owns it) is alive.
    pub fn entry_ptr(&self) -> Result<*const u8, CodeBufferError> {
        if self.state != State::Sealed {
            return Err(CodeBufferError::NotSealed);
        }
        Ok(self.base as *const u8)
    }

    /// The bytes written so far, for tests that want to inspect
    /// emitted code without calling through the function pointer.
    pub fn written_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.position) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.capacity);
        }
    }
}

#[cfg(target_os = "macos")]
unsafe fn map_writable(size: usize) -> Result<*mut u8, CodeBufferError> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(CodeBufferError::Allocation(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(target_os = "macos"))]
unsafe fn map_writable(size: usize) -> Result<*mut u8, CodeBufferError> {
    // Hosts that permit RWX anonymous pages: allocate once, remain RWX
    // for the buffer's lifetime. seal() still flushes the icache.
    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(CodeBufferError::Allocation(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
unsafe fn make_executable(base: *mut u8, capacity: usize) -> Result<(), CodeBufferError> {
    if libc::mprotect(
        base as *mut c_void,
        capacity,
        libc::PROT_READ | libc::PROT_EXEC,
    ) != 0
    {
        return Err(CodeBufferError::Protect(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
unsafe fn make_executable(_base: *mut u8, _capacity: usize) -> Result<(), CodeBufferError> {
    // Already RWX from allocation; nothing left to flip.
    Ok(())
}

/// Flush the host instruction cache over the written range so the CPU
/// doesn't execute stale cache lines from before the writes. Required
/// on every ARM64 target per spec.md section 5 ("failure to flush is a
/// latent correctness bug and must be tested"); on x86_64 hosts (used
/// for running this crate's test suite, since x86_64 keeps the
/// instruction cache coherent with data writes) a memory fence is
/// sufficient.
#[cfg(target_os = "macos")]
unsafe fn flush_icache(base: *mut u8, len: usize) {
    libc::sys_icache_invalidate(base as *mut c_void, len);
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
unsafe fn flush_icache(base: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(begin: *mut c_void, end: *mut c_void);
    }
    __clear_cache(base as *mut c_void, base.add(len) as *mut c_void);
}

#[cfg(not(any(target_os = "macos", target_arch = "aarch64")))]
unsafe fn flush_icache(_base: *mut u8, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_seal_preserves_bytes() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u8(0xde).unwrap();
        buf.emit_u8(0xad).unwrap();
        buf.emit_u8(0xbe).unwrap();
        buf.emit_u8(0xef).unwrap();
        assert_eq!(buf.written_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        buf.seal().unwrap();
        assert!(buf.is_sealed());
        assert_eq!(buf.written_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn emit_u32_is_little_endian() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u32(0x0403_0201).unwrap();
        assert_eq!(buf.written_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn overflow_is_rejected_without_growing() {
        let mut buf = CodeBuffer::new(4).unwrap();
        buf.emit_u32(0).unwrap();
        let result = buf.emit_u8(1);
        assert!(matches!(result, Err(CodeBufferError::Overflow { .. })));
    }

    #[test]
    fn emission_after_seal_is_rejected() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.seal().unwrap();
        assert!(matches!(
            buf.emit_u8(1),
            Err(CodeBufferError::AlreadySealed)
        ));
    }

    #[test]
    fn entry_ptr_before_seal_is_rejected() {
        let buf = CodeBuffer::new(64).unwrap();
        assert!(matches!(buf.entry_ptr(), Err(CodeBufferError::NotSealed)));
    }

    #[test]
    fn entry_ptr_after_seal_points_at_base() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit_u32(0xd65f_03c0).unwrap(); // RET
        buf.seal().unwrap();
        let ptr = buf.entry_ptr().unwrap();
        assert!(!ptr.is_null());
    }
}
