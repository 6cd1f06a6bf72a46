//! Executable code buffer backed by mmap.
//!
//! A `KernelCode` holds JIT-emitted machine code in an anonymous mapping
//! that is flipped to PROT_READ|PROT_EXEC after the copy. The buffer is
//! immutable from then on and owned exclusively by the generator that
//! created it; function pointers into it die with the generator.

use crate::types::{KernelError, KernelResult};

pub struct KernelCode {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: KernelCode owns its mapping exclusively and the memory is
// read/execute-only after construction, so sharing across threads is safe.
unsafe impl Send for KernelCode {}
unsafe impl Sync for KernelCode {}

impl KernelCode {
    /// Allocate an executable region and copy `code` into it.
    pub fn new(code: &[u8]) -> KernelResult<Self> {
        if code.is_empty() {
            return Ok(KernelCode {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }

        let page = page_size();
        let len = (code.len() + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no fd; result checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(KernelError::CodeBuffer(
                "mmap failed for kernel code".into(),
            ));
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        let ret =
            unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(KernelError::CodeBuffer(
                "mprotect failed for kernel code".into(),
            ));
        }

        Ok(KernelCode { ptr, len })
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for KernelCode {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
