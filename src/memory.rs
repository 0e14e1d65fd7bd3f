//! fallible access to the memory of the current process.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use log::warn;

use crate::{Error, Result};

/// reads and writes memory of the instrumented process without faulting on bad addresses.
pub trait MemoryReader: Send + Sync {
    /// fills `buf` with the bytes at `address`, failing with [`Error::InvalidMemoryRead`] if any of them is unreadable.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()>;

    /// writes `bytes` at `address`, failing with [`Error::InvalidMemoryWrite`] if any of them is not writable.
    fn write(&self, address: usize, bytes: &[u8]) -> Result<()>;

    /// reads a little endian 64 bit value.
    fn read_u64(&self, address: usize) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// reads the bytes of the nul terminated string at `address`, without the terminator.
    ///
    /// the string is read page by page, so a string which ends right before an unmapped page is still read successfully.
    fn read_c_string(&self, address: usize, max_len: usize) -> Result<Vec<u8>> {
        if address == 0 {
            return Err(Error::InvalidMemoryRead { address, len: 1 });
        }
        let page_size = region::page::size();
        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; page_size];
        let mut cur = address;
        while bytes.len() < max_len {
            let to_page_end = page_size - cur % page_size;
            let chunk_len = to_page_end.min(max_len - bytes.len());
            self.read(cur, &mut chunk[..chunk_len])?;
            if let Some(nul) = chunk[..chunk_len].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(bytes);
            }
            bytes.extend_from_slice(&chunk[..chunk_len]);
            cur += chunk_len;
        }
        Err(Error::UnterminatedString {
            address,
            limit: max_len,
        })
    }
}

/// accesses the memory of the current process using `process_vm_readv` and `process_vm_writev`, falling back to
/// `/proc/self/mem` when the syscalls are unavailable.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    vm_unavailable: AtomicBool,
    proc_mem: OnceLock<Option<File>>,
}
impl ProcessMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_vm(&self, address: usize, buf: &mut [u8]) -> io::Result<()> {
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        if read as usize != buf.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    fn write_vm(&self, address: usize, bytes: &[u8]) -> io::Result<()> {
        let local = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let written = unsafe { libc::process_vm_writev(libc::getpid(), &local, 1, &remote, 1, 0) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        if written as usize != bytes.len() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        Ok(())
    }

    fn proc_mem(&self) -> io::Result<&File> {
        self.proc_mem
            .get_or_init(|| {
                match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open("/proc/self/mem")
                    .or_else(|_| File::open("/proc/self/mem"))
                {
                    Ok(file) => Some(file),
                    Err(err) => {
                        warn!("failed to open /proc/self/mem: {}", err);
                        None
                    }
                }
            })
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))
    }

    fn read_proc_mem(&self, address: usize, buf: &mut [u8]) -> io::Result<()> {
        self.proc_mem()?.read_exact_at(buf, address as u64)
    }

    fn write_proc_mem(&self, address: usize, bytes: &[u8]) -> io::Result<()> {
        self.proc_mem()?.write_all_at(bytes, address as u64)
    }

    /// whether a failure of `process_vm_readv` or `process_vm_writev` means that the syscalls can't be used at all.
    fn vm_syscall_unavailable(&self, err: &io::Error, name: &str) -> bool {
        if !matches!(err.raw_os_error(), Some(libc::ENOSYS | libc::EPERM)) {
            return false;
        }
        warn!("{} is unavailable ({}), using /proc/self/mem", name, err);
        self.vm_unavailable.store(true, Ordering::Relaxed);
        true
    }
}
impl MemoryReader for ProcessMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len();
        let invalid = || Error::InvalidMemoryRead { address, len };
        if address == 0 {
            return Err(invalid());
        }

        if !self.vm_unavailable.load(Ordering::Relaxed) {
            match self.read_vm(address, buf) {
                Ok(()) => return Ok(()),
                Err(err) if self.vm_syscall_unavailable(&err, "process_vm_readv") => {}
                Err(_) => return Err(invalid()),
            }
        }

        self.read_proc_mem(address, buf).map_err(|_| invalid())
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len();
        let invalid = || Error::InvalidMemoryWrite { address, len };
        if address == 0 {
            return Err(invalid());
        }

        if !self.vm_unavailable.load(Ordering::Relaxed) {
            match self.write_vm(address, bytes) {
                Ok(()) => return Ok(()),
                Err(err) if self.vm_syscall_unavailable(&err, "process_vm_writev") => {}
                Err(_) => return Err(invalid()),
            }
        }

        // unlike the syscall, /proc/self/mem ignores page protections, so only mapped writable pages may be written.
        match region::query(address as *const u8) {
            Ok(mapping) if mapping.protection().contains(region::Protection::WRITE) => {}
            _ => return Err(invalid()),
        }
        self.write_proc_mem(address, bytes).map_err(|_| invalid())
    }
}
