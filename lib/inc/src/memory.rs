//! Shared-memory pools backing zero-copy binary transfer.
//!
//! A pool is one mapped segment (memfd on Linux, POSIX shm otherwise, chosen
//! at negotiation time). The creator allocates blocks out of it; the peer
//! attaches the same segment (via a passed descriptor or the shm name) and
//! imports blocks as views identified by `(shm_id, offset, size)`. Both
//! sides hold references: a block's region is returned to the allocator only
//! when the owning side has dropped every handle and released its exports.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use axon::logging::{self, Logger};

use crate::error::{IncError, IncResult};
use crate::tags::{TagReader, TagWriter};

pub const MEMTYPE_MEMFD: u16 = 0x02;
pub const MEMTYPE_POSIX: u16 = 0x04;

/// Marker written at the head of every segment, followed by the shm id, so
/// an attacher can identify the segment without a side channel.
const SEGMENT_MAGIC: u32 = 0x494E_4353;
const SEGMENT_HEADER: usize = 64;
const BLOCK_ALIGN: usize = 64;

static NEXT_SHM_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies an exported block to the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ShmRef {
    pub mem_type: u16,
    pub block_id: u32,
    pub shm_id: u32,
    pub offset: u64,
    pub size: u64,
}

impl ShmRef {
    pub fn write(&self, tags: &mut TagWriter) {
        tags.put_u32(self.mem_type as u32)
            .put_u32(self.block_id)
            .put_u32(self.shm_id)
            .put_u64(self.offset)
            .put_u64(self.size);
    }

    pub fn read(tags: &mut TagReader) -> IncResult<ShmRef> {
        let mem_type = tags.get_u32().map_err(|_| IncError::InvalidMessage)? as u16;
        let block_id = tags.get_u32().map_err(|_| IncError::InvalidMessage)?;
        let shm_id = tags.get_u32().map_err(|_| IncError::InvalidMessage)?;
        let offset = tags.get_u64().map_err(|_| IncError::InvalidMessage)?;
        let size = tags.get_u64().map_err(|_| IncError::InvalidMessage)?;

        Ok(ShmRef {
            mem_type,
            block_id,
            shm_id,
            offset,
            size,
        })
    }
}

/// First-fit region allocator over one segment.
struct Allocator {
    free: Vec<(usize, usize)>,
}

impl Allocator {
    fn new(size: usize) -> Allocator {
        Allocator {
            free: vec![(SEGMENT_HEADER, size - SEGMENT_HEADER)],
        }
    }

    fn alloc(&mut self, len: usize) -> Option<usize> {
        let len = (len + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN;

        for i in 0..self.free.len() {
            let (offset, available) = self.free[i];
            if available >= len {
                if available == len {
                    self.free.remove(i);
                } else {
                    self.free[i] = (offset + len, available - len);
                }
                return Some(offset);
            }
        }

        None
    }

    fn release(&mut self, offset: usize, len: usize) {
        let len = (len + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN;

        let at = self
            .free
            .iter()
            .position(|&(existing, _)| existing > offset)
            .unwrap_or(self.free.len());
        self.free.insert(at, (offset, len));

        // Coalesce with neighbours.
        if at + 1 < self.free.len() {
            let (next_off, next_len) = self.free[at + 1];
            if offset + len == next_off {
                self.free[at] = (offset, len + next_len);
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_off, prev_len) = self.free[at - 1];
            let (cur_off, cur_len) = self.free[at];
            if prev_off + prev_len == cur_off {
                self.free[at - 1] = (prev_off, prev_len + cur_len);
                self.free.remove(at);
            }
        }
    }
}

struct PoolInner {
    mem_type: u16,
    name: String,
    fd: RawFd,
    base: *mut u8,
    size: usize,
    shm_id: u32,
    owns_segment: bool,
    allocator: Mutex<Allocator>,
    log: Logger,
}

unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }

        if self.owns_segment && self.mem_type == MEMTYPE_POSIX {
            if let Ok(name) = CString::new(self.name.clone()) {
                unsafe { libc::shm_unlink(name.as_ptr()) };
            }
        }
    }
}

/// One mapped shared-memory segment with a block allocator.
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

fn map_segment(fd: RawFd, size: usize) -> IncResult<*mut u8> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(IncError::Internal);
    }
    Ok(base as *mut u8)
}

fn posix_name(name: &str) -> String {
    let trimmed = name.trim_start_matches('/');
    format!("/{}", trimmed)
}

impl MemPool {
    /// Create a fresh segment. `name` is the shm path for POSIX pools and a
    /// debug label for memfd pools.
    pub fn create<'a, L: Into<Option<&'a Logger>>>(
        owner: &str,
        name: &str,
        mem_type: u16,
        size: usize,
        log: L,
    ) -> IncResult<MemPool> {
        if size <= SEGMENT_HEADER {
            return Err(IncError::InvalidArgs);
        }

        let log = logging::child(
            log.into(),
            logging::o!("pool" => name.to_string(), "owner" => owner.to_string()),
        );

        let (fd, segment_name) = match mem_type {
            MEMTYPE_MEMFD => {
                let label = CString::new(name).map_err(|_| IncError::InvalidArgs)?;
                let fd = unsafe { libc::memfd_create(label.as_ptr(), libc::MFD_CLOEXEC) };
                if fd < 0 {
                    return Err(IncError::Internal);
                }
                (fd, name.to_string())
            }
            MEMTYPE_POSIX => {
                let segment_name = posix_name(name);
                let cname = CString::new(segment_name.clone()).map_err(|_| IncError::InvalidArgs)?;
                let fd = unsafe {
                    libc::shm_open(
                        cname.as_ptr(),
                        libc::O_CREAT | libc::O_RDWR,
                        0o600 as libc::mode_t,
                    )
                };
                if fd < 0 {
                    return Err(IncError::Internal);
                }
                (fd, segment_name)
            }
            _ => return Err(IncError::InvalidArgs),
        };

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            unsafe { libc::close(fd) };
            return Err(IncError::Internal);
        }

        let base = match map_segment(fd, size) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let shm_id = process::id().wrapping_shl(8) ^ NEXT_SHM_ID.fetch_add(1, Ordering::Relaxed);

        // Stamp the segment so an attacher can recover the id.
        unsafe {
            let header = base as *mut u32;
            header.write_unaligned(SEGMENT_MAGIC);
            header.add(1).write_unaligned(shm_id);
        }

        logging::debug!(log, "memory pool created";
                        "type" => mem_type,
                        "size" => size,
                        "shm_id" => shm_id);

        Ok(MemPool {
            inner: Arc::new(PoolInner {
                mem_type,
                name: segment_name,
                fd,
                base,
                size,
                shm_id,
                owns_segment: true,
                allocator: Mutex::new(Allocator::new(size)),
                log,
            }),
        })
    }

    /// Map a segment created by a peer: by descriptor for memfd pools, by
    /// name for POSIX pools.
    pub fn attach<'a, L: Into<Option<&'a Logger>>>(
        mem_type: u16,
        name: &str,
        fd: Option<RawFd>,
        size: usize,
        log: L,
    ) -> IncResult<MemPool> {
        if size <= SEGMENT_HEADER {
            return Err(IncError::InvalidArgs);
        }

        let log = logging::child(log.into(), logging::o!("pool" => name.to_string()));

        let (fd, segment_name) = match mem_type {
            MEMTYPE_MEMFD => match fd {
                Some(fd) => (fd, name.to_string()),
                None => return Err(IncError::InvalidArgs),
            },
            MEMTYPE_POSIX => {
                let segment_name = posix_name(name);
                let cname = CString::new(segment_name.clone()).map_err(|_| IncError::InvalidArgs)?;
                let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
                if fd < 0 {
                    return Err(IncError::ConnectionFailed);
                }
                (fd, segment_name)
            }
            _ => return Err(IncError::InvalidArgs),
        };

        let base = match map_segment(fd, size) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        let (magic, shm_id) = unsafe {
            let header = base as *const u32;
            (header.read_unaligned(), header.add(1).read_unaligned())
        };
        if magic != SEGMENT_MAGIC {
            unsafe {
                libc::munmap(base as *mut libc::c_void, size);
                libc::close(fd);
            }
            return Err(IncError::ProtocolError);
        }

        logging::debug!(log, "memory pool attached"; "type" => mem_type, "shm_id" => shm_id);

        Ok(MemPool {
            inner: Arc::new(PoolInner {
                mem_type,
                name: segment_name,
                fd,
                base,
                size,
                shm_id,
                owns_segment: false,
                allocator: Mutex::new(Allocator::new(size)),
                log,
            }),
        })
    }

    #[inline]
    pub fn mem_type(&self) -> u16 {
        self.inner.mem_type
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    #[inline]
    pub fn shm_id(&self) -> u32 {
        self.inner.shm_id
    }

    #[inline]
    pub fn same_pool(&self, other: &MemPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Allocate an owned block; its region returns to the pool when the last
    /// handle drops.
    pub fn alloc(&self, len: usize) -> Option<MemBlock> {
        if len == 0 || len > self.inner.size - SEGMENT_HEADER {
            return None;
        }

        let offset = self
            .inner
            .allocator
            .lock()
            .expect("pool allocator poisoned")
            .alloc(len)?;

        Some(MemBlock {
            inner: Arc::new(BlockInner {
                pool: self.clone(),
                offset,
                len,
                owned: true,
            }),
        })
    }

    /// A borrowed view of a region allocated by the peer.
    pub fn view(&self, offset: usize, len: usize) -> Option<MemBlock> {
        if offset < SEGMENT_HEADER || len == 0 || offset + len > self.inner.size {
            return None;
        }

        Some(MemBlock {
            inner: Arc::new(BlockInner {
                pool: self.clone(),
                offset,
                len,
                owned: false,
            }),
        })
    }
}

struct BlockInner {
    pool: MemPool,
    offset: usize,
    len: usize,
    owned: bool,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if self.owned {
            self.pool
                .inner
                .allocator
                .lock()
                .expect("pool allocator poisoned")
                .release(self.offset, self.len);
        }
    }
}

/// A region of a pool, shared by reference count.
#[derive(Clone)]
pub struct MemBlock {
    inner: Arc<BlockInner>,
}

impl MemBlock {
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    #[inline]
    pub fn pool(&self) -> &MemPool {
        &self.inner.pool
    }

    /// Zero-copy view of the block's bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.inner.pool.inner.base.add(self.inner.offset),
                self.inner.len,
            )
        }
    }

    /// Copy `data` into the block. The caller is the block's single writer
    /// until the block has been exported.
    pub fn fill_from(&self, data: &[u8]) -> bool {
        if data.len() > self.inner.len {
            return false;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.inner.pool.inner.base.add(self.inner.offset),
                data.len(),
            );
        }
        true
    }
}

/// Export side: pins blocks handed to the peer and mints their references.
pub struct MemExport {
    pool: MemPool,
    table: Mutex<HashMap<u32, MemBlock>>,
    next_block: AtomicU32,
}

impl MemExport {
    pub fn new(pool: MemPool) -> MemExport {
        MemExport {
            pool,
            table: Mutex::new(HashMap::new()),
            next_block: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    /// Export a block from this export's pool. Holds a reference until
    /// [`MemExport::release`].
    pub fn put(&self, block: &MemBlock) -> Option<ShmRef> {
        if !block.pool().same_pool(&self.pool) {
            return None;
        }

        let block_id = self.next_block.fetch_add(1, Ordering::Relaxed);
        self.table
            .lock()
            .expect("export table poisoned")
            .insert(block_id, block.clone());

        Some(ShmRef {
            mem_type: self.pool.mem_type(),
            block_id,
            shm_id: self.pool.shm_id(),
            offset: block.offset() as u64,
            size: block.len() as u64,
        })
    }

    pub fn release(&self, block_id: u32) -> bool {
        self.table
            .lock()
            .expect("export table poisoned")
            .remove(&block_id)
            .is_some()
    }

    pub fn exported(&self) -> usize {
        self.table.lock().expect("export table poisoned").len()
    }
}

/// Import side: maps peer segments and resolves references to views.
pub struct MemImport {
    pools: Mutex<HashMap<u32, MemPool>>,
}

impl MemImport {
    pub fn new() -> MemImport {
        MemImport {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach_pool(&self, pool: MemPool) {
        self.pools
            .lock()
            .expect("import table poisoned")
            .insert(pool.shm_id(), pool);
    }

    /// Resolve a peer reference to a zero-copy view.
    pub fn get(&self, shm_ref: &ShmRef) -> Option<MemBlock> {
        let pools = self.pools.lock().expect("import table poisoned");
        let pool = pools.get(&shm_ref.shm_id)?;

        if pool.mem_type() != shm_ref.mem_type {
            return None;
        }

        pool.view(shm_ref.offset as usize, shm_ref.size as usize)
    }
}
