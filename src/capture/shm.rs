//! POSIX shared memory frame source
//!
//! The segment starts with a header holding the payload size and a
//! process-shared mutex/condition pair, followed by the raw payload. Producers
//! write under the mutex and broadcast the condition once a frame is complete.

use std::fs::File;
use std::mem::{size_of, MaybeUninit};
use std::ptr::{self, addr_of, addr_of_mut};

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, info, warn};

use crate::capture::source::PixelSource;
use crate::error::SourceError;

#[repr(C)]
struct SegmentHeader {
    size: u32,
    mutex: libc::pthread_mutex_t,
    condition: libc::pthread_cond_t,
}

const HEADER_LEN: usize = size_of::<SegmentHeader>();

/// Memory-mapped view of a named shared memory segment
pub struct SharedMemorySource {
    name: String,
    map: MmapRaw,
    size: usize,
    owner: bool,
}

// SAFETY: all access to the payload goes through the process-shared mutex in
// the segment header; the mapping itself is never remapped after attach.
unsafe impl Send for SharedMemorySource {}
unsafe impl Sync for SharedMemorySource {}

fn segment_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    }
}

impl SharedMemorySource {
    /// Attach to an existing segment created by the producer.
    pub fn attach(name: &str) -> Result<Self, SourceError> {
        let name = segment_name(name);
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            SourceError::Attach {
                name: name.clone(),
                source,
            }
        })?;
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|source| SourceError::Io {
                name: name.clone(),
                source,
            })?
            .len() as usize;
        if len < HEADER_LEN {
            return Err(SourceError::Malformed {
                name,
                reason: format!("segment of {len} bytes has no header"),
            });
        }

        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|source| SourceError::Io {
                name: name.clone(),
                source,
            })?;

        let header = map.as_ptr().cast::<SegmentHeader>();
        // SAFETY: the mapping is page aligned and at least HEADER_LEN bytes long.
        let size = unsafe { addr_of!((*header).size).read_volatile() } as usize;
        if HEADER_LEN + size > len {
            return Err(SourceError::Malformed {
                name,
                reason: format!("header claims {size} bytes, segment holds {}", len - HEADER_LEN),
            });
        }

        info!("Attached to '{}' ({} bytes)", name, size);
        Ok(Self {
            name,
            map,
            size,
            owner: false,
        })
    }

    /// Create a new segment with room for `size` payload bytes. The segment is
    /// unlinked again when the returned handle is dropped.
    pub fn create(name: &str, size: usize) -> Result<Self, SourceError> {
        let name = segment_name(name);
        let declared = u32::try_from(size).map_err(|_| SourceError::Malformed {
            name: name.clone(),
            reason: format!("{size} bytes do not fit the segment header"),
        })?;
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| SourceError::Attach {
            name: name.clone(),
            source,
        })?;

        let len = HEADER_LEN + size;
        if let Err(source) = nix::unistd::ftruncate(&fd, len as libc::off_t) {
            let _ = shm_unlink(name.as_str());
            return Err(SourceError::Attach { name, source });
        }

        let file = File::from(fd);
        let map = match MmapOptions::new().len(len).map_raw(&file) {
            Ok(map) => map,
            Err(source) => {
                let _ = shm_unlink(name.as_str());
                return Err(SourceError::Io { name, source });
            }
        };

        let header = map.as_mut_ptr().cast::<SegmentHeader>();
        // SAFETY: freshly truncated mapping of HEADER_LEN + size bytes that no
        // other process can have locked yet (O_EXCL).
        unsafe {
            addr_of_mut!((*header).size).write_volatile(declared);

            let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr());
            libc::pthread_mutexattr_setpshared(mutex_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(addr_of_mut!((*header).mutex), mutex_attr.as_ptr());
            libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr());

            let mut cond_attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            libc::pthread_condattr_init(cond_attr.as_mut_ptr());
            libc::pthread_condattr_setpshared(cond_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_cond_init(addr_of_mut!((*header).condition), cond_attr.as_ptr());
            libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
        }

        debug!("Created shared memory '{}' ({} bytes)", name, size);
        Ok(Self {
            name,
            map,
            size,
            owner: true,
        })
    }

    fn header(&self) -> *mut SegmentHeader {
        self.map.as_mut_ptr().cast()
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        // SAFETY: header() points into the live mapping.
        unsafe { addr_of_mut!((*self.header()).mutex) }
    }

    fn condition(&self) -> *mut libc::pthread_cond_t {
        // SAFETY: header() points into the live mapping.
        unsafe { addr_of_mut!((*self.header()).condition) }
    }

    /// Copy a frame into the segment and wake every waiting reader.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), SourceError> {
        let len = frame.len().min(self.size);
        self.lock()?;
        // SAFETY: len is bounded by the payload size and the lock is held.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), self.map.as_mut_ptr().add(HEADER_LEN), len);
        }
        self.unlock();
        self.notify_all()
    }

    /// Wake every reader blocked in [`PixelSource::wait`].
    pub fn notify_all(&self) -> Result<(), SourceError> {
        self.lock()?;
        // SAFETY: the condition was initialised process-shared by the creator.
        let rc = unsafe { libc::pthread_cond_broadcast(self.condition()) };
        if rc != 0 {
            warn!("pthread_cond_broadcast on '{}' returned {}", self.name, rc);
        }
        self.unlock();
        Ok(())
    }
}

impl PixelSource for SharedMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_valid(&self) -> bool {
        self.size > 0
    }

    fn wait(&self) {
        if let Err(e) = self.lock() {
            warn!("Not waiting for a frame: {}", e);
            return;
        }
        // SAFETY: the mutex is held by this thread as the call requires.
        let rc = unsafe { libc::pthread_cond_wait(self.condition(), self.mutex()) };
        if rc != 0 {
            warn!("pthread_cond_wait on '{}' returned {}", self.name, rc);
        }
        self.unlock();
    }

    fn lock(&self) -> Result<(), SourceError> {
        // SAFETY: the mutex lives in the mapping for as long as self.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex()) };
        if rc != 0 {
            return Err(SourceError::Lock {
                name: self.name.clone(),
                source: nix::errno::Errno::from_raw(rc),
            });
        }
        Ok(())
    }

    fn unlock(&self) {
        // SAFETY: see lock().
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex()) };
        if rc != 0 {
            warn!("pthread_mutex_unlock on '{}' returned {}", self.name, rc);
        }
    }

    fn region(&self) -> &[u8] {
        // SAFETY: the payload follows the header and attach/create checked
        // that HEADER_LEN + size fits the mapping.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(HEADER_LEN), self.size) }
    }
}

impl Drop for SharedMemorySource {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!("Failed to unlink shared memory '{}': {}", self.name, e);
            }
        }
    }
}
