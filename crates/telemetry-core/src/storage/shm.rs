//! Shared memory snapshot slot.
//!
//! The producer owns a named POSIX shared memory object holding exactly one
//! [`Sample`] behind a small header. Other processes map it read-only.
//!
//! Layout (native byte order, 48 bytes):
//! ```text
//! ┌────────┬──────┬──────────────────────────────────────┐
//! │ offset │ size │ field                                │
//! ├────────┼──────┼──────────────────────────────────────┤
//! │      0 │    4 │ magic            = b"TLM1"           │
//! │      4 │    2 │ layout version   = 1                 │
//! │      6 │    2 │ record size      = 48                │
//! │      8 │    8 │ sequence (even = stable, 0 = empty)  │
//! │     16 │    4 │ battery_voltage  (f32 bits)          │
//! │     20 │    4 │ battery_current  (f32 bits)          │
//! │     24 │    4 │ battery_capacity (f32 bits)          │
//! │     28 │    4 │ temperature      (f32 bits)          │
//! │     32 │    4 │ net_throughput   (f32 bits)          │
//! │     36 │    4 │ reserved                             │
//! │     40 │    8 │ timestamp        (u64)               │
//! └────────┴──────┴──────────────────────────────────────┘
//! ```
//!
//! Writes go through a sequence lock: the writer makes the sequence odd,
//! stores the fields, then makes it even again. A reader retries until it
//! sees the same even sequence before and after loading the fields, so it
//! never returns a sample mixing two ticks. Readers never block the writer.
//!
//! Only one producer may own a name at a time. The producer holds an
//! exclusive `flock` on the object; a second producer gets
//! [`ShmError::InUse`].

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, fence};

use tracing::{debug, warn};

use crate::storage::model::Sample;

/// Default region name.
pub const DEFAULT_SHM_NAME: &str = "/telemetry_shm";

const MAGIC: u32 = u32::from_le_bytes(*b"TLM1");
const VERSION: u16 = 1;
/// Size of the mapped region in bytes.
pub const SLOT_SIZE: usize = std::mem::size_of::<SlotLayout>();
const MAX_READ_ATTEMPTS: u32 = 100_000;

#[repr(C)]
struct SlotLayout {
    magic: AtomicU32,
    version: AtomicU16,
    record_size: AtomicU16,
    seq: AtomicU64,
    battery_voltage: AtomicU32,
    battery_current: AtomicU32,
    battery_capacity: AtomicU32,
    temperature: AtomicU32,
    net_throughput: AtomicU32,
    _reserved: AtomicU32,
    timestamp: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SlotLayout>() == 48);

/// Error type for shared memory operations.
#[derive(Debug)]
pub enum ShmError {
    /// Names must look like `/name`: one leading slash, no other slashes.
    InvalidName(String),
    /// A system call failed.
    Os {
        op: &'static str,
        source: io::Error,
    },
    /// Another live producer owns the region.
    InUse(String),
    /// The region exists but is not a slot this build understands.
    Layout(String),
    /// The writer kept the slot busy for every read attempt.
    Contended,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidName(name) => write!(f, "invalid shared memory name {:?}", name),
            ShmError::Os { op, source } => write!(f, "{} failed: {}", op, source),
            ShmError::InUse(name) => {
                write!(f, "shared memory {} is owned by another producer", name)
            }
            ShmError::Layout(msg) => write!(f, "unexpected slot layout: {}", msg),
            ShmError::Contended => write!(f, "slot stayed busy while reading"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn os_error(op: &'static str) -> ShmError {
    ShmError::Os {
        op,
        source: io::Error::last_os_error(),
    }
}

fn shm_name(name: &str) -> Result<CString, ShmError> {
    let valid = name.len() > 1
        && name.len() <= 255
        && name.starts_with('/')
        && !name[1..].contains('/');
    if !valid {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

#[cfg(target_os = "linux")]
fn shm_open(name: &CStr, oflag: libc::c_int) -> libc::c_int {
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::shm_open(name.as_ptr(), oflag, 0o644 as libc::mode_t) }
}

#[cfg(not(target_os = "linux"))]
fn shm_open(name: &CStr, oflag: libc::c_int) -> libc::c_int {
    // SAFETY: as above; the variadic mode argument is promoted to c_uint.
    unsafe { libc::shm_open(name.as_ptr(), oflag, 0o644 as libc::c_uint) }
}

fn shm_unlink(name: &CStr) -> io::Result<()> {
    // SAFETY: `name` is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(name.as_ptr()) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// An open shared memory descriptor. Closes (and for the owner, unlinks)
/// on drop, so every early return during setup releases the name.
struct ShmFd {
    name: CString,
    fd: libc::c_int,
    unlink_on_drop: bool,
}

impl ShmFd {
    fn try_lock(&self) -> io::Result<()> {
        // SAFETY: `fd` is an open descriptor owned by `self`.
        if unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn size(&self) -> Result<usize, ShmError> {
        // SAFETY: `stat` is plain old data; fstat fills it on success.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stat) } != 0 {
            return Err(os_error("fstat"));
        }
        Ok(stat.st_size as usize)
    }

    fn link_count(&self) -> Option<u64> {
        // SAFETY: as in `size`.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stat) } != 0 {
            return None;
        }
        Some(stat.st_nlink as u64)
    }
}

impl Drop for ShmFd {
    fn drop(&mut self) {
        // SAFETY: `fd` is owned by `self` and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
        if self.unlink_on_drop
            && let Err(e) = shm_unlink(&self.name)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("failed to unlink shared memory {:?}: {}", self.name, e);
        }
    }
}

/// A mapped slot. Unmaps before the descriptor is closed.
struct Region {
    slot: NonNull<SlotLayout>,
    fd: ShmFd,
}

// SAFETY: the mapping stays valid until `Region` is dropped and every access
// goes through atomics, so the region may move between and be shared by threads.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn map(fd: ShmFd, writable: bool) -> Result<Self, ShmError> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: maps SLOT_SIZE bytes of an object at least that large.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                SLOT_SIZE,
                prot,
                libc::MAP_SHARED,
                fd.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        let slot = NonNull::new(ptr.cast::<SlotLayout>()).ok_or_else(|| os_error("mmap"))?;
        Ok(Self { slot, fd })
    }

    fn slot(&self) -> &SlotLayout {
        // SAFETY: the mapping is page aligned, SLOT_SIZE long and lives as long as `self`.
        unsafe { self.slot.as_ref() }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the range mapped in `Region::map`.
        unsafe {
            libc::munmap(self.slot.as_ptr().cast(), SLOT_SIZE);
        }
    }
}

/// Writer side of the snapshot slot.
///
/// Dropping the publisher unmaps the region and unlinks its name.
pub struct SnapshotPublisher {
    region: Region,
    name: String,
    published: u64,
}

impl SnapshotPublisher {
    /// Creates the named region and maps it read-write.
    ///
    /// A region left behind by a crashed producer is replaced with a fresh
    /// one. A region whose owner is still alive yields [`ShmError::InUse`].
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let cname = shm_name(name)?;
        remove_stale(&cname, name)?;

        let fd = shm_open(&cname, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL);
        if fd < 0 {
            let source = io::Error::last_os_error();
            if source.kind() == io::ErrorKind::AlreadyExists {
                return Err(ShmError::InUse(name.to_string()));
            }
            return Err(ShmError::Os {
                op: "shm_open",
                source,
            });
        }
        let fd = ShmFd {
            name: cname,
            fd,
            unlink_on_drop: true,
        };

        fd.try_lock().map_err(|source| ShmError::Os {
            op: "flock",
            source,
        })?;

        // SAFETY: `fd.fd` is an open descriptor.
        if unsafe { libc::ftruncate(fd.fd, SLOT_SIZE as libc::off_t) } != 0 {
            return Err(os_error("ftruncate"));
        }

        let region = Region::map(fd, true)?;
        let slot = region.slot();
        slot.seq.store(0, Ordering::Relaxed);
        slot.version.store(VERSION, Ordering::Relaxed);
        slot.record_size.store(SLOT_SIZE as u16, Ordering::Relaxed);
        slot.magic.store(MAGIC, Ordering::Release);

        debug!("shared memory {} mapped ({} bytes)", name, SLOT_SIZE);
        Ok(Self {
            region,
            name: name.to_string(),
            published: 0,
        })
    }

    /// Replaces the slot contents with `sample` as one atomic update.
    pub fn publish(&mut self, sample: &Sample) {
        let slot = self.region.slot();
        let seq = slot.seq.load(Ordering::Relaxed);

        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        slot.battery_voltage
            .store(sample.battery_voltage.to_bits(), Ordering::Relaxed);
        slot.battery_current
            .store(sample.battery_current.to_bits(), Ordering::Relaxed);
        slot.battery_capacity
            .store(sample.battery_capacity.to_bits(), Ordering::Relaxed);
        slot.temperature
            .store(sample.temperature.to_bits(), Ordering::Relaxed);
        slot.net_throughput
            .store(sample.net_throughput.to_bits(), Ordering::Relaxed);
        slot.timestamp.store(sample.timestamp, Ordering::Relaxed);

        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
        self.published += 1;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of samples published through this handle.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Unmaps and unlinks the region. Same as dropping.
    pub fn close(self) {
        debug!("releasing shared memory {}", self.name);
    }
}

/// Unlinks a region whose previous owner is gone.
fn remove_stale(cname: &CStr, name: &str) -> Result<(), ShmError> {
    let fd = shm_open(cname, libc::O_RDWR);
    if fd < 0 {
        let source = io::Error::last_os_error();
        if source.kind() == io::ErrorKind::NotFound {
            return Ok(());
        }
        return Err(ShmError::Os {
            op: "shm_open",
            source,
        });
    }
    let existing = ShmFd {
        name: cname.to_owned(),
        fd,
        unlink_on_drop: false,
    };

    match existing.try_lock() {
        Ok(()) => {
            warn!("removing stale shared memory {} left by a previous run", name);
            shm_unlink(cname).map_err(|source| ShmError::Os {
                op: "shm_unlink",
                source,
            })?;
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ShmError::InUse(name.to_string())),
        Err(source) => Err(ShmError::Os {
            op: "flock",
            source,
        }),
    }
}

/// Read-only view of a producer's snapshot slot.
pub struct SnapshotReader {
    region: Region,
}

impl SnapshotReader {
    /// Maps an existing region read-only and checks its header.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let cname = shm_name(name)?;
        let fd = shm_open(&cname, libc::O_RDONLY);
        if fd < 0 {
            return Err(os_error("shm_open"));
        }
        let fd = ShmFd {
            name: cname,
            fd,
            unlink_on_drop: false,
        };

        let size = fd.size()?;
        if size < SLOT_SIZE {
            return Err(ShmError::Layout(format!(
                "region is {} bytes, expected {}",
                size, SLOT_SIZE
            )));
        }

        let region = Region::map(fd, false)?;
        let slot = region.slot();
        let magic = slot.magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(ShmError::Layout(format!("bad magic {:#010x}", magic)));
        }
        let version = slot.version.load(Ordering::Relaxed);
        let record_size = slot.record_size.load(Ordering::Relaxed);
        if version != VERSION || record_size as usize != SLOT_SIZE {
            return Err(ShmError::Layout(format!(
                "version {} with {} byte records",
                version, record_size
            )));
        }

        Ok(Self { region })
    }

    /// Returns the latest published sample, or `None` before the first publish.
    ///
    /// Retries while a write is in progress; gives up with
    /// [`ShmError::Contended`] if the slot never settles.
    pub fn read(&self) -> Result<Option<Sample>, ShmError> {
        Ok(self.read_with_sequence()?.map(|(_, sample)| sample))
    }

    /// Like [`read`](Self::read), but also returns the sequence number the
    /// sample was read under, so pollers can tell a new publish from a repeat.
    pub fn read_with_sequence(&self) -> Result<Option<(u64, Sample)>, ShmError> {
        let slot = self.region.slot();
        for attempt in 0..MAX_READ_ATTEMPTS {
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let sample = Sample {
                    battery_voltage: f32::from_bits(slot.battery_voltage.load(Ordering::Relaxed)),
                    battery_current: f32::from_bits(slot.battery_current.load(Ordering::Relaxed)),
                    battery_capacity: f32::from_bits(
                        slot.battery_capacity.load(Ordering::Relaxed),
                    ),
                    temperature: f32::from_bits(slot.temperature.load(Ordering::Relaxed)),
                    net_throughput: f32::from_bits(slot.net_throughput.load(Ordering::Relaxed)),
                    timestamp: slot.timestamp.load(Ordering::Relaxed),
                };
                fence(Ordering::Acquire);
                let after = slot.seq.load(Ordering::Relaxed);
                if before == after {
                    return Ok((before != 0).then_some((before, sample)));
                }
            }

            if attempt % 64 == 63 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        Err(ShmError::Contended)
    }

    /// Sequence number of the last completed write (0 before any write).
    pub fn sequence(&self) -> u64 {
        self.region.slot().seq.load(Ordering::Acquire)
    }

    /// True once the producer has unlinked the name; the mapping then shows
    /// the final sample forever and a fresh `open` is needed.
    pub fn is_orphaned(&self) -> bool {
        self.region.fd.link_count() == Some(0)
    }
}
