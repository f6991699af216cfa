//! POSIX shared memory segments.
//!
//! A segment is created by exactly one process (the owner) and opened by any
//! number of others. The owner unlinks the name when it destroys the segment
//! or drops its handle; existing mappings stay valid until unmapped.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

use shm_primitives::{MappedRegion, Region};

use crate::error::{Result, TransportError};
use crate::layout::{NAME_MAX, SEGMENT_MAGIC, SegmentHeader, SegmentKind, SessionLayout};

/// Name of the server segment for database `db`.
pub fn server_segment_name(db: &str) -> String {
    db.to_owned()
}

/// Name of the connection segment for database `db`.
pub fn connection_segment_name(db: &str) -> String {
    format!("{db}-connection")
}

/// Name of the session segment for session `id` of database `db`.
pub fn session_segment_name(db: &str, id: u64) -> String {
    format!("{db}-{id}")
}

fn os_name(name: &str) -> Result<CString> {
    if name.len() > NAME_MAX {
        return Err(TransportError::NameTooLong {
            name: name.to_owned(),
            max: NAME_MAX,
        });
    }
    if name.is_empty() || name.contains('/') {
        return Err(TransportError::InvalidName(name.to_owned()));
    }
    CString::new(format!("/{name}")).map_err(|_| TransportError::InvalidName(name.to_owned()))
}

/// How long a creator waits for a segment another creator is still laying out.
const INIT_GRACE: Duration = Duration::from_millis(500);

/// What a name currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameState {
    Missing,
    /// Created but the header is not written yet.
    Initializing,
    Live,
    /// Foreign content, or an owner that is gone.
    Stale,
}

fn inspect(os_name: &CString) -> NameState {
    let fd = match shm_open(os_name, libc::O_RDONLY) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => return NameState::Missing,
        Err(_) => return NameState::Stale,
    };
    let header_size = core::mem::size_of::<SegmentHeader>();
    match fstat_size(&fd) {
        Ok(len) if len >= header_size => {}
        // Not truncated to size yet.
        Ok(_) => return NameState::Initializing,
        Err(_) => return NameState::Stale,
    }

    // SAFETY: read-only mapping of the header, unmapped before returning.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            header_size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return NameState::Stale;
    }
    let (magic, owner_pid) = {
        let header = base as *const SegmentHeader;
        // SAFETY: the mapping is at least header_size bytes and page aligned.
        // The creator may be writing the header; volatile reads tolerate that,
        // and the magic is written last.
        unsafe {
            let magic = ptr::read_volatile(&raw const (*header).magic);
            fence(Ordering::Acquire);
            (magic, ptr::read_volatile(&raw const (*header).owner_pid))
        }
    };
    // SAFETY: base/header_size come from the mmap above.
    unsafe { libc::munmap(base, header_size) };

    if magic == [0; 8] {
        NameState::Initializing
    } else if magic == SEGMENT_MAGIC && pid_alive(owner_pid) {
        NameState::Live
    } else {
        NameState::Stale
    }
}

/// Whether process `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A mapped POSIX shared memory segment.
pub struct SharedSegment {
    name: String,
    os_name: CString,
    base: *mut u8,
    len: usize,
    owner: bool,
    destroyed: AtomicBool,
}

// SAFETY: the mapping is shared memory; all mutable state in it is accessed
// through atomics or through protocols that hand out exclusive ranges.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a zero-filled segment of at least `size` bytes and write its header.
    ///
    /// A stale segment whose owner is gone is unlinked and replaced; a live one
    /// is [`TransportError::AlreadyExists`]. A segment another creator is still
    /// laying out gets [`INIT_GRACE`] to finish before it counts as stale.
    pub fn create(name: &str, size: usize, kind: SegmentKind, layout: SessionLayout) -> Result<Self> {
        let os_name = os_name(name)?;
        let size = size.max(core::mem::size_of::<SegmentHeader>());

        let fd = match shm_open(&os_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                let deadline = Instant::now() + INIT_GRACE;
                let mut found = inspect(&os_name);
                while found == NameState::Initializing && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                    found = inspect(&os_name);
                }
                if found == NameState::Live {
                    return Err(TransportError::AlreadyExists(name.to_owned()));
                }
                tracing::warn!(name, ?found, "reclaiming stale shared memory segment");
                // SAFETY: os_name is a valid C string.
                unsafe { libc::shm_unlink(os_name.as_ptr()) };
                shm_open(&os_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR).map_err(|e| {
                    if e.raw_os_error() == Some(libc::EEXIST) {
                        TransportError::AlreadyExists(name.to_owned())
                    } else {
                        TransportError::Io(e)
                    }
                })?
            }
            Err(e) => return Err(TransportError::Io(e)),
        };

        let mapped = ftruncate(&fd, size).and_then(|()| mmap(&fd, size));
        let base = match mapped {
            Ok(base) => base,
            Err(e) => {
                // SAFETY: os_name is a valid C string.
                unsafe { libc::shm_unlink(os_name.as_ptr()) };
                return Err(TransportError::Io(e));
            }
        };

        let segment = Self {
            name: name.to_owned(),
            os_name,
            base,
            len: size,
            owner: true,
            destroyed: AtomicBool::new(false),
        };

        // SAFETY: fresh mapping, zero-filled by ftruncate, nobody else has the
        // header until this returns.
        let header = unsafe { &mut *(segment.base as *mut SegmentHeader) };
        header.init(kind, size as u64, std::process::id(), layout);

        tracing::debug!(name, size, ?kind, "created shared memory segment");
        Ok(segment)
    }

    /// Map an existing segment and check that it holds `kind`.
    pub fn open(name: &str, kind: SegmentKind) -> Result<Self> {
        let os_name = os_name(name)?;
        let fd = shm_open(&os_name, libc::O_RDWR).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOENT) {
                TransportError::NotFound(name.to_owned())
            } else {
                TransportError::Io(e)
            }
        })?;

        let len = fstat_size(&fd)?;
        let header_size = core::mem::size_of::<SegmentHeader>();
        if len < header_size {
            return Err(crate::layout::LayoutError::SegmentTooSmall {
                required: header_size,
                found: len,
            }
            .into());
        }
        let base = mmap(&fd, len)?;

        let segment = Self {
            name: name.to_owned(),
            os_name,
            base,
            len,
            owner: false,
            destroyed: AtomicBool::new(false),
        };
        segment.header().validate(kind, len)?;

        tracing::debug!(name, len, ?kind, "opened shared memory segment");
        Ok(segment)
    }

    /// Whether `name` exists, carries our magic, and its owner is still running.
    ///
    /// Never fails: anything unexpected reads as not alive.
    pub fn is_alive(name: &str) -> bool {
        match os_name(name) {
            Ok(os_name) => inspect(&os_name) == NameState::Live,
            Err(_) => false,
        }
    }

    /// Unlink the segment name. Only the owner may destroy; the second call is a no-op.
    pub fn destroy(&self) -> Result<()> {
        if !self.owner {
            return Err(TransportError::violation(format!(
                "segment `{}` destroyed by a process that did not create it",
                self.name
            )));
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // SAFETY: os_name is a valid C string.
        if unsafe { libc::shm_unlink(self.os_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        tracing::debug!(name = %self.name, "destroyed shared memory segment");
        Ok(())
    }

    /// Record the calling process as the segment's peer.
    pub fn record_peer(&self) {
        self.header()
            .peer_pid
            .store(std::process::id(), Ordering::Release);
    }

    /// Whether the recorded peer is still running. True until a peer records itself.
    pub fn peer_alive(&self) -> bool {
        match self.header().peer_pid.load(Ordering::Acquire) {
            0 => true,
            pid => pid_alive(pid),
        }
    }

    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least one header long and page aligned.
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl MappedRegion for SharedSegment {
    fn region(&self) -> Region {
        // SAFETY: base/len describe a live mapping owned by self.
        unsafe { Region::from_raw(self.base, self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.owner
            && let Err(e) = self.destroy()
        {
            tracing::warn!(name = %self.name, error = %e, "failed to unlink segment");
        }
        // SAFETY: base/len come from mmap in create/open.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

fn shm_open(name: &CString, flags: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: name is a valid C string.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ftruncate(fd: &OwnedFd, size: usize) -> io::Result<()> {
    let size = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))?;
    // SAFETY: fd is a valid descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn fstat_size(fd: &OwnedFd) -> io::Result<usize> {
    // SAFETY: zeroed stat is a valid out-parameter.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is valid and stat is writable.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size.max(0) as usize)
}

fn mmap(fd: &OwnedFd, len: usize) -> io::Result<*mut u8> {
    // SAFETY: fd is valid; the kernel picks the address.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(base as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "ogw-seg-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_open_destroy() {
        let name = unique("basic");
        let owner = SharedSegment::create(&name, 4096, SegmentKind::Server, SessionLayout::default())
            .unwrap();
        assert!(owner.is_owner());
        assert!(SharedSegment::is_alive(&name));

        let peer = SharedSegment::open(&name, SegmentKind::Server).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.header().owner_pid, std::process::id());

        owner.destroy().unwrap();
        owner.destroy().unwrap();
        assert!(!SharedSegment::is_alive(&name));
        assert!(matches!(
            SharedSegment::open(&name, SegmentKind::Server),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn open_missing_is_not_found() {
        let name = unique("missing");
        assert!(matches!(
            SharedSegment::open(&name, SegmentKind::Session),
            Err(TransportError::NotFound(_))
        ));
        assert!(!SharedSegment::is_alive(&name));
    }

    #[test]
    fn live_name_cannot_be_created_twice() {
        let name = unique("twice");
        let _owner =
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()).unwrap();
        assert!(matches!(
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()),
            Err(TransportError::AlreadyExists(_))
        ));
    }

    #[test]
    fn wrong_kind_is_a_layout_error() {
        let name = unique("kind");
        let _owner =
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()).unwrap();
        assert!(matches!(
            SharedSegment::open(&name, SegmentKind::Session),
            Err(TransportError::Layout(_))
        ));
    }

    #[test]
    fn non_owner_destroy_is_rejected() {
        let name = unique("nonowner");
        let _owner =
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()).unwrap();
        let peer = SharedSegment::open(&name, SegmentKind::Server).unwrap();
        assert!(matches!(
            peer.destroy(),
            Err(TransportError::ProtocolViolation(_))
        ));
        assert!(SharedSegment::is_alive(&name));
    }

    #[test]
    fn half_created_segment_is_not_reclaimed() {
        let name = unique("init");
        let os = os_name(&name).unwrap();
        // Another creator: name taken and sized, header not written yet.
        let fd = shm_open(&os, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR).unwrap();
        ftruncate(&fd, 4096).unwrap();
        assert!(!SharedSegment::is_alive(&name));

        thread::scope(|s| {
            let racing = s.spawn(|| {
                SharedSegment::create(&name, 4096, SegmentKind::Server, SessionLayout::default())
            });
            thread::sleep(Duration::from_millis(50));
            let base = mmap(&fd, 4096).unwrap();
            unsafe {
                (*(base as *mut SegmentHeader)).init(
                    SegmentKind::Server,
                    4096,
                    std::process::id(),
                    SessionLayout::default(),
                );
            }
            assert!(matches!(
                racing.join().unwrap(),
                Err(TransportError::AlreadyExists(_))
            ));
            unsafe { libc::munmap(base as *mut libc::c_void, 4096) };
        });

        assert!(SharedSegment::is_alive(&name));
        unsafe { libc::shm_unlink(os.as_ptr()) };
    }

    #[test]
    fn abandoned_half_created_segment_is_reclaimed() {
        let name = unique("abandoned");
        let os = os_name(&name).unwrap();
        let fd = shm_open(&os, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR).unwrap();
        drop(fd);

        let owner =
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()).unwrap();
        assert!(owner.is_owner());
        assert!(SharedSegment::is_alive(&name));
    }

    #[test]
    fn long_names_are_rejected() {
        let name = "x".repeat(NAME_MAX + 1);
        assert!(matches!(
            SharedSegment::create(&name, 256, SegmentKind::Server, SessionLayout::default()),
            Err(TransportError::NameTooLong { .. })
        ));
        assert!(!SharedSegment::is_alive(&name));
    }

    #[test]
    fn peer_liveness_follows_recorded_pid() {
        let name = unique("peer");
        let owner =
            SharedSegment::create(&name, 256, SegmentKind::Session, SessionLayout::default()).unwrap();
        assert!(owner.peer_alive());
        let peer = SharedSegment::open(&name, SegmentKind::Session).unwrap();
        peer.record_peer();
        assert!(owner.peer_alive());

        // A pid far above pid_max never names a live process.
        owner.header().peer_pid.store(0x7fff_fff0, Ordering::Release);
        assert!(!owner.peer_alive());
    }

    #[test]
    fn naming_helpers() {
        assert_eq!(server_segment_name("db"), "db");
        assert_eq!(connection_segment_name("db"), "db-connection");
        assert_eq!(session_segment_name("db", 7), "db-7");
    }
}
