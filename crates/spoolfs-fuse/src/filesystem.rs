//! The fuser `Filesystem` implementation.
//!
//! Presents the metadata hierarchy as a read-only tree. Metadata
//! operations bridge into the async runtime with a bounded timeout;
//! data reads are spawned with the kernel reply moved into the task, so
//! a slow backend fetch never blocks the FUSE callback thread and
//! concurrent reads proceed in parallel.
//!
//! Write-family operations are rejected (`EPERM`/`EACCES`): the
//! hierarchy is mutated only by ingestion, never through the mount.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use spoolfs_core::{
    FileRecord, FileReader, MetadataStore, ReaderConfig, SegmentPool,
};
use spoolfs_mount::{CacheStore, RangeFetcher, SessionIdentity, SessionTracker};

use crate::bridge::block_on_with_timeout;
use crate::config::MountConfig;
use crate::error::read_error_to_errno;
use crate::handles::{HandleTable, OpenHandle, ReadTarget, SessionFetcher};
use crate::inode::{InodeKind, InodeTable, ROOT_INODE};

/// Block size reported in attributes and statfs.
const BLOCK_SIZE: u32 = 4096;

/// File permissions (rw-r--r--).
const FILE_PERM: u16 = 0o644;

/// Directory permissions (rwxr-xr-x).
const DIR_PERM: u16 = 0o755;

/// Deadline for metadata operations at the kernel boundary.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only FUSE filesystem over segmented remote archives.
pub struct SpoolFs {
    handle: Handle,
    metadata: Arc<dyn MetadataStore>,
    pool: Arc<dyn SegmentPool>,
    cache: Option<Arc<CacheStore>>,
    sessions: Arc<SessionTracker>,
    reader_cfg: ReaderConfig,
    config: MountConfig,
    inodes: InodeTable,
    handles: HandleTable,
    uid: u32,
    gid: u32,
    /// Parent of every per-open token; cancelled on shutdown.
    root_token: CancellationToken,
}

impl SpoolFs {
    /// Wire up the filesystem against its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Handle,
        metadata: Arc<dyn MetadataStore>,
        pool: Arc<dyn SegmentPool>,
        cache: Option<Arc<CacheStore>>,
        sessions: Arc<SessionTracker>,
        reader_cfg: ReaderConfig,
        config: MountConfig,
        root_token: CancellationToken,
    ) -> Self {
        let uid = config.uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = config.gid.unwrap_or_else(|| unsafe { libc::getgid() });
        info!(
            uid,
            gid,
            cached = cache.is_some(),
            attr_ttl = ?config.attr_timeout,
            "filesystem initialized"
        );
        Self {
            handle,
            metadata,
            pool,
            cache,
            sessions,
            reader_cfg,
            config,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            uid,
            gid,
            root_token,
        }
    }

    /// Mount options implied by the configuration.
    pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::RO,
            MountOption::FSName("spoolfs".to_string()),
            MountOption::Subtype("spoolfs".to_string()),
            MountOption::NoAtime,
            MountOption::DefaultPermissions,
        ];
        if config.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }

    fn exec<F, T>(&self, future: F) -> Result<T, c_int>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        block_on_with_timeout(&self.handle, METADATA_TIMEOUT, future)
            .map_err(|e| e.to_errno())
    }

    fn file_attr(&self, ino: u64, size: u64, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::RegularFile,
            perm: FILE_PERM,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: DIR_PERM,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn join(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    fn parent_path(path: &str) -> &str {
        path.rfind('/').map_or("", |i| &path[..i])
    }

    /// stat then readdir: files take precedence, then directories.
    fn classify(&self, path: &str) -> Result<Option<PathKind>, c_int> {
        let metadata = Arc::clone(&self.metadata);
        let stat_path = path.to_string();
        let record = self
            .exec(async move { metadata.stat(&stat_path).await })?
            .map_err(|e| {
                warn!(path, error = %e, "metadata stat failed");
                libc::EIO
            })?;
        if let Some(record) = record {
            return Ok(Some(PathKind::File(Box::new(record))));
        }
        let metadata = Arc::clone(&self.metadata);
        let dir_path = path.to_string();
        let listing = self
            .exec(async move { metadata.readdir(&dir_path).await })?
            .map_err(|e| {
                warn!(path, error = %e, "metadata readdir failed");
                libc::EIO
            })?;
        Ok(listing.map(|_| PathKind::Directory))
    }
}

enum PathKind {
    File(Box<FileRecord>),
    Directory,
}

impl Filesystem for SpoolFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if self.config.max_read_ahead > 0 {
            if let Err(max) = config.set_max_readahead(self.config.max_read_ahead) {
                debug!(requested = self.config.max_read_ahead, max, "max_readahead clamped");
            }
        }
        info!("mount initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("mount destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if name.len() > 255 {
            reply.error(libc::ENAMETOOLONG);
            return;
        }
        let Some(parent_entry) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::join(&parent_entry.path, name);
        trace!(parent, %path, "lookup");

        match self.classify(&path) {
            Ok(Some(PathKind::File(record))) => {
                let ino = self.inodes.get_or_insert(&path, InodeKind::File);
                let attr = self.file_attr(ino, record.size, record.mtime);
                reply.entry(&self.config.entry_timeout, &attr, 0);
            }
            Ok(Some(PathKind::Directory)) => {
                let ino = self.inodes.get_or_insert(&path, InodeKind::Directory);
                let attr = self.dir_attr(ino);
                reply.entry(&self.config.entry_timeout, &attr, 0);
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(entry) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(ino, path = %entry.path, "getattr");
        match entry.kind {
            InodeKind::Root | InodeKind::Directory => {
                let attr = self.dir_attr(ino);
                reply.attr(&self.config.attr_timeout, &attr);
            }
            InodeKind::File => {
                // Size is never cached from lookup: ingestion may have
                // replaced the record since.
                let metadata = Arc::clone(&self.metadata);
                let path = entry.path.clone();
                match self.exec(async move { metadata.stat(&path).await }) {
                    Ok(Ok(Some(record))) => {
                        let attr = self.file_attr(ino, record.size, record.mtime);
                        reply.attr(&self.config.attr_timeout, &attr);
                    }
                    Ok(Ok(None)) => reply.error(libc::ENOENT),
                    Ok(Err(e)) => {
                        warn!(path = %entry.path, error = %e, "getattr metadata failure");
                        reply.error(libc::EIO);
                    }
                    Err(errno) => reply.error(errno),
                }
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entry) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if entry.kind == InodeKind::File {
            reply.error(libc::ENOTDIR);
            return;
        }
        trace!(ino, path = %entry.path, offset, "readdir");

        let metadata = Arc::clone(&self.metadata);
        let path = entry.path.clone();
        let listing = match self.exec(async move { metadata.readdir(&path).await }) {
            Ok(Ok(Some(listing))) => listing,
            Ok(Ok(None)) => {
                reply.error(libc::ENOENT);
                return;
            }
            Ok(Err(e)) => {
                warn!(path = %entry.path, error = %e, "readdir metadata failure");
                reply.error(libc::EIO);
                return;
            }
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes
                .get_inode(Self::parent_path(&entry.path))
                .unwrap_or(ROOT_INODE)
        };

        let mut full: Vec<(u64, FileType, String)> = Vec::with_capacity(listing.len() + 2);
        full.push((ino, FileType::Directory, ".".to_string()));
        full.push((parent_ino, FileType::Directory, "..".to_string()));
        for child in listing {
            let child_path = Self::join(&entry.path, &child.name);
            let (kind, ftype) = if child.is_dir {
                (InodeKind::Directory, FileType::Directory)
            } else {
                (InodeKind::File, FileType::RegularFile)
            };
            // Per the FUSE spec readdir must not bump lookup counts.
            let child_ino = self.inodes.get_or_insert_no_lookup_inc(&child_path, kind);
            full.push((child_ino, ftype, child.name));
        }

        for (i, (child_ino, ftype, name)) in
            full.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(child_ino, (i + 1) as i64, ftype, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(entry) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match entry.kind {
            InodeKind::Root | InodeKind::Directory => {
                reply.error(libc::EISDIR);
                return;
            }
            InodeKind::File => {}
        }
        if (flags & libc::O_ACCMODE) != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }
        let path = entry.path.clone();
        trace!(ino, %path, "open");

        let metadata = Arc::clone(&self.metadata);
        let stat_path = path.clone();
        let record = match self.exec(async move { metadata.stat(&stat_path).await }) {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                reply.error(libc::ENOENT);
                return;
            }
            Ok(Err(e)) => {
                warn!(%path, error = %e, "open metadata failure");
                reply.error(libc::EIO);
                return;
            }
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let identity = SessionIdentity {
            user: req.uid().to_string(),
            source: "fuse".to_string(),
            client_ip: String::new(),
            user_agent: String::new(),
        };
        let session = self.sessions.open(&path, identity, record.size);

        // Reader lifetime: session removal or shutdown cancels it.
        let reader_token = session.cancellation().child_token();
        let reader = match FileReader::open(
            &record,
            Arc::clone(&self.pool),
            self.reader_cfg.clone(),
            reader_token,
        ) {
            Ok(reader) => Arc::new(reader),
            Err(e) => {
                error!(%path, error = %e, "failed to open segmented reader");
                self.sessions.close(&session);
                reply.error(libc::EIO);
                return;
            }
        };

        let target = match &self.cache {
            Some(store) => {
                let fetcher: Arc<dyn RangeFetcher> = Arc::new(SessionFetcher::new(
                    Arc::clone(&reader),
                    Arc::clone(&session),
                ));
                match store.open(&path, record.size, fetcher, &self.root_token) {
                    Ok(view) => ReadTarget::Cached(view),
                    Err(e) => {
                        error!(%path, error = %e, "failed to open cache view");
                        self.sessions.close(&session);
                        reply.error(libc::EIO);
                        return;
                    }
                }
            }
            None => ReadTarget::direct(Arc::clone(&reader)),
        };

        let handle = OpenHandle::new(ino, target, session, Arc::clone(&self.sessions));
        let fh = self.handles.insert(handle);
        debug!(%path, fh, "file opened");
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(ino, fh, offset, size, "read");
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let off = offset as u64;
        let timeout = self.config.io_timeout;

        // The reply moves into the task: the callback thread returns
        // immediately and reads proceed concurrently.
        self.handle.spawn(async move {
            let mut buf = vec![0u8; size as usize];
            match tokio::time::timeout(timeout, handle.read_at(&mut buf, off)).await {
                Ok(Ok(n)) => reply.data(&buf[..n]),
                Ok(Err(e)) => {
                    if e.is_cancelled() {
                        debug!(fh, "read interrupted by release");
                    } else {
                        warn!(fh, off, error = %e, "read failed");
                    }
                    reply.error(read_error_to_errno(&e));
                }
                Err(_elapsed) => {
                    warn!(fh, off, ?timeout, "read timed out");
                    reply.error(libc::EINTR);
                }
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        if let Some(handle) = self.handles.remove(fh) {
            handle.close();
        }
        // Always succeeds; double release of a gone handle is a no-op.
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EACCES);
        } else {
            reply.ok();
        }
    }

    // The hierarchy is read-only; every mutating operation is refused.

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EPERM);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EPERM);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(libc::EACCES);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EPERM);
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EPERM);
    }
}
