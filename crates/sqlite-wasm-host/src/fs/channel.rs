//! One open file or directory.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::lock::LockType;
use super::os_lock;

/// What a channel refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A regular file with an open OS handle.
    File,
    /// A directory, kept only for `*at` path resolution and `fstat`.
    Directory,
}

/// State behind a guest file descriptor.
///
/// The position is tracked here rather than in the OS handle so positional
/// reads and writes never disturb it.
#[derive(Debug)]
pub struct Channel {
    path: PathBuf,
    canonical: PathBuf,
    kind: ChannelKind,
    file: Option<File>,
    position: u64,
    append: bool,
    flags: i32,
}

impl Channel {
    /// Wrap an opened file.
    pub fn file(path: PathBuf, canonical: PathBuf, file: File, append: bool, flags: i32) -> Self {
        Self {
            path,
            canonical,
            kind: ChannelKind::File,
            file: Some(file),
            position: 0,
            append,
            flags,
        }
    }

    /// Describe an opened directory.
    pub fn directory(path: PathBuf, canonical: PathBuf, flags: i32) -> Self {
        Self {
            path,
            canonical,
            kind: ChannelKind::Directory,
            file: None,
            position: 0,
            append: false,
            flags,
        }
    }

    /// Path as the guest named it, resolved against its directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical path; the key for advisory locks.
    pub fn canonical(&self) -> &Path {
        &self.canonical
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns `true` for directories.
    pub fn is_directory(&self) -> bool {
        self.kind == ChannelKind::Directory
    }

    /// Flags passed to `openat`.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Set the position; positions past the end are allowed.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::IsADirectory))
    }

    /// Size of the underlying file.
    pub fn len(&mut self) -> io::Result<u64> {
        Ok(self.handle()?.metadata()?.len())
    }

    /// Returns `true` if the file is empty.
    pub fn is_empty(&mut self) -> io::Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Metadata of the underlying file or directory.
    pub fn metadata(&self) -> io::Result<std::fs::Metadata> {
        match &self.file {
            Some(file) => file.metadata(),
            None => std::fs::metadata(&self.path),
        }
    }

    /// Read up to `lens[i]` bytes per buffer at the current position,
    /// advancing it.
    ///
    /// Stops after the first short buffer.
    pub fn read(&mut self, lens: &[usize]) -> io::Result<Vec<Vec<u8>>> {
        let position = self.position;
        let bufs = self.pread(lens, position)?;
        self.position += bufs.iter().map(|buf| buf.len() as u64).sum::<u64>();
        Ok(bufs)
    }

    /// Read at `offset` without moving the position.
    ///
    /// Buffers are never larger than what remains of the file past `offset`.
    pub fn pread(&mut self, lens: &[usize], offset: u64) -> io::Result<Vec<Vec<u8>>> {
        let file = self.handle()?;
        let mut remaining = file.metadata()?.len().saturating_sub(offset);
        file.seek(SeekFrom::Start(offset))?;
        let mut bufs = Vec::with_capacity(lens.len());
        for &len in lens {
            let capped = usize::try_from(remaining).map_or(len, |remaining| remaining.min(len));
            let mut buf = vec![0; capped];
            let n = read_full(file, &mut buf)?;
            buf.truncate(n);
            remaining -= n as u64;
            bufs.push(buf);
            if n < len {
                break;
            }
        }
        Ok(bufs)
    }

    /// Write at the current position, or at the end in append mode.
    pub fn write(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        let offset = if self.append {
            self.len()?
        } else {
            self.position
        };
        let total = self.pwrite(bufs, offset)?;
        self.position = offset + total as u64;
        Ok(total)
    }

    /// Write at `offset` without moving the position.
    pub fn pwrite(&mut self, bufs: &[&[u8]], offset: u64) -> io::Result<usize> {
        let file = self.handle()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        for buf in bufs {
            file.write_all(buf)?;
            total += buf.len();
        }
        Ok(total)
    }

    /// Take (`Some`) or release (`None`) a host advisory lock on the range.
    ///
    /// Returns `Ok(false)` if another open file description holds a
    /// conflicting lock. Directories are never locked.
    pub fn os_lock(&self, lock_type: Option<LockType>, start: u64, end: u64) -> io::Result<bool> {
        match &self.file {
            Some(file) => os_lock::try_lock(file, lock_type, start, end),
            None => Ok(true),
        }
    }

    /// Truncate or extend the file.
    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.handle()?.set_len(len)
    }

    /// Flush data and metadata.
    pub fn sync_all(&mut self) -> io::Result<()> {
        match self.kind {
            ChannelKind::File => self.handle()?.sync_all(),
            ChannelKind::Directory => Ok(()),
        }
    }

    /// Flush data only.
    pub fn sync_data(&mut self) -> io::Result<()> {
        match self.kind {
            ChannelKind::File => self.handle()?.sync_data(),
            ChannelKind::Directory => Ok(()),
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
