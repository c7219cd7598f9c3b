//! Buffered streams over registered descriptors.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use crate::descriptors::{self, TempFd};
use crate::diag::{self, DiagRecord};
use crate::error::{Error, Result};

/// Open flags derived from an `fopen`-style mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub flags: i32,
}

impl OpenMode {
    /// Parse `r`, `w` or `a`, optionally followed by `+`, `b`, `x`, `e`.
    pub fn parse(mode: &str) -> Result<Self> {
        let invalid = || Error::InvalidMode {
            mode: mode.to_owned(),
        };
        let mut chars = mode.chars();
        let (mut access, mut flags) = match chars.next() {
            Some('r') => (libc::O_RDONLY, 0),
            Some('w') => (libc::O_WRONLY, libc::O_CREAT | libc::O_TRUNC),
            Some('a') => (libc::O_WRONLY, libc::O_CREAT | libc::O_APPEND),
            _ => return Err(invalid()),
        };
        for c in chars {
            match c {
                '+' => access = libc::O_RDWR,
                'b' => {}
                'x' => flags |= libc::O_EXCL,
                'e' => flags |= libc::O_CLOEXEC,
                _ => return Err(invalid()),
            }
        }
        Ok(Self {
            flags: access | flags,
        })
    }
}

/// Borrowed view of a descriptor the registry owns. Never closes it.
struct FdIo {
    file: ManuallyDrop<File>,
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FdIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// A buffered temp-file stream returned by [`fopen_temp`].
///
/// Writes are buffered; reads and seeks flush pending output first. Drop
/// flushes (ignoring errors) and closes through the registry.
pub struct TempStream {
    // Field order: the buffer flushes before the descriptor closes.
    io: BufWriter<FdIo>,
    fd: TempFd,
}

impl TempStream {
    fn new(fd: TempFd) -> Self {
        #[allow(unsafe_code)]
        // SAFETY: the descriptor stays open for as long as `fd` is held,
        // and ManuallyDrop keeps File from closing it.
        let file = unsafe { File::from_raw_fd(fd.as_raw_fd()) };
        Self {
            io: BufWriter::new(FdIo {
                file: ManuallyDrop::new(file),
            }),
            fd,
        }
    }

    /// Flush, then close the descriptor even if flushing failed.
    ///
    /// A write error takes precedence; a close error that follows it is
    /// emitted as a diagnostic instead of being lost.
    pub fn close(self) -> Result<()> {
        let Self { mut io, fd } = self;
        let flushed = io.flush().map_err(|source| Error::Write { source });
        // Unflushed bytes must not be retried once the descriptor is gone.
        let _ = io.into_parts();
        let closed = fd.close();
        match (flushed, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(write), Err(close)) => {
                diag::emit(&DiagRecord::from_error(&close));
                Err(write)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        }
    }
}

impl Read for TempStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.flush()?;
        self.io.get_mut().file.read(buf)
    }
}

impl Write for TempStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

impl Seek for TempStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.io.seek(pos)
    }
}

impl AsRawFd for TempStream {
    fn as_raw_fd(&self) -> RawFd {
        self.io.get_ref().file.as_raw_fd()
    }
}

impl std::fmt::Debug for TempStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempStream")
            .field("fd", &self.as_raw_fd())
            .field("buffered", &self.io.buffer().len())
            .finish()
    }
}

/// Open `path` with an `fopen`-style mode and register its descriptor.
pub fn fopen_temp(path: impl AsRef<Path>, mode: &str, delete_on_close: bool) -> Result<TempStream> {
    let mode = OpenMode::parse(mode)?;
    let fd = descriptors::open_temp(path, mode.flags, 0o666, delete_on_close)?;
    Ok(TempStream::new(fd))
}

/// Flush and close `stream`.
pub fn fclose_temp(stream: TempStream) -> Result<()> {
    stream.close()
}

/// Flush pending output and report whether any write failed, keeping the
/// stream open.
pub fn fwriteerror_temp(stream: &mut TempStream) -> Result<()> {
    stream.flush().map_err(|source| Error::Write { source })
}
