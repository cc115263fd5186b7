//! Session-scoped named pipes
//!
//! An [`EphemeralPipe`] is a FIFO node living in its own private temporary
//! directory. Unrelated processes can open the path and write into the
//! session; the directory is removed when the pipe is closed or dropped.

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tempfile::TempDir;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::{MuxError, MuxResult};

const FIFO_MODE: u32 = 0o666;

/// Non-blocking descriptor on a FIFO, driven by the tokio reactor
#[derive(Debug)]
pub struct PipeStream {
    fd: AsyncFd<File>,
}

impl PipeStream {
    fn from_file(file: File) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }

    /// Duplicate the descriptor. Both handles read from and write to the
    /// same FIFO.
    pub fn try_clone(&self) -> io::Result<Self> {
        Self::from_file(self.fd.get_ref().try_clone()?)
    }

    fn into_file(self) -> File {
        self.fd.into_inner()
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// FIFO node plus the temp directory that holds it.
///
/// Opened read-write, so reads never observe EOF while this handle lives.
#[derive(Debug)]
pub struct EphemeralPipe {
    dir: TempDir,
    path: PathBuf,
    stream: PipeStream,
}

impl EphemeralPipe {
    /// Create `<tmp>/<name>-XXXXXX/<name>-namedpipe` and open it.
    ///
    /// Must be called from within a tokio runtime. On any failure after the
    /// directory exists, the directory is removed before returning.
    pub fn create(name: &str) -> MuxResult<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(MuxError::resource(
                format!("invalid pipe name {:?}", name),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir()
            .map_err(|e| MuxError::resource("failed to create temp directory", e))?;

        let path = dir.path().join(format!("{}-namedpipe", name));

        match open_fifo(&path) {
            Ok(stream) => {
                debug!(path = %path.display(), "Ephemeral pipe created");
                Ok(Self { dir, path, stream })
            }
            Err(err) => {
                if let Err(e) = dir.close() {
                    warn!(error = %e, "Failed to remove temp directory after pipe setup failure");
                }
                Err(err)
            }
        }
    }

    /// Filesystem path of the FIFO node
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Private directory holding the FIFO node
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Independent stream on a duplicated descriptor.
    ///
    /// The clone may be handed to another component; this pipe keeps the
    /// obligation to remove the directory.
    pub fn try_clone_stream(&self) -> MuxResult<PipeStream> {
        self.stream
            .try_clone()
            .map_err(|e| MuxError::resource("failed to duplicate pipe descriptor", e))
    }

    /// Close the descriptor, then remove the directory tree.
    ///
    /// Removal is attempted even if the descriptor close fails. A removal
    /// error takes precedence over a descriptor error.
    pub fn close(self) -> MuxResult<()> {
        self.close_with(close_descriptor)
    }

    fn close_with(self, close_fd: impl FnOnce(File) -> io::Result<()>) -> MuxResult<()> {
        let Self { dir, path, stream } = self;

        let fd_result = close_fd(stream.into_file());
        let dir_path = dir.path().to_path_buf();
        let dir_result = dir.close();

        debug!(path = %path.display(), "Ephemeral pipe closed");

        match (fd_result, dir_result) {
            (fd_result, Err(e)) => {
                if let Err(fd_err) = fd_result {
                    warn!(error = %fd_err, "Pipe descriptor close failed");
                }
                Err(MuxError::resource(
                    format!("failed to remove {}", dir_path.display()),
                    e,
                ))
            }
            (Err(e), Ok(())) => Err(MuxError::Stream(e)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

impl AsyncRead for EphemeralPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for EphemeralPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

fn open_fifo(path: &Path) -> MuxResult<PipeStream> {
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(FIFO_MODE)).map_err(|e| {
        MuxError::resource(format!("failed to create fifo {}", path.display()), e.into())
    })?;

    // mkfifo is subject to the umask
    std::fs::set_permissions(path, Permissions::from_mode(FIFO_MODE))
        .map_err(|e| MuxError::resource("failed to set fifo permissions", e))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|e| MuxError::resource(format!("failed to open fifo {}", path.display()), e))?;

    PipeStream::from_file(file)
        .map_err(|e| MuxError::resource("failed to register fifo with the reactor", e))
}

fn close_descriptor(file: File) -> io::Result<()> {
    nix::unistd::close(file.into_raw_fd()).map_err(io::Error::from)
}
