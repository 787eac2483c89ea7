#[cfg(unix)]
use std::os::fd::{FromRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::debug;

#[cfg(unix)]
use crate::error::TransportError;
use crate::error::Result;

/// Boxed inbound half handed to the framing layer.
#[cfg(feature = "async")]
pub type BoxedReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Boxed outbound half handed to the framing layer.
#[cfg(feature = "async")]
pub type BoxedWriter = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// The pair of stream endpoints a channel is bound to.
///
/// Endpoints are inert until adopted: constructing them never touches the
/// descriptors, so a channel can defer connection setup to first use.
pub struct Endpoints {
    inner: EndpointsInner,
}

enum EndpointsInner {
    #[cfg(unix)]
    Descriptors { read_fd: RawFd, write_fd: RawFd },
    #[cfg(feature = "async")]
    Io {
        reader: BoxedReader,
        writer: BoxedWriter,
    },
}

impl Endpoints {
    /// Endpoints over two independent descriptors.
    ///
    /// Passing the same descriptor twice is equivalent to [`Endpoints::shared`].
    #[cfg(unix)]
    pub fn from_descriptors(read_fd: RawFd, write_fd: RawFd) -> Self {
        Self {
            inner: EndpointsInner::Descriptors { read_fd, write_fd },
        }
    }

    /// Endpoints over one shared duplex descriptor.
    #[cfg(unix)]
    pub fn shared(fd: RawFd) -> Self {
        Self::from_descriptors(fd, fd)
    }

    /// Endpoints over already-open async halves (in-process hosts, tests).
    #[cfg(feature = "async")]
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: EndpointsInner::Io {
                reader: Box::new(reader),
                writer: Box::new(writer),
            },
        }
    }

    /// Whether both directions share one underlying connection.
    pub fn is_shared(&self) -> bool {
        match &self.inner {
            #[cfg(unix)]
            EndpointsInner::Descriptors { read_fd, write_fd } => read_fd == write_fd,
            #[cfg(feature = "async")]
            EndpointsInner::Io { .. } => false,
        }
    }

    /// Adopt the descriptors as blocking streams `(reader, writer)`.
    #[cfg(unix)]
    pub fn into_std(self) -> Result<(UnixStream, UnixStream)> {
        match self.inner {
            EndpointsInner::Descriptors { read_fd, write_fd } => {
                let (reader, writer) = adopt_pair(read_fd, write_fd)?;
                let writer = match writer {
                    Some(writer) => writer,
                    None => reader.try_clone()?,
                };
                Ok((reader, writer))
            }
            #[cfg(feature = "async")]
            EndpointsInner::Io { .. } => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "in-process endpoints have no descriptors",
            ))),
        }
    }

    /// Adopt the endpoints as async halves `(reader, writer)`.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(feature = "async")]
    pub fn into_async(self) -> Result<(BoxedReader, BoxedWriter)> {
        match self.inner {
            #[cfg(unix)]
            EndpointsInner::Descriptors { read_fd, write_fd } => {
                let (reader, writer) = adopt_pair(read_fd, write_fd)?;
                reader.set_nonblocking(true)?;
                let reader = tokio::net::UnixStream::from_std(reader)?;

                match writer {
                    None => {
                        let (read_half, write_half) = reader.into_split();
                        Ok((Box::new(read_half), Box::new(write_half)))
                    }
                    Some(writer) => {
                        writer.set_nonblocking(true)?;
                        let writer = tokio::net::UnixStream::from_std(writer)?;
                        Ok((Box::new(reader), Box::new(writer)))
                    }
                }
            }
            EndpointsInner::Io { reader, writer } => Ok((reader, writer)),
        }
    }
}

impl std::fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            EndpointsInner::Descriptors { read_fd, write_fd } => f
                .debug_struct("Endpoints")
                .field("read_fd", read_fd)
                .field("write_fd", write_fd)
                .finish(),
            #[cfg(feature = "async")]
            EndpointsInner::Io { .. } => f.debug_struct("Endpoints").field("type", &"io").finish(),
        }
    }
}

/// Validate both descriptors before taking ownership of either.
///
/// The writer is `None` when both directions share one descriptor.
#[cfg(unix)]
fn adopt_pair(read_fd: RawFd, write_fd: RawFd) -> Result<(UnixStream, Option<UnixStream>)> {
    validate_descriptor(read_fd)?;
    if write_fd != read_fd {
        validate_descriptor(write_fd)?;
    }

    // SAFETY: `read_fd` is an open stream socket handed to this process by the host,
    // and this is the only place that takes ownership of it.
    let reader = unsafe { UnixStream::from_raw_fd(read_fd) };
    if write_fd == read_fd {
        debug!(fd = read_fd, "adopted shared channel descriptor");
        return Ok((reader, None));
    }

    // SAFETY: as above; `write_fd` differs from `read_fd`, so ownership is not shared.
    let writer = unsafe { UnixStream::from_raw_fd(write_fd) };
    debug!(read_fd, write_fd, "adopted channel descriptors");
    Ok((reader, Some(writer)))
}

#[cfg(unix)]
fn validate_descriptor(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD only queries descriptor flags and accepts any integer.
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if rc == -1 {
        return Err(TransportError::InvalidDescriptor {
            fd,
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: an all-zero `stat` is a valid value for this plain C struct.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `stat` is a valid writable pointer and `fd` was just confirmed open.
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc == -1 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }

    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(TransportError::NotASocket { fd });
    }

    Ok(())
}
