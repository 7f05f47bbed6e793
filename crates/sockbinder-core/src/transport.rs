//! Sockets and framed connections.
//!
//! A [`Connection`] owns one established socket, split into a reader and a
//! writer behind separate async mutexes so one task can wait for a frame
//! while another writes. Frames are written whole: a batch of messages is
//! encoded into one buffer and written under a single writer lock.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::wire::{
    Command, ConnectionAck, ConnectionHeader, FRAME_HEADER_SIZE, Message,
};

/// How long a closing connection may spend writing its shutdown notice.
const NOTICE_TIMEOUT: Duration = Duration::from_millis(100);

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Unix(PathBuf),
    /// Host name or IP literal plus port.
    Inet { host: String, port: u16 },
    /// Needs the `vsock` feature.
    Vsock { cid: u32, port: u32 },
}

impl SocketAddress {
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self::Inet {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Inet { host, port } => write!(f, "inet:{host}:{port}"),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

/// Any byte stream a connection can run over.
pub(crate) trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T> RpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

pub(crate) type BoxStream = Box<dyn RpcStream>;

pub(crate) async fn connect(address: &SocketAddress) -> io::Result<BoxStream> {
    match address {
        SocketAddress::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        SocketAddress::Inet { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(feature = "vsock")]
        SocketAddress::Vsock { cid, port } => {
            let stream =
                tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(*cid, *port)).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(feature = "vsock"))]
        SocketAddress::Vsock { .. } => Err(vsock_unsupported()),
    }
}

#[cfg(not(feature = "vsock"))]
fn vsock_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "built without the `vsock` feature",
    )
}

// ============================================================================
// Listening sockets
// ============================================================================

/// Bind a listening socket and return it as a plain descriptor.
///
/// Servers keep the descriptor until they start accepting, which is also
/// the shape of an externally supplied listener.
pub(crate) fn bind(address: &SocketAddress) -> io::Result<(OwnedFd, Option<u16>)> {
    match address {
        SocketAddress::Unix(path) => {
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            Ok((listener.into(), None))
        }
        SocketAddress::Inet { host, port } => {
            let listener = std::net::TcpListener::bind((host.as_str(), *port))?;
            let port = listener.local_addr()?.port();
            Ok((listener.into(), Some(port)))
        }
        SocketAddress::Vsock { port, .. } => bind_vsock(*port).map(|fd| (fd, None)),
    }
}

#[cfg(feature = "vsock")]
fn bind_vsock(port: u32) -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    // SAFETY: plain socket syscalls; the descriptor is owned as soon as it
    // is valid and every struct passed by pointer outlives its call.
    unsafe {
        let raw = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(raw);
        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = libc::VMADDR_CID_ANY;
        addr.svm_port = port;
        if libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        if libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

#[cfg(not(feature = "vsock"))]
fn bind_vsock(_port: u32) -> io::Result<OwnedFd> {
    Err(vsock_unsupported())
}

fn socket_family(fd: &OwnedFd) -> io::Result<libc::c_int> {
    // SAFETY: getsockname writes at most `len` bytes into `storage`.
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if libc::getsockname(
            fd.as_raw_fd(),
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(storage.ss_family as libc::c_int)
    }
}

pub(crate) enum Listener {
    Unix(tokio::net::UnixListener),
    Inet(tokio::net::TcpListener),
    #[cfg(feature = "vsock")]
    Vsock(tokio_vsock::VsockListener),
}

impl Listener {
    /// Wrap a listening descriptor, detecting its family. Must be called
    /// inside a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        match socket_family(&fd)? {
            libc::AF_UNIX => {
                let listener = std::os::unix::net::UnixListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(Self::Unix(tokio::net::UnixListener::from_std(listener)?))
            }
            libc::AF_INET | libc::AF_INET6 => {
                let listener = std::net::TcpListener::from(fd);
                listener.set_nonblocking(true)?;
                Ok(Self::Inet(tokio::net::TcpListener::from_std(listener)?))
            }
            #[cfg(feature = "vsock")]
            libc::AF_VSOCK => {
                use std::os::fd::{FromRawFd, IntoRawFd};
                // SAFETY: the descriptor is a listening vsock socket we own.
                let listener = unsafe { tokio_vsock::VsockListener::from_raw_fd(fd.into_raw_fd()) };
                Ok(Self::Vsock(listener))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported socket family {family}"),
            )),
        }
    }

    /// Accept one connection, returning the stream and a printable peer.
    pub async fn accept(&self) -> io::Result<(BoxStream, String)> {
        match self {
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_owned()))
            }
            Self::Inet(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(feature = "vsock")]
            Self::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), format!("vsock:{}:{}", peer.cid(), peer.port())))
            }
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

pub(crate) async fn write_header(
    stream: &mut BoxStream,
    header: &ConnectionHeader,
) -> Result<(), TransportError> {
    stream.write_all(&header.encode()).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_header(
    stream: &mut BoxStream,
    timeout: Duration,
) -> Result<ConnectionHeader, TransportError> {
    let mut buf = [0u8; ConnectionHeader::SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
        .map_err(map_read_error)?;
    Ok(ConnectionHeader::decode(&buf)?)
}

pub(crate) async fn write_ack(
    stream: &mut BoxStream,
    ack: &ConnectionAck,
) -> Result<(), TransportError> {
    stream.write_all(&ack.encode()).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_ack(
    stream: &mut BoxStream,
    timeout: Duration,
) -> Result<ConnectionAck, TransportError> {
    let mut buf = [0u8; ConnectionAck::SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
        .map_err(map_read_error)?;
    Ok(ConnectionAck::decode(&buf)?)
}

fn map_read_error(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

// ============================================================================
// Connection
// ============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Connection {
    id: u64,
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: CancellationToken,
    max_frame_size: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a stream that finished its handshake. `closed` is usually a
    /// child of the session token so closing the session closes every
    /// connection.
    pub fn new(stream: BoxStream, closed: CancellationToken, max_frame_size: usize) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            reader: AsyncMutex::new(Box::new(reader)),
            writer: AsyncMutex::new(Box::new(writer)),
            closed,
            max_frame_size,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write `messages` back to back as one buffer.
    pub async fn write_messages(&self, messages: &[Message]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut buf = BytesMut::new();
        for message in messages {
            buf.extend_from_slice(&message.encode());
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => result.map_err(TransportError::Io),
        }
    }

    /// Read the next frame.
    pub async fn read_message(&self) -> Result<Message, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = read_frame(&mut *reader, self.max_frame_size) => result,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Best effort: tell the peer the session is going away, then shut the
    /// write side down. Pending readers and writers are released first.
    pub async fn close_with_notice(&self) {
        self.closed.cancel();
        let notice = Message::SessionShutdown.encode();
        let sent = tokio::time::timeout(NOTICE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&notice).await?;
            writer.flush().await?;
            writer.shutdown().await
        })
        .await;
        match sent {
            Ok(Ok(())) => tracing::trace!(connection = self.id, "shutdown notice sent"),
            Ok(Err(e)) => {
                tracing::trace!(connection = self.id, error = %e, "shutdown notice not sent")
            }
            Err(_) => tracing::trace!(connection = self.id, "shutdown notice timed out"),
        }
    }
}

async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(map_read_error)?;
    let command = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await.map_err(map_read_error)?;
    let command = Command::from_u32(command)?;
    Ok(Message::decode(command, body.freeze())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Reply, WireParcel};

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(Box::new(a), CancellationToken::new(), 1024),
            Connection::new(Box::new(b), CancellationToken::new(), 1024),
        )
    }

    #[tokio::test]
    async fn batches_arrive_in_order() {
        let (a, b) = pair();
        let reply = Message::Reply(Reply {
            txn_id: 4,
            status: 0,
            parcel: WireParcel::default(),
        });
        let dec = Message::DecStrong {
            address: 1,
            amount: 1,
            mentions: 0,
        };
        a.write_messages(&[dec.clone(), reply.clone()]).await.unwrap();
        assert_eq!(b.read_message().await.unwrap(), dec);
        assert_eq!(b.read_message().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (a, b) = pair();
        let reply = Message::Reply(Reply {
            txn_id: 1,
            status: 0,
            parcel: WireParcel {
                data: vec![0u8; 4096].into(),
                offsets: Vec::new(),
            },
        });
        a.write_messages(&[reply]).await.unwrap();
        let err = b.read_message().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { max: 1024, .. }));
    }

    #[tokio::test]
    async fn eof_reads_as_closed() {
        let (a, b) = pair();
        a.close_with_notice().await;
        assert_eq!(b.read_message().await.unwrap(), Message::SessionShutdown);
        assert!(matches!(
            b.read_message().await.unwrap_err(),
            TransportError::Closed
        ));
        assert!(matches!(
            a.write_messages(&[Message::SessionShutdown]).await.unwrap_err(),
            TransportError::Closed
        ));
    }

    #[tokio::test]
    async fn closing_wakes_a_blocked_reader() {
        let (a, _b) = pair();
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_message().await })
        };
        tokio::task::yield_now().await;
        a.close();
        assert!(matches!(
            reader.await.unwrap().unwrap_err(),
            TransportError::Closed
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_a_wire_error() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let b = Connection::new(Box::new(b), CancellationToken::new(), 1024);
        let mut frame = Vec::new();
        frame.extend_from_slice(&(Command::Transact as u32).to_le_bytes());
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        raw.write_all(&frame).await.unwrap();

        let err = b.read_message().await.unwrap_err();
        assert!(matches!(err, TransportError::Wire(_)), "{err:?}");
        assert!(!err.is_disconnect());
    }
}
