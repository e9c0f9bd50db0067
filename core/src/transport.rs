//! RPC transport to the master
//!
//! One bidirectional socket carries the whole control protocol. The socket
//! is not safe for concurrent use, so every operation takes the same async
//! mutex; `recv` holds it for at most [`WorkerConfig::recv_timeout`] before
//! yielding a [`Recv::TimedOut`], which guarantees senders (most
//! importantly the heartbeater) get the lock several times per heartbeat
//! interval.
//!
//! Frames are a 4-byte big-endian length prefix followed by one encoded
//! [`Message`]. Bytes read past a timeout stay in the transport's buffer,
//! so a slow frame is never corrupted by the bounded wait.
//!
//! [`WorkerConfig::recv_timeout`]: crate::config::WorkerConfig::recv_timeout

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::message::Message;

/// Upper bound on a single frame; a larger declared length means the
/// stream is desynchronized and the connection is torn down.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Outcome of a bounded receive
#[derive(Debug)]
pub enum Recv {
    /// A complete message arrived
    Message(Message),
    /// Nothing (or only a partial frame) arrived within the window
    TimedOut,
}

/// A bidirectional message channel to the master
///
/// `send` is safe from any task and blocks until the message is handed to
/// the socket. `recv` is meant for one dedicated reader. `close` is
/// idempotent and safe against concurrent calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message, blocking until it is written out
    async fn send(&self, message: &Message) -> Result<()>;

    /// Receive one message, waiting at most the configured timeout
    async fn recv(&self) -> Result<Recv>;

    /// Shut the channel down
    async fn close(&self) -> Result<()>;
}

struct Inner {
    stream: TcpStream,
    buf: BytesMut,
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    inner: Mutex<Inner>,
    recv_timeout: Duration,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connect to the master
    pub async fn connect(host: &str, port: u16, recv_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(host, port, "connected to master");
        Ok(Self::from_stream(stream, recv_timeout))
    }

    /// Wrap an already-connected stream
    pub fn from_stream(stream: TcpStream, recv_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream,
                buf: BytesMut::with_capacity(8 * 1024),
            }),
            recv_timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        Ok(())
    }
}

/// Split one complete frame off the front of `buf`, if present.
fn take_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).to_vec()))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        let payload = message.encode()?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut inner = self.inner.lock().await;
        inner.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Recv> {
        self.check_open()?;
        let mut inner = self.inner.lock().await;
        let deadline = Instant::now() + self.recv_timeout;
        loop {
            if let Some(frame) = take_frame(&mut inner.buf)? {
                return Ok(Recv::Message(Message::decode(&frame)?));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Recv::TimedOut);
            }

            let Inner { stream, buf } = &mut *inner;
            match tokio::time::timeout(remaining, stream.read_buf(buf)).await {
                Err(_) => return Ok(Recv::TimedOut),
                Ok(Ok(0)) => return Err(Error::TransportClosed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Error::Transport(e)),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let _ = inner.stream.shutdown().await;
        tracing::debug!("transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;

    use tokio::net::TcpListener;

    /// Frame-level peer for driving a [`TcpTransport`] under test.
    struct MasterDouble {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl MasterDouble {
        async fn send(&mut self, message: &Message) {
            let payload = message.encode().unwrap();
            let mut frame = Vec::with_capacity(4 + payload.len());
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(&payload);
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            loop {
                if let Some(frame) = take_frame(&mut self.buf).unwrap() {
                    return Message::decode(&frame).unwrap();
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "peer closed while awaiting frame");
            }
        }
    }

    async fn connected_pair(recv_timeout: Duration) -> (TcpTransport, MasterDouble) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (transport, accepted) = tokio::join!(
            async {
                TcpTransport::connect("127.0.0.1", addr.port(), recv_timeout)
                    .await
                    .unwrap()
            },
            async { listener.accept().await.unwrap().0 },
        );
        let master = MasterDouble {
            stream: accepted,
            buf: BytesMut::new(),
        };
        (transport, master)
    }

    #[tokio::test]
    async fn test_send_and_recv_round_trip() {
        let (transport, mut master) = connected_pair(Duration::from_millis(300)).await;

        transport
            .send(&Message::client_ready("node_a"))
            .await
            .unwrap();
        let seen = master.recv().await;
        assert_eq!(seen.kind, message::CLIENT_READY);

        master.send(&Message::empty(message::ACK, "master")).await;
        match transport.recv().await.unwrap() {
            Recv::Message(m) => assert_eq!(m.kind, message::ACK),
            Recv::TimedOut => panic!("expected a message"),
        }
    }

    #[tokio::test]
    async fn test_recv_times_out_when_idle() {
        let (transport, _master) = connected_pair(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        assert!(matches!(transport.recv().await.unwrap(), Recv::TimedOut));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_partial_frame_survives_timeout() {
        let (transport, mut master) = connected_pair(Duration::from_millis(50)).await;

        let payload = Message::empty(message::STOP, "master").encode().unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);

        // first half, then a recv that must time out without eating it
        master.stream.write_all(&frame[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(transport.recv().await.unwrap(), Recv::TimedOut));

        master.stream.write_all(&frame[5..]).await.unwrap();
        match transport.recv().await.unwrap() {
            Recv::Message(m) => assert_eq!(m.kind, message::STOP),
            Recv::TimedOut => panic!("frame should have completed"),
        }
    }

    #[tokio::test]
    async fn test_senders_interleave_with_reader_loop() {
        // S5 shape: a reader hogging the socket must not starve senders.
        let (transport, mut master) = connected_pair(Duration::from_millis(50)).await;
        let transport = std::sync::Arc::new(transport);

        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move {
                loop {
                    match transport.recv().await {
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
        };

        for i in 0..10 {
            let start = std::time::Instant::now();
            transport
                .send(&Message::heartbeat("node_a", "running", 0.0, i))
                .await
                .unwrap();
            // each send must get the lock within one recv window plus slack
            assert!(start.elapsed() < Duration::from_millis(300));
            let seen = master.recv().await;
            assert_eq!(seen.kind, message::HEARTBEAT);
        }

        transport.close().await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _master) = connected_pair(Duration::from_millis(50)).await;

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.send(&Message::client_stopped("node_a")).await,
            Err(Error::TransportClosed)
        ));
        assert!(matches!(transport.recv().await, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_fatal() {
        let (transport, master) = connected_pair(Duration::from_millis(200)).await;
        drop(master);

        assert!(matches!(transport.recv().await, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_recoverable() {
        let (transport, mut master) = connected_pair(Duration::from_millis(100)).await;

        let garbage = b"definitely not json";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        frame.extend_from_slice(garbage);
        master.stream.write_all(&frame).await.unwrap();

        let err = match transport.recv().await {
            Err(e) => e,
            Ok(_) => panic!("expected a protocol error"),
        };
        assert!(err.is_recoverable());

        // the stream stays framed: the next message still decodes
        master.send(&Message::empty(message::ACK, "master")).await;
        assert!(matches!(
            transport.recv().await.unwrap(),
            Recv::Message(m) if m.kind == message::ACK
        ));
    }
}
