//! Line-framed TCP connection carrying handshake frames
//!
//! One frame per line. Reads are bounded by a maximum line length so a peer
//! cannot make us buffer without limit.

use crate::error::FrameError;
use crate::frame::{Frame, Inbound, decode_line};
use crate::node::error::{NodeError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A TCP stream speaking newline-delimited frames
pub struct FrameStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    max_frame_len: usize,
    line: String,
}

impl FrameStream {
    /// Wrap an accepted or connected stream
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the peer address cannot be read.
    pub fn new(stream: TcpStream, max_frame_len: usize) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            max_frame_len,
            line: String::new(),
        })
    }

    /// Connect to `addr`, giving up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Timeout`] or [`NodeError::Transport`] on failure.
    pub async fn connect(addr: SocketAddr, timeout: Duration, max_frame_len: usize) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::timeout("connect"))?
            .map_err(|e| NodeError::Transport(format!("connect to {addr} failed: {e}").into()))?;
        Self::new(stream, max_frame_len)
            .map_err(|e| NodeError::Transport(format!("socket setup failed: {e}").into()))
    }

    /// Remote address of the connection
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if encoding or writing fails.
    pub async fn send(&mut self, frame: &Frame) -> std::result::Result<(), FrameError> {
        let line = frame.to_line()?;
        tracing::trace!("-> {} {}", self.peer_addr, frame.message_type());
        self.send_line(&line).await
    }

    /// Send one raw line (a newline is appended)
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Io`] if writing fails.
    pub async fn send_line(&mut self, line: &str) -> std::result::Result<(), FrameError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive one raw line without its terminator
    ///
    /// A final line cut off by EOF without a newline is still returned;
    /// legacy senders do not terminate their single message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Closed`] at EOF and [`FrameError::TooLong`] if
    /// the line exceeds the configured limit.
    pub async fn recv_line(&mut self) -> std::result::Result<&str, FrameError> {
        self.line.clear();
        let limit = self.max_frame_len as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_line(&mut self.line)
            .await?;

        if read == 0 {
            return Err(FrameError::Closed);
        }
        if !self.line.ends_with('\n') && read as u64 >= limit {
            return Err(FrameError::TooLong {
                limit: self.max_frame_len,
            });
        }
        Ok(self.line.trim_end_matches(['\r', '\n']))
    }

    /// Receive and decode one inbound line
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] on EOF, oversize or undecodable input.
    pub async fn recv(&mut self) -> std::result::Result<Inbound, FrameError> {
        let line = self.recv_line().await?;
        let inbound = decode_line(line)?;
        if let Inbound::Frame(frame) = &inbound {
            tracing::trace!("<- {} {}", self.peer_addr, frame.message_type());
        }
        Ok(inbound)
    }

    /// Receive one structured frame, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Timeout`] if nothing arrives in time and
    /// [`NodeError::Protocol`] if a legacy line arrives instead of a frame.
    pub async fn recv_frame(&mut self, timeout: Duration) -> Result<Frame> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Err(_) => Err(NodeError::timeout("waiting for response frame")),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(Inbound::Frame(frame))) => Ok(frame),
            Ok(Ok(Inbound::Legacy(_))) => Err(NodeError::protocol(
                "plain-text message received during handshake",
            )),
        }
    }

    /// Close the write half; the peer sees EOF
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!("Shutdown of {} failed: {}", self.peer_addr, e);
        }
    }
}
