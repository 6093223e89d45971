//! Listener and connection sessions for the relay protocol.
//!
//! A connection starts in `AwaitingHeader`, accumulating the 7-byte stream
//! header across however many partial reads it takes, then streams fixed-size
//! audio blocks until the peer closes. Sockets are nonblocking; a session
//! yields `READABLE` whenever its socket runs dry and the scheduler resumes
//! it when data arrives. A zero-length read is the normal end of stream at
//! any point.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::device::{OutputBackend, OutputHandle, OutputSpec};
use crate::pipeline::{ChannelChop, PlaybackPipeline};
use crate::reactor::{Readiness, Session, SessionEntry, Step};
use crate::wire::{HEADER_LEN, SampleFormat, StreamHeader};

/// Accepts inbound connections on one bound address and spawns a
/// [`ConnectionSession`] per accept. Never completes on its own; an
/// unrecoverable accept error tears down this listener only.
pub(crate) struct ListenerSession {
    listener: TcpListener,
    label: String,
    backend: Rc<dyn OutputBackend>,
}

impl ListenerSession {
    pub(crate) fn new(listener: TcpListener, backend: Rc<dyn OutputBackend>) -> Result<Self> {
        let label = listener
            .local_addr()
            .context("listener local addr")?
            .to_string();
        Ok(Self {
            listener,
            label,
            backend,
        })
    }
}

impl Session for ListenerSession {
    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn resume(&mut self, _ready: Readiness, spawned: &mut Vec<SessionEntry>) -> Result<Step> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!(peer = %peer, "accepted connection");
                    stream.set_nodelay(true).ok(); // best-effort; not fatal
                    stream
                        .set_nonblocking(true)
                        .with_context(|| format!("set_nonblocking for {peer}"))?;
                    let conn =
                        ConnectionSession::new(stream, peer.to_string(), self.backend.clone());
                    spawned.push(SessionEntry::new(Box::new(conn), Readiness::READABLE));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Yield(Readiness::READABLE));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e).context("accept connection"),
            }
        }
    }
}

enum Phase {
    AwaitingHeader { buf: [u8; HEADER_LEN], filled: usize },
    Streaming(Streaming),
}

struct Streaming {
    block: Vec<u8>,
    filled: usize,
    pipeline: PlaybackPipeline,
    output: Box<dyn OutputHandle>,
}

impl Drop for Streaming {
    fn drop(&mut self) {
        // Stop and join the consumer before releasing the device handle so no
        // write can land on a closed stream.
        self.pipeline.shutdown();
        self.output.close();
    }
}

/// Protocol state machine for one accepted connection:
/// `AwaitingHeader → Streaming → (closed)`.
///
/// The playback pipeline and output stream exist only in `Streaming` and are
/// torn down exactly once when the session drops, whichever path ends it.
pub(crate) struct ConnectionSession {
    stream: TcpStream,
    peer: String,
    backend: Rc<dyn OutputBackend>,
    phase: Phase,
}

impl ConnectionSession {
    pub(crate) fn new(stream: TcpStream, peer: String, backend: Rc<dyn OutputBackend>) -> Self {
        Self {
            stream,
            peer,
            backend,
            phase: Phase::AwaitingHeader {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
        }
    }

    fn start_streaming(&self, header: StreamHeader) -> Result<Streaming> {
        let format = SampleFormat::from_wire(header.format)
            .ok_or_else(|| anyhow!("unknown sample format {:#06x}", header.format))?;

        let capacity = self.backend.channel_capacity();
        let out_channels = header.channels.min(capacity);
        let chop = if header.channels > capacity {
            tracing::warn!(
                peer = %self.peer,
                from = header.channels,
                to = capacity,
                "chopping channels down to device capacity"
            );
            Some(ChannelChop {
                in_channels: header.channels as usize,
                out_channels: out_channels as usize,
                sample_size: format.sample_size(),
            })
        } else {
            None
        };

        let opened = self.backend.open(&OutputSpec {
            format,
            sample_rate: header.sample_rate,
            channels: out_channels,
            frames_per_block: header.frames_per_block,
        })?;

        // Bounded wait so the consumer re-checks its stop flag shortly after
        // the last block of a closing connection.
        let wait = Duration::from_secs_f64(
            header.frames_per_block as f64 / header.sample_rate as f64 + 0.1,
        );
        let pipeline = PlaybackPipeline::new(opened.sink, chop, wait, self.peer.clone());

        tracing::info!(
            peer = %self.peer,
            channels = header.channels,
            rate_hz = header.sample_rate,
            frames_per_block = header.frames_per_block,
            "connected and audio stream initialized"
        );

        Ok(Streaming {
            block: vec![0; header.block_len(format)],
            filled: 0,
            pipeline,
            output: opened.handle,
        })
    }
}

impl Session for ConnectionSession {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn label(&self) -> &str {
        &self.peer
    }

    fn resume(&mut self, _ready: Readiness, _spawned: &mut Vec<SessionEntry>) -> Result<Step> {
        loop {
            // The borrow of `phase` ends before the header branch below
            // constructs the streaming state.
            let header = match &mut self.phase {
                Phase::AwaitingHeader { buf, filled } => {
                    match read_some(&mut self.stream, &mut buf[*filled..]) {
                        ReadSome::Eof => return Ok(Step::Done),
                        ReadSome::WouldBlock => return Ok(Step::Yield(Readiness::READABLE)),
                        ReadSome::Failed(e) => return Err(e).context("read stream header"),
                        ReadSome::Data(n) => {
                            *filled += n;
                            if *filled < HEADER_LEN {
                                continue;
                            }
                            StreamHeader::decode(buf)
                        }
                    }
                }
                Phase::Streaming(s) => {
                    match read_some(&mut self.stream, &mut s.block[s.filled..]) {
                        ReadSome::Eof => return Ok(Step::Done),
                        ReadSome::WouldBlock => return Ok(Step::Yield(Readiness::READABLE)),
                        ReadSome::Failed(e) => return Err(e).context("read audio block"),
                        ReadSome::Data(n) => {
                            s.filled += n;
                            if s.filled == s.block.len() {
                                s.pipeline.submit(&s.block);
                                s.filled = 0;
                                // One block per resumption; leftover buffered
                                // bytes keep the socket readable.
                                return Ok(Step::Yield(Readiness::READABLE));
                            }
                            continue;
                        }
                    }
                }
            };

            let streaming = self.start_streaming(header)?;
            self.phase = Phase::Streaming(streaming);
            return Ok(Step::Yield(Readiness::READABLE));
        }
    }
}

enum ReadSome {
    Data(usize),
    Eof,
    WouldBlock,
    Failed(io::Error),
}

fn read_some(stream: &mut TcpStream, buf: &mut [u8]) -> ReadSome {
    loop {
        return match stream.read(buf) {
            Ok(0) => ReadSome::Eof,
            Ok(n) => ReadSome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadSome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => ReadSome::Failed(e),
        };
    }
}
