//! One serial connection per peripheral.
//!
//! A [`HardwareLink`] splits its port: the write half stays with the link and is only
//! used by the state machine, the read half moves into a background reader task. The
//! reader decodes lines into the shared event queue and, on request, diverts the next
//! `n` non-text bytes into a capture. Text lines that arrive while a capture is open
//! still reach the queue; valve bytes are never printable so the two cannot mix.
//!
//! # Example
//!
//! ```rust,ignore
//! let (sender, queue) = EventQueue::new();
//! let links = LinkPair::open(&config, sender).await?;
//! links.motor.send(&Command::DoorDown).await?;
//! ```

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::RigConfig;
use crate::error::{LinkError, ProtocolError};
use crate::hardware::protocol::{Command, Framed, LineDecoder};
use crate::hardware::serial::{drain_serial_buffer, open_serial_async, DynSerial};
use crate::hardware::LinkId;
use crate::ingest::{EventSender, Payload};

const READ_CHUNK: usize = 256;

enum ReaderRequest {
    Capture {
        count: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

/// Raw bytes promised by the reader.
pub struct PendingCapture {
    link: LinkId,
    expected: usize,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl PendingCapture {
    /// Wait for the bytes, at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let timed_out = || ProtocolError::VerifyTimeout {
            link: self.link,
            expected: self.expected,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            // Reader gone counts the same as silence.
            Ok(Err(_)) | Err(_) => Err(timed_out()),
        }
    }
}

/// Connection to one peripheral board.
pub struct HardwareLink {
    id: LinkId,
    writer: Mutex<WriteHalf<DynSerial>>,
    requests: mpsc::UnboundedSender<ReaderRequest>,
    reader: JoinHandle<()>,
}

impl HardwareLink {
    /// Split `port` and start its background reader.
    pub fn spawn(id: LinkId, port: DynSerial, events: EventSender) -> Self {
        let (read_half, write_half) = tokio::io::split(port);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(id, read_half, request_rx, events));
        tracing::debug!(link = %id, "Started background reader");
        Self {
            id,
            writer: Mutex::new(write_half),
            requests,
            reader,
        }
    }

    /// Which peripheral this is.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Write one command. Fire-and-forget: no response is awaited.
    pub async fn send(&self, command: &Command) -> Result<(), LinkError> {
        let frame = command.encode();
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                tracing::debug!(link = %self.id, command = command.name(), bytes = frame.len(), "Sent command");
                Ok(())
            }
            Err(source) => {
                tracing::error!(link = %self.id, command = command.name(), error = %source, "Command write failed");
                Err(LinkError::Write {
                    link: self.id,
                    source,
                })
            }
        }
    }

    /// Ask the reader to hand over the next `count` raw bytes.
    ///
    /// Register the capture before sending the command that triggers the bytes.
    pub fn capture(&self, count: usize) -> Result<PendingCapture, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ReaderRequest::Capture { count, reply })
            .map_err(|_| LinkError::Closed { link: self.id })?;
        Ok(PendingCapture {
            link: self.id,
            expected: count,
            rx,
        })
    }

    /// Whether the background reader has exited.
    pub fn reader_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for HardwareLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Capture {
    remaining: usize,
    bytes: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

async fn reader_loop(
    id: LinkId,
    mut port: ReadHalf<DynSerial>,
    mut requests: mpsc::UnboundedReceiver<ReaderRequest>,
    events: EventSender,
) {
    let mut decoder = LineDecoder::new();
    let mut capture: Option<Capture> = None;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            request = requests.recv() => match request {
                Some(ReaderRequest::Capture { count, reply }) => {
                    tracing::debug!(link = %id, count, "Capturing raw bytes");
                    if count == 0 {
                        let _ = reply.send(Vec::new());
                    } else {
                        capture = Some(Capture { remaining: count, bytes: Vec::with_capacity(count), reply });
                    }
                }
                None => break,
            },

            read = port.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::warn!(link = %id, "Serial port closed");
                    events.push(id, Payload::Disconnected("end of stream".to_string()));
                    break;
                }
                Ok(n) => {
                    if capture.as_ref().is_some_and(|c| c.reply.is_closed()) {
                        tracing::warn!(link = %id, "Capture abandoned by host");
                        capture = None;
                    }
                    decoder.extend(&buf[..n]);
                    if let Some(active) = capture.as_mut() {
                        while active.remaining > 0 {
                            match decoder.next_framed(active.remaining) {
                                Some(Framed::Raw(bytes)) => {
                                    active.remaining -= bytes.len();
                                    active.bytes.extend_from_slice(&bytes);
                                }
                                Some(Framed::Line(line)) => {
                                    tracing::trace!(link = %id, line = %line, "Received line during capture");
                                    if !events.push(id, Payload::Line(line)) {
                                        return;
                                    }
                                }
                                None => break,
                            }
                        }
                        if active.remaining == 0 {
                            if let Some(done) = capture.take() {
                                let _ = done.reply.send(done.bytes);
                            }
                        }
                    }
                    if capture.is_none() {
                        while let Some(line) = decoder.next_line() {
                            tracing::trace!(link = %id, line = %line, "Received line");
                            if !events.push(id, Payload::Line(line)) {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(link = %id, error = %e, "Serial read failed");
                    events.push(id, Payload::Disconnected(e.to_string()));
                    break;
                }
            },
        }
    }
}

/// The rig's two links.
pub struct LinkPair {
    /// Door/valve board
    pub motor: HardwareLink,
    /// Lick-sensing board
    pub laser: HardwareLink,
}

impl LinkPair {
    /// Wire up already-open streams.
    pub fn from_streams(motor: DynSerial, laser: DynSerial, events: EventSender) -> Self {
        Self {
            motor: HardwareLink::spawn(LinkId::Motor, motor, events.clone()),
            laser: HardwareLink::spawn(LinkId::Laser, laser, events),
        }
    }

    /// Open both serial ports from configuration.
    ///
    /// Boot banners are drained before the readers start.
    pub async fn open(config: &RigConfig, events: EventSender) -> Result<Self, LinkError> {
        let mut motor = open_serial_async(LinkId::Motor, &config.motor).await?;
        let mut laser = open_serial_async(LinkId::Laser, &config.laser).await?;

        let discarded = drain_serial_buffer(&mut motor, 50).await;
        if discarded > 0 {
            tracing::debug!(link = %LinkId::Motor, discarded, "Discarded stale bytes");
        }
        let discarded = drain_serial_buffer(&mut laser, 50).await;
        if discarded > 0 {
            tracing::debug!(link = %LinkId::Laser, discarded, "Discarded stale bytes");
        }

        Ok(Self::from_streams(Box::new(motor), Box::new(laser), events))
    }
}
