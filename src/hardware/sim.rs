//! Simulated peripheral boards.
//!
//! Both boards run as tokio tasks on the far end of an in-memory `tokio::io::duplex`
//! stream and speak the same wire protocol as the firmware, so the host side cannot
//! tell them from real hardware. Used by the integration tests and by the `simulate`
//! subcommand.
//!
//! - motor: answers `DOWN`/`UP` with a door acknowledgement after the travel time
//! - laser: stores `<T,n>` schedules, echoes them on `<V>`, emits injected licks and,
//!   optionally, timestamp trailers after `<E>`

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::hardware::protocol::LineDecoder;
use crate::hardware::{DynSerial, LickPort};

const PIPE_CAPACITY: usize = 4096;

/// How the simulated laser board answers `<V>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoMode {
    /// Echo the stored schedule unchanged
    #[default]
    Faithful,
    /// Flip the lowest bit of one byte
    Corrupt {
        /// Byte to damage
        index: usize,
    },
    /// Never answer
    Silent,
}

/// Behaviour of the simulated boards.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Delay before the motor board acknowledges a door move
    pub door_travel: Duration,
    /// Laser echo behaviour
    pub echo: EchoMode,
    /// Send a `Time Stamp Data` trailer after every `<E>`
    pub timestamps: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            door_travel: Duration::from_millis(50),
            echo: EchoMode::Faithful,
            timestamps: false,
        }
    }
}

/// Feeds licks into the simulated laser board.
#[derive(Debug, Clone)]
pub struct LickInjector {
    tx: mpsc::UnboundedSender<(LickPort, Option<u64>)>,
}

impl LickInjector {
    /// Emit `LICK,<port>`. Returns `false` once the board is gone.
    pub fn lick(&self, port: LickPort) -> bool {
        self.tx.send((port, None)).is_ok()
    }

    /// Emit `LICK,<port>,<duration_ms>`.
    pub fn lick_for(&self, port: LickPort, duration_ms: u64) -> bool {
        self.tx.send((port, Some(duration_ms))).is_ok()
    }
}

/// Host ends of both simulated boards.
pub struct SimulatedBoards {
    /// Stream to hand to the motor link
    pub motor: DynSerial,
    /// Stream to hand to the laser link
    pub laser: DynSerial,
    /// Lick source on the laser board
    pub licks: LickInjector,
}

impl SimulatedBoards {
    /// Start both boards. They stop when the host ends are dropped.
    pub fn spawn(options: SimOptions) -> Self {
        let (motor_host, motor_board) = tokio::io::duplex(PIPE_CAPACITY);
        let (laser_host, laser_board) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let travel = options.door_travel;
        tokio::spawn(async move {
            if let Err(e) = motor_board_task(motor_board, travel).await {
                tracing::warn!(error = %e, "Simulated motor board stopped");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = laser_board_task(laser_board, rx, options).await {
                tracing::warn!(error = %e, "Simulated laser board stopped");
            }
        });

        Self {
            motor: Box::new(motor_host),
            laser: Box::new(laser_host),
            licks: LickInjector { tx },
        }
    }
}

/// Lick at random intervals averaging `mean_interval`, on a random port.
pub fn spawn_random_licks(
    licks: LickInjector,
    mean_interval: Duration,
    seed: Option<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let mean_ms = u64::try_from(mean_interval.as_millis()).unwrap_or(u64::MAX);
        loop {
            let wait = rng.gen_range(0..=mean_ms.saturating_mul(2));
            tokio::time::sleep(Duration::from_millis(wait)).await;
            let port = if rng.gen_bool(0.5) {
                LickPort::A
            } else {
                LickPort::B
            };
            if !licks.lick_for(port, rng.gen_range(5..60)) {
                break;
            }
        }
    })
}

async fn motor_board_task(mut port: DuplexStream, travel: Duration) -> Result<()> {
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 64];
    loop {
        let n = port.read(&mut buf).await.context("motor board read failed")?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
        while let Some(line) = decoder.next_line() {
            let reply = match line.as_str() {
                "DOWN" => Some("door moved down\n"),
                "UP" => Some("door moved up\n"),
                "T=0" => None,
                other => {
                    tracing::debug!(line = other, "Simulated motor board ignored line");
                    None
                }
            };
            if let Some(reply) = reply {
                tokio::time::sleep(travel).await;
                port.write_all(reply.as_bytes())
                    .await
                    .context("motor board write failed")?;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LaserFrame {
    Begin,
    End,
    Reset,
    Schedule(Vec<u8>),
    Echo,
    Unknown(String),
}

/// Next complete frame, or `None` until more bytes arrive.
fn next_frame(buf: &mut BytesMut) -> Option<LaserFrame> {
    let start = buf.iter().position(|b| *b == b'<')?;
    buf.advance(start);
    let end = buf.iter().position(|b| *b == b'>')?;
    let body = String::from_utf8_lossy(&buf[1..end]).into_owned();

    if let Some(count) = body.strip_prefix("T,") {
        let Ok(trials) = count.trim().parse::<usize>() else {
            buf.advance(end + 1);
            return Some(LaserFrame::Unknown(body));
        };
        if buf.len() < end + 1 + trials * 2 {
            return None;
        }
        buf.advance(end + 1);
        return Some(LaserFrame::Schedule(buf.split_to(trials * 2).to_vec()));
    }

    buf.advance(end + 1);
    Some(match body.as_str() {
        "B" => LaserFrame::Begin,
        "E" => LaserFrame::End,
        "R" => LaserFrame::Reset,
        "V" => LaserFrame::Echo,
        _ => LaserFrame::Unknown(body),
    })
}

async fn laser_board_task(
    mut port: DuplexStream,
    mut licks: mpsc::UnboundedReceiver<(LickPort, Option<u64>)>,
    options: SimOptions,
) -> Result<()> {
    let booted = Instant::now();
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 256];
    let mut stored: Vec<u8> = Vec::new();
    let mut trial = 0u32;
    let mut stamps = String::new();

    loop {
        tokio::select! {
            read = port.read(&mut chunk) => {
                let n = read.context("laser board read failed")?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);

                while let Some(frame) = next_frame(&mut buf) {
                    let now_ms = booted.elapsed().as_millis();
                    match frame {
                        LaserFrame::Schedule(bytes) => {
                            tracing::debug!(bytes = bytes.len(), "Simulated laser stored schedule");
                            stored = bytes;
                        }
                        LaserFrame::Echo => {
                            let mut echo = stored.clone();
                            match options.echo {
                                EchoMode::Faithful => {}
                                EchoMode::Corrupt { index } => {
                                    if let Some(byte) = echo.get_mut(index) {
                                        *byte ^= 0x01;
                                    }
                                }
                                EchoMode::Silent => continue,
                            }
                            port.write_all(&echo).await.context("laser board echo failed")?;
                        }
                        LaserFrame::Begin => {
                            trial += 1;
                            stamps.push_str(&format!("<B,{trial},{now_ms}>"));
                        }
                        LaserFrame::End => {
                            stamps.push_str(&format!("<E,{trial},{now_ms}>"));
                            if options.timestamps {
                                let line = format!("Time Stamp Data {stamps}\n");
                                port.write_all(line.as_bytes()).await.context("laser board write failed")?;
                            }
                            stamps.clear();
                        }
                        LaserFrame::Reset => {
                            stored.clear();
                            stamps.clear();
                            trial = 0;
                        }
                        LaserFrame::Unknown(body) => {
                            tracing::debug!(frame = %body, "Simulated laser ignored frame");
                        }
                    }
                }
            }
            Some((lick_port, duration)) = licks.recv() => {
                let line = match duration {
                    Some(ms) => format!("LICK,{lick_port},{ms}\n"),
                    None => format!("LICK,{lick_port}\n"),
                };
                port.write_all(line.as_bytes()).await.context("laser board write failed")?;
            }
        }
    }
}
