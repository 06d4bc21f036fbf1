//! Wire protocol of the two peripheral boards.
//!
//! Protocol: USB-serial, 8N1, ASCII with raw byte arrays for schedules.
//!
//! # Outbound
//!
//! | Board | Frame        | Meaning                                   |
//! |-------|--------------|-------------------------------------------|
//! | motor | `DOWN\n`     | close door                                |
//! | motor | `UP\n`       | open door                                 |
//! | motor | `T=0\n`      | reset counters and home the door          |
//! | laser | `<B>`        | begin valve-on-lick                       |
//! | laser | `<E>`        | stop valve-on-lick                        |
//! | laser | `<R>`        | reset                                     |
//! | laser | `<T,n>` + 2n | valve schedule header followed by bytes   |
//! | laser | `<V>`        | echo the stored schedule (2n raw bytes)   |
//!
//! # Inbound (newline-terminated)
//!
//! ```text
//! door moved up
//! door moved down
//! LICK,A,35
//! Valve test complete: pair 2
//! Time Stamp Data <B,1,1042><E,1,11050>
//! ```

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::schedule::TrialDefinition;

/// Host-to-peripheral commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Close the door (motor)
    DoorDown,
    /// Open the door (motor)
    DoorUp,
    /// Reset the motor board
    MotorReset,
    /// Begin valve-on-lick (laser)
    BeginValveOnLick,
    /// Stop valve-on-lick (laser)
    StopValveOnLick,
    /// Reset the laser board
    LaserReset,
    /// Valve schedule transfer (laser)
    ValveSchedule(ValveSchedule),
    /// Ask the laser board to echo its stored schedule
    EchoSchedule,
}

impl Command {
    /// Bytes to put on the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::DoorDown => b"DOWN\n".to_vec(),
            Command::DoorUp => b"UP\n".to_vec(),
            Command::MotorReset => b"T=0\n".to_vec(),
            Command::BeginValveOnLick => b"<B>".to_vec(),
            Command::StopValveOnLick => b"<E>".to_vec(),
            Command::LaserReset => b"<R>".to_vec(),
            Command::ValveSchedule(schedule) => {
                let mut frame = format!("<T,{}>", schedule.num_trials()).into_bytes();
                frame.extend(schedule.to_bytes());
                frame
            }
            Command::EchoSchedule => b"<V>".to_vec(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::DoorDown => "door down",
            Command::DoorUp => "door up",
            Command::MotorReset => "motor reset",
            Command::BeginValveOnLick => "begin valve-on-lick",
            Command::StopValveOnLick => "stop valve-on-lick",
            Command::LaserReset => "laser reset",
            Command::ValveSchedule(_) => "valve schedule",
            Command::EchoSchedule => "echo schedule",
        }
    }
}

/// One signed valve index per trial per side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveSchedule {
    side_a: Vec<i8>,
    side_b: Vec<i8>,
}

impl ValveSchedule {
    /// Build from explicit per-side valve indices.
    ///
    /// Indices whose byte is printable ASCII, `\r` or `\n` are rejected: the echo shares
    /// the link with text lines and is told apart from them by byte class.
    pub fn new(side_a: Vec<i8>, side_b: Vec<i8>) -> Result<Self, ProtocolError> {
        if side_a.len() != side_b.len() {
            return Err(ProtocolError::EchoLength {
                expected: side_a.len(),
                actual: side_b.len(),
            });
        }
        if let Some(&v) = side_a
            .iter()
            .chain(side_b.iter())
            .find(|v| is_line_byte(v.to_le_bytes()[0]))
        {
            return Err(ProtocolError::ValveIsText(v));
        }
        Ok(Self { side_a, side_b })
    }

    /// Valve indices of a generated schedule.
    pub fn from_trials(trials: &[TrialDefinition]) -> Result<Self, ProtocolError> {
        let to_i8 = |slot: u8| i8::try_from(slot).map_err(|_| ProtocolError::ValveOutOfRange(slot));
        let side_a = trials
            .iter()
            .map(|t| to_i8(t.port_a_valve))
            .collect::<Result<Vec<_>, _>>()?;
        let side_b = trials
            .iter()
            .map(|t| to_i8(t.port_b_valve))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(side_a, side_b)
    }

    /// Number of trials covered.
    pub fn num_trials(&self) -> usize {
        self.side_a.len()
    }

    /// Number of bytes the board must echo back.
    pub fn echo_len(&self) -> usize {
        self.side_a.len() * 2
    }

    /// Side A bytes followed by side B bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.side_a
            .iter()
            .chain(self.side_b.iter())
            .map(|v| v.to_le_bytes()[0])
            .collect()
    }

    /// Compare an echo byte-for-byte against what was sent.
    pub fn verify_echo(&self, echoed: &[u8]) -> Result<(), ProtocolError> {
        let sent = self.to_bytes();
        if echoed.len() != sent.len() {
            return Err(ProtocolError::EchoLength {
                expected: sent.len(),
                actual: echoed.len(),
            });
        }
        match sent.iter().zip(echoed).position(|(s, e)| s != e) {
            None => Ok(()),
            Some(index) => Err(ProtocolError::ScheduleMismatch {
                index,
                sent: i8::from_le_bytes([sent[index]]),
                echoed: i8::from_le_bytes([echoed[index]]),
            }),
        }
    }
}

/// Physical door position reported by the motor board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoorPosition {
    /// Door raised
    Up,
    /// Door lowered
    Down,
}

/// One of the two fluid ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LickPort {
    /// Port A
    A,
    /// Port B
    B,
}

impl std::fmt::Display for LickPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LickPort::A => write!(f, "A"),
            LickPort::B => write!(f, "B"),
        }
    }
}

/// One `<command,trial,ms>` group of a timestamp trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStampRecord {
    /// Command character the board executed
    pub command: char,
    /// Trial the board attributes it to
    pub trial_number: u32,
    /// Board clock at execution, in ms
    pub occurrence_ms: u64,
}

/// Asynchronous peripheral messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralMessage {
    /// Door reached a position
    DoorMoved(DoorPosition),
    /// A lick was sensed
    Lick {
        /// Port licked
        port: LickPort,
        /// Contact duration, when reported
        duration_ms: Option<u64>,
    },
    /// A valve-test pairing finished
    ValveTestComplete(String),
    /// Timestamp trailer
    TimeStampData(Vec<TimeStampRecord>),
    /// Anything else
    Unrecognized(String),
}

const TIMESTAMP_PREFIX: &str = "time stamp data";
const VALVE_TEST_PREFIX: &str = "valve test complete";

impl PeripheralMessage {
    /// Classify one received line.
    ///
    /// Malformed timestamp trailers are errors; unknown lines are not.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();

        if lower == "door moved up" {
            return Ok(PeripheralMessage::DoorMoved(DoorPosition::Up));
        }
        if lower == "door moved down" {
            return Ok(PeripheralMessage::DoorMoved(DoorPosition::Down));
        }
        if lower.starts_with("lick,") {
            if let Some(msg) = parse_lick(line) {
                return Ok(msg);
            }
        }
        if lower.starts_with(VALVE_TEST_PREFIX) {
            let detail = line[VALVE_TEST_PREFIX.len()..]
                .trim_start_matches(':')
                .trim()
                .to_string();
            return Ok(PeripheralMessage::ValveTestComplete(detail));
        }
        if lower.starts_with(TIMESTAMP_PREFIX) {
            let trailer = line[TIMESTAMP_PREFIX.len()..].trim();
            return parse_timestamp_trailer(trailer).map(PeripheralMessage::TimeStampData);
        }
        Ok(PeripheralMessage::Unrecognized(line.to_string()))
    }
}

fn parse_lick(line: &str) -> Option<PeripheralMessage> {
    let mut fields = line.split(',').map(str::trim).skip(1);
    let port = match fields.next()? {
        p if p.eq_ignore_ascii_case("a") => LickPort::A,
        p if p.eq_ignore_ascii_case("b") => LickPort::B,
        _ => return None,
    };
    let duration_ms = match fields.next() {
        Some(d) if !d.is_empty() => Some(d.parse().ok()?),
        _ => None,
    };
    Some(PeripheralMessage::Lick { port, duration_ms })
}

/// Parse `<c,trial,ms><c,trial,ms>...`.
///
/// Groups are split on `><`; the outer `<` and `>` are stripped first and the fields of
/// each group are read positionally.
pub fn parse_timestamp_trailer(trailer: &str) -> Result<Vec<TimeStampRecord>, ProtocolError> {
    let trailer = trailer.trim();
    if trailer.is_empty() {
        return Ok(Vec::new());
    }
    let inner = trailer
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| ProtocolError::MalformedTimestamp(trailer.to_string()))?;

    inner
        .split("><")
        .map(|group| {
            let malformed = || ProtocolError::MalformedTimestamp(group.to_string());
            let mut fields = group.split(',').map(str::trim);
            let mut command_chars = fields.next().ok_or_else(malformed)?.chars();
            let command = command_chars.next().ok_or_else(malformed)?;
            if command_chars.next().is_some() {
                return Err(malformed());
            }
            let trial_number = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(malformed)?;
            let occurrence_ms = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(malformed)?;
            if fields.next().is_some() {
                return Err(malformed());
            }
            Ok(TimeStampRecord {
                command,
                trial_number,
                occurrence_ms,
            })
        })
        .collect()
}

/// Bytes that can appear inside an inbound text line.
fn is_text_byte(b: u8) -> bool {
    matches!(b, b' '..=b'~' | b'\t' | b'\r')
}

/// Bytes that belong to the text side of the stream, terminators included.
fn is_line_byte(b: u8) -> bool {
    is_text_byte(b) || b == b'\n'
}

/// One unit pulled from the stream while raw bytes are awaited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framed {
    /// A complete text line
    Line(String),
    /// A run of non-text bytes
    Raw(Vec<u8>),
}

/// Accumulates received bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    /// Longest line kept before the buffer is discarded as noise.
    pub const MAX_LINE: usize = 4096;

    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > Self::MAX_LINE && !self.buf.contains(&b'\n') {
            tracing::warn!(len = self.buf.len(), "Discarding unterminated serial input");
            self.buf.clear();
        }
    }

    /// Next complete, non-empty line with `\r`/`\n` stripped.
    ///
    /// Control bytes left over from an abandoned echo are dropped from the line.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let raw = self.buf.split_to(pos + 1);
            let text: Vec<u8> = raw.iter().copied().filter(|b| is_text_byte(*b)).collect();
            let text = String::from_utf8_lossy(&text);
            let line = text.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Next line or run of at most `max_raw` non-text bytes, whichever comes first.
    ///
    /// Returns `None` while the front of the buffer is an unterminated line or when
    /// `max_raw` is zero and no complete line is waiting.
    pub fn next_framed(&mut self, max_raw: usize) -> Option<Framed> {
        loop {
            let first = *self.buf.first()?;
            if first == b'\n' {
                self.buf.advance(1);
                continue;
            }
            if is_text_byte(first) {
                let end = self.buf.iter().position(|b| !is_text_byte(*b))?;
                if self.buf[end] == b'\n' {
                    let raw = self.buf.split_to(end + 1);
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Framed::Line(line));
                }
                // Text cut short by raw bytes: no terminator will follow.
                let junk = self.buf.split_to(end);
                tracing::warn!(len = junk.len(), "Dropping unterminated text before raw bytes");
                continue;
            }
            if max_raw == 0 {
                return None;
            }
            let run = self
                .buf
                .iter()
                .take(max_raw)
                .take_while(|b| !is_line_byte(**b))
                .count();
            return Some(Framed::Raw(self.take_raw(run)));
        }
    }

    fn take_raw(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        let raw = self.buf[..n].to_vec();
        self.buf.advance(n);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_framing() {
        assert_eq!(Command::DoorDown.encode(), b"DOWN\n");
        assert_eq!(Command::DoorUp.encode(), b"UP\n");
        assert_eq!(Command::MotorReset.encode(), b"T=0\n");
        assert_eq!(Command::BeginValveOnLick.encode(), b"<B>");
        assert_eq!(Command::EchoSchedule.encode(), b"<V>");
    }

    #[test]
    fn schedule_frame_has_header_then_sides() {
        let schedule = ValveSchedule::new(vec![2, 0, 1, 3], vec![1, 3, 0, 2]).unwrap();
        let mut expected = b"<T,4>".to_vec();
        expected.extend([2, 0, 1, 3, 1, 3, 0, 2]);
        assert_eq!(Command::ValveSchedule(schedule).encode(), expected);
    }

    #[test]
    fn identical_echo_verifies() {
        let schedule = ValveSchedule::new(vec![2, 0, 1, 3], vec![1, 3, 0, 2]).unwrap();
        assert_eq!(schedule.echo_len(), 8);
        assert!(schedule.verify_echo(&[2, 0, 1, 3, 1, 3, 0, 2]).is_ok());
    }

    #[test]
    fn any_flipped_byte_fails() {
        let schedule = ValveSchedule::new(vec![2, 0, 1, 3], vec![1, 3, 0, 2]).unwrap();
        let good = schedule.to_bytes();
        for index in 0..good.len() {
            let mut echo = good.clone();
            echo[index] ^= 0x01;
            let err = schedule.verify_echo(&echo).unwrap_err();
            assert!(
                matches!(err, ProtocolError::ScheduleMismatch { index: i, .. } if i == index),
                "byte {index}: {err:?}"
            );
        }
    }

    #[test]
    fn short_echo_fails() {
        let schedule = ValveSchedule::new(vec![2, 0], vec![0, 2]).unwrap();
        assert_eq!(
            schedule.verify_echo(&[2, 0, 0]),
            Err(ProtocolError::EchoLength {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn negative_valve_indices_survive_encoding() {
        let schedule = ValveSchedule::new(vec![-1], vec![7]).unwrap();
        assert_eq!(schedule.to_bytes(), vec![0xFF, 0x07]);
        assert!(schedule.verify_echo(&[0xFF, 0x07]).is_ok());
    }

    #[test]
    fn parses_door_and_lick_lines() {
        assert_eq!(
            PeripheralMessage::parse("Door moved up\r").unwrap(),
            PeripheralMessage::DoorMoved(DoorPosition::Up)
        );
        assert_eq!(
            PeripheralMessage::parse("door moved down").unwrap(),
            PeripheralMessage::DoorMoved(DoorPosition::Down)
        );
        assert_eq!(
            PeripheralMessage::parse("LICK,B,35").unwrap(),
            PeripheralMessage::Lick {
                port: LickPort::B,
                duration_ms: Some(35)
            }
        );
        assert_eq!(
            PeripheralMessage::parse("lick,a").unwrap(),
            PeripheralMessage::Lick {
                port: LickPort::A,
                duration_ms: None
            }
        );
        assert!(matches!(
            PeripheralMessage::parse("LICK,C").unwrap(),
            PeripheralMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn parses_valve_test_completion() {
        assert_eq!(
            PeripheralMessage::parse("Valve test complete: pair 2").unwrap(),
            PeripheralMessage::ValveTestComplete("pair 2".to_string())
        );
    }

    #[test]
    fn parses_timestamp_trailer() {
        let msg = PeripheralMessage::parse("Time Stamp Data <B,1,1042><E,1,11050><B,2,40210>")
            .unwrap();
        let PeripheralMessage::TimeStampData(records) = msg else {
            panic!("expected timestamp data, got {msg:?}");
        };
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1],
            TimeStampRecord {
                command: 'E',
                trial_number: 1,
                occurrence_ms: 11050
            }
        );
        assert_eq!(records[2].trial_number, 2);
    }

    #[test]
    fn single_group_trailer() {
        let records = parse_timestamp_trailer("<U,4,9>").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, 'U');
    }

    #[test]
    fn malformed_trailer_is_protocol_error() {
        assert!(parse_timestamp_trailer("<B,1>").is_err());
        assert!(parse_timestamp_trailer("B,1,2").is_err());
        assert!(parse_timestamp_trailer("<B,x,2>").is_err());
        assert!(parse_timestamp_trailer("<BE,1,2>").is_err());
    }

    #[test]
    fn decoder_splits_lines_across_chunks() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"door mo");
        assert_eq!(decoder.next_line(), None);
        decoder.extend(b"ved up\r\n\nLICK,A\n");
        assert_eq!(decoder.next_line().as_deref(), Some("door moved up"));
        assert_eq!(decoder.next_line().as_deref(), Some("LICK,A"));
        assert_eq!(decoder.next_line(), None);
    }

    #[test]
    fn framed_lets_lines_through_around_raw_bytes() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"LICK,A\n");
        decoder.extend(&[2, 0]);
        decoder.extend(b"door mov");
        assert_eq!(decoder.next_framed(4), Some(Framed::Line("LICK,A".into())));
        assert_eq!(decoder.next_framed(4), Some(Framed::Raw(vec![2, 0])));
        // Partial line waits for its terminator.
        assert_eq!(decoder.next_framed(2), None);
        decoder.extend(b"ed up\r\n");
        decoder.extend(&[1, 3, 0xFF]);
        assert_eq!(decoder.next_framed(2), Some(Framed::Line("door moved up".into())));
        assert_eq!(decoder.next_framed(2), Some(Framed::Raw(vec![1, 3])));
        assert_eq!(decoder.next_framed(0), None);
    }

    #[test]
    fn stray_control_bytes_do_not_spoil_the_next_line() {
        let mut decoder = LineDecoder::new();
        decoder.extend(&[0, 1]);
        decoder.extend(b"LICK,A\n");
        assert_eq!(decoder.next_line().as_deref(), Some("LICK,A"));
    }

    #[test]
    fn text_valve_bytes_are_rejected() {
        assert_eq!(
            ValveSchedule::new(vec![10], vec![0]),
            Err(ProtocolError::ValveIsText(10))
        );
        assert_eq!(
            ValveSchedule::new(vec![1], vec![b'L' as i8]),
            Err(ProtocolError::ValveIsText(76))
        );
    }
}
