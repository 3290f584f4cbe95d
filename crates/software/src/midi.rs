//! Decoding of the MIDI byte stream received over the serial input.
//!
//! Only fixed-length, three-byte channel messages are understood. Frames begin on a channel status byte; data
//! bytes that do not belong to one (running status, System Exclusive payloads, a byte lost in transit) are dropped
//! until the next status byte, and real-time bytes are ignored wherever they turn up.

use tinyvec::ArrayVec;
use wmidi::{Note, U7};

/// Status nibble of a Note Off message.
pub const NOTE_OFF: u8 = 0x80;
/// Status nibble of a Note On message.
pub const NOTE_ON: u8 = 0x90;
/// Status nibble of a Control Change message.
pub const CONTROL_CHANGE: u8 = 0xB0;
/// Status nibble of a Pitch Bend message.
pub const PITCH_BEND: u8 = 0xE0;

/// Length of the only frame format the parser understands.
pub const FRAME_LEN: usize = 3;

/// The kinds of channel message the device reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    /// A key was pressed.
    NoteOn,
    /// A key was released.
    NoteOff,
    /// A controller moved.
    ControlChange,
    /// The pitch wheel moved.
    PitchBend,
    /// Any other channel message; ignored.
    Unknown,
}

/// A status byte outside `0x80..=0xEF` or a data byte outside `0..=127`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidMessage;

/// Reasons a buffer could not be turned into a [`MidiMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Fewer than two bytes are available.
    Incomplete,
    /// The bytes do not form a valid message.
    InvalidMessage,
}

impl From<InvalidMessage> for ParseError {
    fn from(_: InvalidMessage) -> Self {
        Self::InvalidMessage
    }
}

/// A validated MIDI channel message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiMessage {
    status: u8,
    data1: U7,
    data2: U7,
}

// wmidi does not implement `defmt::Format`
#[cfg(feature = "defmt")]
impl defmt::Format for MidiMessage {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "MidiMessage({=u8:#x}, {=u8}, {=u8})",
            self.status,
            u8::from(self.data1),
            u8::from(self.data2)
        );
    }
}

impl MidiMessage {
    /// Builds a message, failing unless `status` is in `0x80..=0xEF` and both data bytes are in `0..=127`.
    pub fn new(status: u8, data1: u8, data2: u8) -> Result<Self, InvalidMessage> {
        if !(0x80..=0xEF).contains(&status) {
            return Err(InvalidMessage);
        }
        Ok(Self {
            status,
            data1: U7::try_from(data1).map_err(|_| InvalidMessage)?,
            data2: U7::try_from(data2).map_err(|_| InvalidMessage)?,
        })
    }

    /// The raw status byte.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// First data byte: the note number or controller number, or the low 7 bits of a pitch bend.
    pub fn data1(&self) -> U7 {
        self.data1
    }

    /// Second data byte: the velocity or controller value, or the high 7 bits of a pitch bend.
    pub fn data2(&self) -> U7 {
        self.data2
    }

    /// High nibble of the status byte.
    pub fn command(&self) -> u8 {
        self.status & 0xF0
    }

    /// Low nibble of the status byte, i.e., the zero-based MIDI channel.
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    /// The first data byte read as a note number.
    pub fn note(&self) -> Note {
        Note::from(self.data1)
    }

    /// Classifies the message. Depends on nothing but [`MidiMessage::command`].
    pub fn kind(&self) -> MessageKind {
        match self.command() {
            NOTE_ON => MessageKind::NoteOn,
            NOTE_OFF => MessageKind::NoteOff,
            CONTROL_CHANGE => MessageKind::ControlChange,
            PITCH_BEND => MessageKind::PitchBend,
            _ => MessageKind::Unknown,
        }
    }
}

/// Decodes the message at the start of `bytes`.
///
/// At least two bytes are required; when exactly two are present the second data byte is taken to be zero. Bytes
/// beyond the third are not looked at.
pub fn try_parse(bytes: &[u8]) -> Result<MidiMessage, ParseError> {
    match *bytes {
        [] | [_] => Err(ParseError::Incomplete),
        [status, data1] => Ok(MidiMessage::new(status, data1, 0)?),
        [status, data1, data2, ..] => Ok(MidiMessage::new(status, data1, data2)?),
    }
}

/// First real-time status byte. Real-time bytes may appear anywhere, even inside another message.
const REAL_TIME: u8 = 0xF8;

/// Accumulates serial bytes into three-byte frames, synchronizing on status bytes.
#[derive(Clone, Debug, Default)]
pub struct MidiFrameParser {
    buffer: ArrayVec<[u8; FRAME_LEN]>,
}

impl MidiFrameParser {
    /// Constructs a parser with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns `None` while a frame is still being filled, and the decoded message once its third
    /// byte arrives.
    ///
    /// A channel status byte always starts a new frame, abandoning any frame in progress. Data bytes outside a
    /// frame and system common bytes are dropped, each reported as [`InvalidMessage`]; real-time bytes are skipped
    /// without disturbing the frame they interrupt.
    pub fn push(&mut self, byte: u8) -> Option<Result<MidiMessage, InvalidMessage>> {
        if byte >= REAL_TIME {
            return None;
        }

        if byte & 0x80 != 0 {
            let interrupted = !self.buffer.is_empty();
            if interrupted {
                warn!("Discarding incomplete MIDI frame {=[u8]}", self.buffer.as_slice());
                self.buffer.clear();
            }
            if byte > 0xEF {
                trace!("Dropping system common byte {=u8:#x}", byte);
                return Some(Err(InvalidMessage));
            }
            self.buffer.push(byte);
            return interrupted.then_some(Err(InvalidMessage));
        }

        if self.buffer.is_empty() {
            trace!("Dropping stray MIDI data byte {=u8:#x}", byte);
            return Some(Err(InvalidMessage));
        }

        self.buffer.push(byte);
        if self.buffer.len() < FRAME_LEN {
            return None;
        }

        let result = try_parse(&self.buffer).map_err(|_| InvalidMessage);
        self.buffer.clear();
        Some(result)
    }

    /// Drops any partially received frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes of the frame currently being received.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Maps a 7-bit MIDI value onto the 12-bit range of the DACs by rotating its top bits into the bottom, so that 0
/// maps to 0 and 127 to 0x7F7. This matches the quantization of the hardware the device replaces and is not the
/// same as multiplying by 32.
pub fn scale(value: U7) -> u16 {
    let value = u16::from(u8::from(value));
    (value << 4) | (value >> 4)
}
