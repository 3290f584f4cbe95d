//! Polyphonic voice allocation.
//!
//! Each voice is a pitch CV output paired with a gate line. Notes are handed to the lowest-numbered free voice; once
//! every voice is sounding, the voice which has been held the longest is stolen, so a new note is never dropped.
//! Velocity, Control Change and pitch bend each drive a single output shared by all voices.

use crate::{
    configuration::{CvOutput, Layout},
    mcp4728::{self, Mcp4728},
    midi::{MessageKind, MidiMessage, scale},
};
use embedded_hal::{
    digital::{self, OutputPin},
    i2c::{self, I2c},
};
use tinyvec::ArrayVec;
use wmidi::{Note, U7};

/// Voices in the order they were allocated, oldest first.
///
/// Only occupied voices are listed, each at most once.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VoiceQueue<const N: usize> {
    data: ArrayVec<[usize; N]>,
}

#[cfg(feature = "defmt")]
impl<const N: usize> defmt::Format for VoiceQueue<N> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "VoiceQueue {{ data: {} }}", self.data.as_slice());
    }
}

impl<const N: usize> VoiceQueue<N> {
    /// Constructs an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a voice as the newest. Ignored if the voice is already queued or the queue is full.
    pub fn push_back(&mut self, voice: usize) {
        if self.data.len() != self.data.capacity() && !self.data.contains(&voice) {
            self.data.push(voice);
        }
    }

    /// The oldest voice, left in place.
    pub fn front(&self) -> Option<usize> {
        self.data.first().copied()
    }

    /// Drops a voice from the queue, wherever it is. Nothing happens if the voice is not queued.
    pub fn remove(&mut self, voice: usize) {
        self.data.retain(|&v| v != voice);
    }

    /// Whether a voice is queued.
    pub fn contains(&self, voice: usize) -> bool {
        self.data.contains(&voice)
    }

    /// Number of queued voices.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no voices are queued.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates over the queued voices, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.data.iter().copied()
    }
}

/// Errors raised while voicing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E, P> {
    /// A DAC write failed.
    Dac(mcp4728::Error<E>),
    /// A gate or trigger line could not be driven.
    Pin(P),
    /// The layout refers to a DAC the allocator was not given.
    UnknownDac(usize),
}

type VoiceError<I2C, G> = Error<<I2C as i2c::ErrorType>::Error, <G as digital::ErrorType>::Error>;

/// Assigns incoming notes to voices and drives the resulting voltages and gates.
///
/// The allocator owns the DAC bus outright; nothing else may talk to the DACs while it exists.
pub struct VoiceAllocator<I2C, G, T, const N: usize, const D: usize> {
    i2c: I2C,
    dacs: [Mcp4728; D],
    gates: [G; N],
    trigger: T,
    layout: Layout<N>,
    slots: [Option<Note>; N],
    queue: VoiceQueue<N>,
}

impl<I2C, G, T, const N: usize, const D: usize> VoiceAllocator<I2C, G, T, N, D>
where
    I2C: I2c,
    G: OutputPin,
    T: OutputPin<Error = G::Error>,
{
    /// Constructs an allocator with every voice free, pulling all gates and the trigger low.
    pub fn new(
        i2c: I2C,
        dacs: [Mcp4728; D],
        mut gates: [G; N],
        mut trigger: T,
        layout: Layout<N>,
    ) -> Result<Self, VoiceError<I2C, G>> {
        const { assert!(N > 0, "at least one voice is required") };

        for gate in gates.iter_mut() {
            gate.set_low().map_err(Error::Pin)?;
        }
        trigger.set_low().map_err(Error::Pin)?;

        Ok(Self {
            i2c,
            dacs,
            gates,
            trigger,
            layout,
            slots: [None; N],
            queue: VoiceQueue::new(),
        })
    }

    /// The note held by each voice.
    pub fn slots(&self) -> &[Option<Note>; N] {
        &self.slots
    }

    /// Occupied voices, oldest first.
    pub fn queue(&self) -> &VoiceQueue<N> {
        &self.queue
    }

    /// The DACs, as last written.
    pub fn dacs(&self) -> &[Mcp4728; D] {
        &self.dacs
    }

    /// Gives back the bus, the DACs and the gate and trigger lines.
    pub fn release(self) -> (I2C, [Mcp4728; D], [G; N], T) {
        (self.i2c, self.dacs, self.gates, self.trigger)
    }

    /// Sounds `note` and returns the voice it was given.
    ///
    /// A note which is already sounding is re-voiced in place and becomes the newest voice. Otherwise the first
    /// free voice is taken, and if there is none the oldest voice is stolen. If any write fails, the voices are left
    /// exactly as they were.
    pub fn note_on(&mut self, note: Note, velocity: U7) -> Result<usize, VoiceError<I2C, G>> {
        let slot = if let Some(slot) = self.find(note) {
            debug!("Retriggering {} on voice {}", note.to_str(), slot);
            slot
        } else if let Some(slot) = self.slots.iter().position(Option::is_none) {
            slot
        } else {
            // a full pool queues every voice, so the queue cannot be empty here
            let slot = self.queue.front().unwrap_or_default();
            info!("All voices busy; stealing voice {}", slot);
            slot
        };

        self.voice(slot, note, velocity)?;
        info!(
            "NoteOn: {} velocity {} on voice {}",
            note.to_str(),
            u8::from(velocity),
            slot
        );
        Ok(slot)
    }

    /// Releases the voice holding `note`, if any, and returns it. Releasing a note that is not sounding does nothing.
    pub fn note_off(&mut self, note: Note) -> Result<Option<usize>, VoiceError<I2C, G>> {
        let Some(slot) = self.find(note) else {
            debug!("NoteOff for {}, which is not sounding", note.to_str());
            return Ok(None);
        };

        self.gates[slot].set_low().map_err(Error::Pin)?;
        self.write_cv(self.layout.velocity, 0)?;
        self.slots[slot] = None;
        self.queue.remove(slot);
        info!("NoteOff: {} freed voice {}", note.to_str(), slot);
        Ok(Some(slot))
    }

    /// Writes a Control Change value to the CC output.
    pub fn control_change(&mut self, value: U7) -> Result<(), VoiceError<I2C, G>> {
        let value = scale(value);
        trace!("Control Change: {}", value);
        self.write_cv(self.layout.control_change, value)
    }

    /// Writes the pitch wheel position to the pitch bend output, dropping the two least significant of its 14 bits.
    pub fn pitch_bend(&mut self, msb: U7, lsb: U7) -> Result<(), VoiceError<I2C, G>> {
        let bend = u16::from(u8::from(lsb)) | u16::from(u8::from(msb)) << 7;
        let value = bend >> 2;
        trace!("Pitch Bend: {} -> {}", bend, value);
        self.write_cv(self.layout.pitch_bend, value)
    }

    /// Acts on a parsed message.
    ///
    /// A Note On with velocity 0 is a Note Off. Control Changes are applied regardless of the controller number and
    /// of the channel. Pitch bend takes the second data byte as its most significant bits, as MIDI defines it; the
    /// reference hardware wired the bytes the other way round.
    pub fn dispatch(&mut self, message: MidiMessage) -> Result<(), VoiceError<I2C, G>> {
        match message.kind() {
            MessageKind::NoteOn if u8::from(message.data2()) > 0 => {
                self.note_on(message.note(), message.data2())?;
            }
            MessageKind::NoteOn | MessageKind::NoteOff => {
                self.note_off(message.note())?;
            }
            MessageKind::ControlChange => self.control_change(message.data2())?,
            MessageKind::PitchBend => self.pitch_bend(message.data2(), message.data1())?,
            MessageKind::Unknown => {
                debug!("Ignoring unsupported MIDI message {}", message);
            }
        }
        Ok(())
    }

    fn find(&self, note: Note) -> Option<usize> {
        self.slots.iter().position(|&slot| slot == Some(note))
    }

    /// Trigger high, pitch and velocity, gate high, trigger low. The slot and queue only change once every line has
    /// been driven; the trigger is pulled low again even on failure.
    fn voice(&mut self, slot: usize, note: Note, velocity: U7) -> Result<(), VoiceError<I2C, G>> {
        self.trigger.set_high().map_err(Error::Pin)?;
        let sounded = self.sound(slot, note, velocity);
        let released = self.trigger.set_low().map_err(Error::Pin);
        sounded?;
        self.slots[slot] = Some(note);
        self.queue.remove(slot);
        self.queue.push_back(slot);
        released
    }

    fn sound(&mut self, slot: usize, note: Note, velocity: U7) -> Result<(), VoiceError<I2C, G>> {
        self.write_cv(self.layout.pitch[slot], scale(U7::from_u8_lossy(note as u8)))?;
        self.write_cv(self.layout.velocity, scale(velocity))?;
        self.gates[slot].set_high().map_err(Error::Pin)
    }

    fn write_cv(&mut self, output: CvOutput, value: u16) -> Result<(), VoiceError<I2C, G>> {
        let dac = self
            .dacs
            .get_mut(output.dac)
            .ok_or(Error::UnknownDac(output.dac))?;
        dac.set_value(&mut self.i2c, output.channel, value)
            .map_err(Error::Dac)
    }
}
