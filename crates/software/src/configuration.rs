//! Fixed settings of the device: how the CV outputs are wired to the DACs and what state each DAC channel is put in
//! before the device starts responding to MIDI.

use crate::mcp4728::{Channel, ChannelState, Gain, PowerDown, Vref};

/// Number of voices, i.e., of gate lines, in the reference hardware.
pub const VOICES: usize = 6;

/// Number of MCP4728s in the reference hardware.
pub const DACS: usize = 3;

/// Address each DAC is given during provisioning, indexed by the LDAC line it is wired to.
pub const DAC_ADDRESSES: [u8; DACS] = [0x60, 0x61, 0x62];

/// Supply voltage of the DACs, in volts. Only used to estimate output voltages.
pub const VDD_VOLTS: f64 = 5.0;

/// State every DAC channel is put in after start-up: silent, using the internal reference at twice its gain for a
/// full scale of 4.096 V.
pub const STARTUP_CHANNEL: ChannelState = ChannelState {
    value: 0,
    vref: Vref::Internal,
    gain: Gain::X2,
    power_down: PowerDown::Normal,
};

/// A single DAC output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CvOutput {
    /// Index of the DAC, in the order the DACs are handed to the voice allocator.
    pub dac: usize,
    /// Output of that DAC.
    pub channel: Channel,
}

impl CvOutput {
    /// Constructs a [`CvOutput`].
    pub const fn new(dac: usize, channel: Channel) -> Self {
        Self { dac, channel }
    }
}

/// Assignment of DAC outputs to the control voltages of an `N`-voice device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout<const N: usize> {
    /// Pitch of each voice; the voice's gate line shares its index.
    pub pitch: [CvOutput; N],
    /// Velocity of the most recent note, shared by all voices.
    pub velocity: CvOutput,
    /// Value of the most recent Control Change, whatever the controller.
    pub control_change: CvOutput,
    /// Position of the pitch wheel.
    pub pitch_bend: CvOutput,
}

impl Layout<VOICES> {
    /// Wiring of the reference hardware.
    pub const REFERENCE: Self = Self {
        pitch: [
            CvOutput::new(0, Channel::B),
            CvOutput::new(0, Channel::C),
            CvOutput::new(1, Channel::A),
            CvOutput::new(1, Channel::C),
            CvOutput::new(2, Channel::A),
            CvOutput::new(2, Channel::C),
        ],
        velocity: CvOutput::new(0, Channel::A),
        control_change: CvOutput::new(1, Channel::B),
        pitch_bend: CvOutput::new(1, Channel::D),
    };
}

impl Default for Layout<VOICES> {
    fn default() -> Self {
        Self::REFERENCE
    }
}

impl<const N: usize> Layout<N> {
    /// Every output the layout uses.
    pub fn outputs(&self) -> impl Iterator<Item = CvOutput> + '_ {
        self.pitch.iter().copied().chain([
            self.velocity,
            self.control_change,
            self.pitch_bend,
        ])
    }
}
