//! Driver for the Microchip MCP4728, a quad 12-bit DAC with per-channel voltage reference, gain and power-down
//! settings plus an on-board EEPROM holding power-up defaults.
//!
//! Several MCP4728s share one bus in this device, so the driver does not own the bus; each method borrows it for
//! the duration of a single transaction instead. The driver keeps a copy of the state it last read or wrote, but
//! the device remains the source of truth: every read method goes back to the bus.

use embassy_time::Duration;
use embedded_hal::{delay::DelayNs, i2c::I2c};
use measurements::Voltage;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Factory-default 7-bit address.
pub const DEFAULT_ADDRESS: u8 = 0x60;

/// Largest code accepted by a 12-bit channel.
pub const MAX_VALUE: u16 = 4095;

/// Write cycle time of the on-board EEPROM; the device must be left alone for this long after a save.
pub const EEPROM_SETTLE: Duration = Duration::from_millis(15);

/// `0 1 0 0 0 DAC1 DAC0 UDAC`
const MULTI_WRITE: u8 = 0b0100_0000;
/// `0 1 0 1 0 DAC1 DAC0 UDAC`
const SEQUENTIAL_WRITE: u8 = 0b0101_0000;
/// `1 0 0 X VREFA VREFB VREFC VREFD`
const VREF_SELECT: u8 = 0b1000_0000;
/// `1 0 1 X PD1A PD0A PD1B PD0B`, followed by `PD1C PD0C PD1D PD0D X X X X`
const POWER_DOWN_SELECT: u8 = 0b1010_0000;
/// `1 1 0 X GXA GXB GXC GXD`
const GAIN_SELECT: u8 = 0b1100_0000;

/// Each channel reports three bytes for its input register and three for its EEPROM.
const BYTES_PER_CHANNEL: usize = 6;
const BULK_READ_LEN: usize = BYTES_PER_CHANNEL * 4;

const INTERNAL_REFERENCE_VOLTS: f64 = 2.048;

/// One of the four outputs of an MCP4728.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    /// Output A
    A,
    /// Output B
    B,
    /// Output C
    C,
    /// Output D
    D,
}

impl Channel {
    /// All channels in register order.
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    /// Position of the channel in register order.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Voltage reference source of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Vref {
    /// The supply voltage. Gain has no effect.
    #[default]
    Vdd,
    /// The internal 2.048 V reference.
    Internal,
}

/// Output amplifier gain, only meaningful with [`Vref::Internal`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Gain {
    /// Full scale is 2.048 V.
    #[default]
    X1 = 1,
    /// Full scale is 4.096 V.
    X2 = 2,
}

/// Power state of a channel. In any mode other than [`PowerDown::Normal`] most of the channel is switched off and
/// its output is pulled to ground through a resistor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerDown {
    /// Normal operation.
    #[default]
    Normal = 0,
    /// Output pulled down through 1 kΩ.
    Pulldown1K = 1,
    /// Output pulled down through 100 kΩ.
    Pulldown100K = 2,
    /// Output pulled down through 500 kΩ.
    Pulldown500K = 3,
}

/// Errors raised by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The bus transaction failed.
    Bus(E),
    /// A value outside `0..=4095` (or a normalized value outside `0.0..=1.0`).
    OutOfRange,
    /// A gain other than 1 or 2.
    InvalidGain,
    /// A power-down mode outside `0..=3`.
    InvalidMode,
}

/// The state of one channel, as stored in its input register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelState {
    /// 12-bit output code.
    pub value: u16,
    /// Voltage reference source.
    pub vref: Vref,
    /// Output gain.
    pub gain: Gain,
    /// Power state.
    pub power_down: PowerDown,
}

impl ChannelState {
    /// Unpacks the two register bytes `VREF PD1 PD0 GX D11 D10 D9 D8`, `D7 .. D0`.
    fn decode(high: u8, low: u8) -> Self {
        Self {
            value: u16::from(high & 0x0F) << 8 | u16::from(low),
            vref: if high & 0x80 != 0 {
                Vref::Internal
            } else {
                Vref::Vdd
            },
            gain: if high & 0x10 != 0 { Gain::X2 } else { Gain::X1 },
            power_down: match (high >> 5) & 0b11 {
                0 => PowerDown::Normal,
                1 => PowerDown::Pulldown1K,
                2 => PowerDown::Pulldown100K,
                _ => PowerDown::Pulldown500K,
            },
        }
    }

    /// Packs the state into the two bytes used by the write commands.
    fn encode(&self) -> [u8; 2] {
        let [mut high, low] = (self.value & MAX_VALUE).to_be_bytes();
        if self.vref == Vref::Internal {
            high |= 0x80;
        }
        high |= (self.power_down as u8) << 5;
        if self.gain == Gain::X2 {
            high |= 0x10;
        }
        [high, low]
    }

    /// Estimates the output voltage of the channel, given the supply voltage.
    pub fn voltage(&self, vdd: Voltage) -> Voltage {
        if self.power_down != PowerDown::Normal {
            return Voltage::from_volts(0.0);
        }
        let full_scale = match self.vref {
            Vref::Vdd => vdd,
            Vref::Internal => Voltage::from_volts(INTERNAL_REFERENCE_VOLTS * self.gain as u8 as f64),
        };
        (f64::from(self.value) / 4096.0) * full_scale
    }
}

fn validate_value<E>(value: u16) -> Result<u16, Error<E>> {
    if value > MAX_VALUE {
        Err(Error::OutOfRange)
    } else {
        Ok(value)
    }
}

/// One MCP4728 on the bus.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mcp4728 {
    address: u8,
    channels: [ChannelState; 4],
}

impl Mcp4728 {
    /// Constructs the driver by reading back whatever the device currently holds.
    pub fn new<I2C: I2c>(i2c: &mut I2C, address: u8) -> Result<Self, Error<I2C::Error>> {
        let mut dac = Self {
            address,
            channels: Default::default(),
        };
        let channels = dac.read_all_channels(i2c)?;
        info!("MCP4728 at {=u8:#x} holds {}", address, channels);
        Ok(dac)
    }

    /// The 7-bit bus address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The state most recently read from or written to a channel, without touching the bus.
    pub fn last_known(&self, channel: Channel) -> ChannelState {
        self.channels[channel.index()]
    }

    /// Reads the input registers of all four channels in one transaction.
    pub fn read_all_channels<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
    ) -> Result<[ChannelState; 4], Error<I2C::Error>> {
        let mut buffer = [0_u8; BULK_READ_LEN];
        i2c.read(self.address, &mut buffer).map_err(Error::Bus)?;

        // only the input register is of interest; the EEPROM half of each chunk is skipped
        for (state, chunk) in self
            .channels
            .iter_mut()
            .zip(buffer.chunks_exact(BYTES_PER_CHANNEL))
        {
            *state = ChannelState::decode(chunk[1], chunk[2]);
        }
        Ok(self.channels)
    }

    /// Reads the state of one channel.
    pub fn read_channel<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
    ) -> Result<ChannelState, Error<I2C::Error>> {
        Ok(self.read_all_channels(i2c)?[channel.index()])
    }

    /// Reads the 12-bit code of a channel.
    pub fn value<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
    ) -> Result<u16, Error<I2C::Error>> {
        Ok(self.read_channel(i2c, channel)?.value)
    }

    /// Reads the voltage reference of a channel.
    pub fn vref<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
    ) -> Result<Vref, Error<I2C::Error>> {
        Ok(self.read_channel(i2c, channel)?.vref)
    }

    /// Reads the gain of a channel.
    pub fn gain<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
    ) -> Result<Gain, Error<I2C::Error>> {
        Ok(self.read_channel(i2c, channel)?.gain)
    }

    /// Reads the power-down mode of a channel.
    pub fn power_down<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
    ) -> Result<PowerDown, Error<I2C::Error>> {
        Ok(self.read_channel(i2c, channel)?.power_down)
    }

    /// Writes a single channel; the output updates as soon as the device acknowledges.
    ///
    /// The power-down bits of the write are left clear, so this also brings a powered-down channel back to normal
    /// operation.
    pub fn write_channel<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        value: u16,
        vref: Vref,
        gain: Gain,
    ) -> Result<(), Error<I2C::Error>> {
        let value = validate_value(value)?;
        let state = ChannelState {
            value,
            vref,
            gain,
            power_down: PowerDown::Normal,
        };
        let [high, low] = state.encode();
        // UDAC left clear
        let command = MULTI_WRITE | (channel as u8) << 1;
        i2c.write(self.address, &[command, high, low])
            .map_err(Error::Bus)?;
        self.channels[channel.index()] = state;
        Ok(())
    }

    /// Writes a new code to a channel, keeping its voltage reference and gain.
    pub fn set_value<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        value: u16,
    ) -> Result<(), Error<I2C::Error>> {
        let ChannelState { vref, gain, .. } = self.channels[channel.index()];
        self.write_channel(i2c, channel, value, vref, gain)
    }

    /// Writes a code expressed as a fraction of full scale.
    pub fn set_normalized<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        value: f32,
    ) -> Result<(), Error<I2C::Error>> {
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::OutOfRange);
        }
        self.set_value(i2c, channel, (value * f32::from(MAX_VALUE)) as u16)
    }

    /// Rewrites all four channels from their last known state in a single transaction, so that changes to several
    /// channels take effect together.
    pub fn write_all_channels<I2C: I2c>(&mut self, i2c: &mut I2C) -> Result<(), Error<I2C::Error>> {
        let mut buffer = [0_u8; 12];
        for (frame, channel) in buffer.chunks_exact_mut(3).zip(Channel::ALL) {
            let [high, low] = self.channels[channel.index()].encode();
            frame.copy_from_slice(&[MULTI_WRITE | (channel as u8) << 1, high, low]);
        }
        i2c.write(self.address, &buffer).map_err(Error::Bus)
    }

    /// Selects the voltage reference of a channel.
    pub fn set_vref<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        vref: Vref,
    ) -> Result<(), Error<I2C::Error>> {
        let mut channels = self.channels;
        channels[channel.index()].vref = vref;
        let command = channels
            .iter()
            .enumerate()
            .fold(VREF_SELECT, |command, (i, state)| {
                command | u8::from(state.vref == Vref::Internal) << (3 - i)
            });
        i2c.write(self.address, &[command]).map_err(Error::Bus)?;
        self.channels = channels;
        Ok(())
    }

    /// Selects the gain of a channel. Fails with [`Error::InvalidGain`] unless `gain` is 1 or 2.
    pub fn set_gain<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        gain: u8,
    ) -> Result<(), Error<I2C::Error>> {
        let gain = Gain::from_u8(gain).ok_or(Error::InvalidGain)?;
        let mut channels = self.channels;
        channels[channel.index()].gain = gain;
        let command = channels
            .iter()
            .enumerate()
            .fold(GAIN_SELECT, |command, (i, state)| {
                command | u8::from(state.gain == Gain::X2) << (3 - i)
            });
        i2c.write(self.address, &[command]).map_err(Error::Bus)?;
        self.channels = channels;
        Ok(())
    }

    /// Selects the power-down mode of a channel. Fails with [`Error::InvalidMode`] unless `mode` is in `0..=3`.
    pub fn set_power_down<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        mode: u8,
    ) -> Result<(), Error<I2C::Error>> {
        let mode = PowerDown::from_u8(mode).ok_or(Error::InvalidMode)?;
        let mut channels = self.channels;
        channels[channel.index()].power_down = mode;
        let [a, b, c, d] = channels.map(|state| state.power_down as u8);
        let command = [POWER_DOWN_SELECT | a << 2 | b, c << 6 | d << 4];
        i2c.write(self.address, &command).map_err(Error::Bus)?;
        self.channels = channels;
        Ok(())
    }

    /// Applies a complete channel state: reference, gain, code and power-down mode, in that order.
    pub fn configure<I2C: I2c>(
        &mut self,
        i2c: &mut I2C,
        channel: Channel,
        state: ChannelState,
    ) -> Result<(), Error<I2C::Error>> {
        self.set_vref(i2c, channel, state.vref)?;
        self.set_gain(i2c, channel, state.gain as u8)?;
        self.set_value(i2c, channel, state.value)?;
        self.set_power_down(i2c, channel, state.power_down as u8)
    }

    /// Persists the last known state of every channel to EEPROM, making it the power-up default, then waits out the
    /// write cycle. Talking to the device before [`EEPROM_SETTLE`] has passed risks corrupting the write.
    pub fn save_to_eeprom<I2C: I2c, D: DelayNs>(
        &mut self,
        i2c: &mut I2C,
        delay: &mut D,
    ) -> Result<(), Error<I2C::Error>> {
        // sequential write starting at channel A
        let mut buffer = [0_u8; 9];
        buffer[0] = SEQUENTIAL_WRITE;
        for (pair, state) in buffer[1..].chunks_exact_mut(2).zip(self.channels.iter()) {
            pair.copy_from_slice(&state.encode());
        }
        i2c.write(self.address, &buffer).map_err(Error::Bus)?;
        debug!("Saved MCP4728 at {=u8:#x} to EEPROM", self.address);
        delay.delay_ms(EEPROM_SETTLE.as_millis() as u32);
        Ok(())
    }
}
