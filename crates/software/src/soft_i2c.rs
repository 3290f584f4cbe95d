//! A bit-banged I²C controller built directly on two GPIO lines.
//!
//! The bus is used for two things: ordinary register access to the DACs (through the [`embedded_hal::i2c::I2c`]
//! implementation, which makes it interchangeable with a hardware peripheral) and the address provisioning
//! protocol, which needs to interleave chip-select changes between individual bytes and is therefore written
//! against the lower-level [`BitBang`] primitives.
//!
//! Every clock transition is separated by the same half-period delay so that setup and hold requirements are met
//! uniformly. All operations busy-wait; nothing here yields to an executor.

use embassy_time::Duration;
use embedded_hal::{
    delay::DelayNs,
    digital::{self, InputPin, OutputPin},
    i2c::{self, ErrorKind, NoAcknowledgeSource, Operation, SevenBitAddress},
};

/// How many times the data line is sampled while waiting for an acknowledgement before the transaction is abandoned.
pub const ACK_POLL_LIMIT: u16 = 1000;

/// Standard mode (100 kHz) requires SCL to be held high for at least 4.0 µs.
pub const DEFAULT_HALF_PERIOD: Duration = Duration::from_micros(4);

/// What the controller drives onto the data line after receiving a byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ack {
    /// More bytes are expected.
    Ack,
    /// The byte just received is the last one.
    Nack,
}

/// Errors raised by the bit-banged bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError<P> {
    /// The remote device never pulled the data line low. A stop condition has already been issued.
    AckTimeout,
    /// One of the GPIO lines reported an error.
    Pin(P),
}

impl<P: core::fmt::Debug> i2c::Error for BusError<P> {
    fn kind(&self) -> ErrorKind {
        match self {
            BusError::AckTimeout => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            BusError::Pin(_) => ErrorKind::Other,
        }
    }
}

/// Byte-level I²C primitives.
///
/// Unlike [`embedded_hal::i2c::I2c`], which models whole transactions, this trait leaves framing to the caller,
/// who is then free to do other work (e.g., toggling a chip-select line) between any two steps.
pub trait BitBang {
    /// Error type shared by every primitive.
    type Error;

    /// Issues a start (or repeated start) condition.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Issues a stop condition.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Shifts out one byte, most-significant bit first. The acknowledgement must be collected with
    /// [`wait_ack`][Self::wait_ack].
    fn send_byte(&mut self, byte: u8) -> Result<(), Self::Error>;

    /// Releases the data line for the acknowledgement clock and waits for the remote device to pull it low.
    fn wait_ack(&mut self) -> Result<(), Self::Error>;

    /// Shifts in one byte, most-significant bit first, then answers with `ack`.
    fn read_byte(&mut self, ack: Ack) -> Result<u8, Self::Error>;

    /// Sends a byte and waits for it to be acknowledged.
    fn write_byte(&mut self, byte: u8) -> Result<(), Self::Error> {
        self.send_byte(byte)?;
        self.wait_ack()
    }
}

type PinError<SDA> = <SDA as digital::ErrorType>::Error;

/// An I²C controller driving SCL and SDA by hand.
///
/// SDA must be wired as an open-drain line with an external pull-up: setting it high releases the line, which is
/// what allows the remote device to acknowledge and to send data.
pub struct SoftI2cBus<SCL, SDA, D> {
    scl: SCL,
    sda: SDA,
    delay: D,
    half_period: Duration,
}

impl<SCL, SDA, D> SoftI2cBus<SCL, SDA, D>
where
    SDA: InputPin + OutputPin,
    SCL: OutputPin<Error = PinError<SDA>>,
    D: DelayNs,
{
    /// Constructs a bus clocked at [`DEFAULT_HALF_PERIOD`].
    pub fn new(scl: SCL, sda: SDA, delay: D) -> Self {
        Self::with_half_period(scl, sda, delay, DEFAULT_HALF_PERIOD)
    }

    /// Constructs a bus with a custom half period.
    pub fn with_half_period(scl: SCL, sda: SDA, delay: D, half_period: Duration) -> Self {
        Self {
            scl,
            sda,
            delay,
            half_period,
        }
    }

    /// Gives back the lines and the delay provider.
    pub fn release(self) -> (SCL, SDA, D) {
        (self.scl, self.sda, self.delay)
    }

    /// Waits one half period, saturating at the longest delay [`DelayNs`] can express.
    fn pause(&mut self) {
        let us = u32::try_from(self.half_period.as_micros()).unwrap_or(u32::MAX);
        self.delay.delay_us(us);
    }

    fn scl(&mut self, high: bool) -> Result<(), BusError<PinError<SDA>>> {
        if high {
            self.scl.set_high()
        } else {
            self.scl.set_low()
        }
        .map_err(BusError::Pin)
    }

    fn sda(&mut self, high: bool) -> Result<(), BusError<PinError<SDA>>> {
        if high {
            self.sda.set_high()
        } else {
            self.sda.set_low()
        }
        .map_err(BusError::Pin)
    }

    fn sda_is_high(&mut self) -> Result<bool, BusError<PinError<SDA>>> {
        self.sda.is_high().map_err(BusError::Pin)
    }

    fn run(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), BusError<PinError<SDA>>> {
        // `Some(true)` while reading, `Some(false)` while writing
        let mut direction: Option<bool> = None;

        for index in 0..operations.len() {
            let next_is_read = matches!(operations.get(index + 1), Some(Operation::Read(_)));
            let reading = matches!(operations[index], Operation::Read(_));

            // contiguous operations of the same kind share a frame; a change of direction needs a repeated start
            if direction != Some(reading) {
                self.start()?;
                self.write_byte((address << 1) | u8::from(reading))?;
                direction = Some(reading);
            }

            match &mut operations[index] {
                Operation::Write(bytes) => {
                    for &byte in bytes.iter() {
                        self.write_byte(byte)?;
                    }
                }
                Operation::Read(buffer) => {
                    let len = buffer.len();
                    for (i, slot) in buffer.iter_mut().enumerate() {
                        let last = i + 1 == len && !next_is_read;
                        *slot = self.read_byte(if last { Ack::Nack } else { Ack::Ack })?;
                    }
                }
            }
        }

        self.stop()
    }
}

impl<SCL, SDA, D> BitBang for SoftI2cBus<SCL, SDA, D>
where
    SDA: InputPin + OutputPin,
    SCL: OutputPin<Error = PinError<SDA>>,
    D: DelayNs,
{
    type Error = BusError<PinError<SDA>>;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.sda(true)?;
        self.scl(true)?;
        self.pause();
        // SDA falling while SCL is high
        self.sda(false)?;
        self.pause();
        self.scl(false)
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.scl(false)?;
        self.sda(false)?;
        self.pause();
        self.scl(true)?;
        self.pause();
        // SDA rising while SCL is high
        self.sda(true)?;
        self.pause();
        Ok(())
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), Self::Error> {
        self.scl(false)?;
        for bit in (0..8).rev() {
            self.sda(byte & (1 << bit) != 0)?;
            self.pause();
            self.scl(true)?;
            self.pause();
            self.scl(false)?;
            self.pause();
        }
        Ok(())
    }

    fn wait_ack(&mut self) -> Result<(), Self::Error> {
        self.sda(true)?;
        self.pause();
        self.scl(true)?;
        self.pause();

        for _ in 0..ACK_POLL_LIMIT {
            if !self.sda_is_high()? {
                return self.scl(false);
            }
        }

        warn!("No acknowledgement after {} polls; aborting transaction", ACK_POLL_LIMIT);
        self.stop()?;
        Err(BusError::AckTimeout)
    }

    fn read_byte(&mut self, ack: Ack) -> Result<u8, Self::Error> {
        // let go of the data line so the remote device can drive it
        self.sda(true)?;

        let mut byte = 0_u8;
        for _ in 0..8 {
            self.scl(false)?;
            self.pause();
            self.scl(true)?;
            byte = (byte << 1) | u8::from(self.sda_is_high()?);
            self.pause();
        }

        self.scl(false)?;
        self.sda(ack == Ack::Nack)?;
        self.pause();
        self.scl(true)?;
        self.pause();
        self.scl(false)?;

        trace!("Read {=u8:#x} from bus", byte);
        Ok(byte)
    }
}

impl<SCL, SDA, D> i2c::ErrorType for SoftI2cBus<SCL, SDA, D>
where
    SDA: InputPin + OutputPin,
    SCL: OutputPin<Error = PinError<SDA>>,
    D: DelayNs,
{
    type Error = BusError<PinError<SDA>>;
}

impl<SCL, SDA, D> i2c::I2c for SoftI2cBus<SCL, SDA, D>
where
    SDA: InputPin + OutputPin,
    SCL: OutputPin<Error = PinError<SDA>>,
    D: DelayNs,
{
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.run(address, operations)
    }
}
