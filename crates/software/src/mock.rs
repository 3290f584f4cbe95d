//! Test doubles for the hardware the library drives.

extern crate std;

use core::{cell::RefCell, convert::Infallible};
use embedded_hal::{
    delay::DelayNs,
    digital::{self, InputPin, OutputPin},
    i2c::{self, ErrorKind, NoAcknowledgeSource, Operation, SevenBitAddress},
};
use std::{collections::VecDeque, rc::Rc, vec::Vec};

/// A level change on one of the bus lines, or a sample of SDA taken by the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Line {
    Scl(bool),
    Sda(bool),
    Sample(bool),
}

#[derive(Default)]
struct WireState {
    events: Vec<Line>,
    responses: VecDeque<bool>,
}

/// Records everything the controller does to SCL and SDA; SDA reads are served from a script and otherwise read
/// high, as an idle open-drain line would.
#[derive(Clone, Default)]
pub struct Wire(Rc<RefCell<WireState>>);

impl Wire {
    pub fn events(&self) -> Vec<Line> {
        self.0.borrow().events.clone()
    }

    pub fn respond(&self, levels: &[bool]) {
        self.0.borrow_mut().responses.extend(levels.iter().copied());
    }

    pub fn samples(&self) -> usize {
        self.0
            .borrow()
            .events
            .iter()
            .filter(|event| matches!(event, Line::Sample(_)))
            .count()
    }

    fn push(&self, line: Line) {
        self.0.borrow_mut().events.push(line);
    }
}

/// The SDA levels present at every data clock, i.e., every SCL high phase during which SDA is left alone.
///
/// Start and stop conditions change SDA while SCL is high, so they are not counted.
pub fn clocked_bits(events: &[Line]) -> Vec<bool> {
    let mut bits = Vec::new();
    let mut sda = true;
    let mut clock: Option<bool> = None;

    for event in events {
        match *event {
            Line::Sda(level) => {
                sda = level;
                // an SDA edge during the high phase turns this clock into a start or stop condition
                clock = None;
            }
            Line::Scl(true) => clock = Some(sda),
            Line::Scl(false) => {
                if let Some(level) = clock.take() {
                    bits.push(level);
                }
            }
            Line::Sample(_) => {}
        }
    }
    bits
}

pub struct Scl(pub Wire);

impl digital::ErrorType for Scl {
    type Error = Infallible;
}

impl OutputPin for Scl {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.push(Line::Scl(false));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.push(Line::Scl(true));
        Ok(())
    }
}

pub struct Sda(pub Wire);

impl digital::ErrorType for Sda {
    type Error = Infallible;
}

impl OutputPin for Sda {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.push(Line::Sda(false));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.push(Line::Sda(true));
        Ok(())
    }
}

impl InputPin for Sda {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        let level = self.0.0.borrow_mut().responses.pop_front().unwrap_or(true);
        self.0.push(Line::Sample(level));
        Ok(level)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_high()?)
    }
}

/// A [`DelayNs`] which only keeps track of how long it was asked to wait.
#[derive(Clone, Default)]
pub struct MockDelay(Rc<RefCell<Vec<u32>>>);

impl MockDelay {
    pub fn calls(&self) -> Vec<u32> {
        self.0.borrow().clone()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.0.borrow().iter().map(|&ns| u64::from(ns)).sum::<u64>() / 1_000
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().push(ns);
    }
}

/// Something observable that happened to the hardware, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Pin(&'static str, bool),
    Write(u8, Vec<u8>),
    Read(u8),
}

/// A shared, ordered log of [`Event`]s.
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<Event>>>);

impl Log {
    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Write(address, bytes) => Some((*address, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|event| matches!(event, Event::Read(_)))
            .count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }
}

/// An output pin which logs its level changes under a name.
pub struct Pin {
    name: &'static str,
    log: Log,
}

impl Pin {
    pub fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }
}

impl digital::ErrorType for Pin {
    type Error = Infallible;
}

impl OutputPin for Pin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.log.push(Event::Pin(self.name, false));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.log.push(Event::Pin(self.name, true));
        Ok(())
    }
}

/// Register image of one simulated MCP4728: per channel, the high and low byte of the input register followed by
/// the high and low byte of its EEPROM copy.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Registers(pub [[u8; 4]; 4]);

/// A bus populated with simulated MCP4728 devices, which understand the subset of commands the driver issues.
pub struct FakeDacs {
    devices: Vec<(u8, Registers)>,
    log: Log,
    /// Transactions left before every device stops acknowledging; `None` never fails.
    fuse: Option<usize>,
}

impl FakeDacs {
    pub fn new(addresses: &[u8], log: &Log) -> Self {
        Self {
            devices: addresses
                .iter()
                .map(|&address| (address, Registers::default()))
                .collect(),
            log: log.clone(),
            fuse: None,
        }
    }

    /// Lets `transactions` more transactions through, then fails every one after them.
    pub fn fail_after(&mut self, transactions: usize) {
        self.fuse = Some(transactions);
    }

    pub fn registers(&self, address: u8) -> Registers {
        self.devices
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, registers)| *registers)
            .unwrap_or_default()
    }

    pub fn set_registers(&mut self, address: u8, registers: Registers) {
        if let Some((_, r)) = self.devices.iter_mut().find(|(a, _)| *a == address) {
            *r = registers;
        }
    }

    fn apply(registers: &mut Registers, bytes: &[u8]) {
        let Some(&command) = bytes.first() else {
            return;
        };
        let channels = &mut registers.0;
        match command >> 5 {
            // write commands: multi-write, sequential write, single write
            0b010 => match (command >> 3) & 0b11 {
                0b00 => {
                    for frame in bytes.chunks(3) {
                        if let [command, high, low] = *frame {
                            let channel = &mut channels[usize::from((command >> 1) & 0b11)];
                            channel[0] = high;
                            channel[1] = low;
                        }
                    }
                }
                0b10 => {
                    let first = usize::from((command >> 1) & 0b11);
                    for (offset, pair) in bytes[1..].chunks(2).enumerate() {
                        if let ([high, low], Some(channel)) = (pair, channels.get_mut(first + offset)) {
                            *channel = [*high, *low, *high, *low];
                        }
                    }
                }
                _ => {}
            },
            0b100 => {
                for (i, channel) in channels.iter_mut().enumerate() {
                    let internal = command & (1 << (3 - i)) != 0;
                    channel[0] = (channel[0] & !0x80) | if internal { 0x80 } else { 0 };
                }
            }
            0b110 => {
                for (i, channel) in channels.iter_mut().enumerate() {
                    let doubled = command & (1 << (3 - i)) != 0;
                    channel[0] = (channel[0] & !0x10) | if doubled { 0x10 } else { 0 };
                }
            }
            0b101 => {
                let second = bytes.get(1).copied().unwrap_or_default();
                let modes = [
                    (command >> 2) & 0b11,
                    command & 0b11,
                    (second >> 6) & 0b11,
                    (second >> 4) & 0b11,
                ];
                for (channel, mode) in channels.iter_mut().zip(modes) {
                    channel[0] = (channel[0] & !0x60) | (mode << 5);
                }
            }
            _ => {}
        }
    }
}

impl i2c::ErrorType for FakeDacs {
    type Error = ErrorKind;
}

impl i2c::I2c for FakeDacs {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        match self.fuse {
            Some(0) => return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let Some((_, registers)) = self.devices.iter_mut().find(|(a, _)| *a == address) else {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        };

        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    self.log.push(Event::Write(address, bytes.to_vec()));
                    Self::apply(registers, *bytes);
                }
                Operation::Read(buffer) => {
                    self.log.push(Event::Read(address));
                    for (i, byte) in buffer.iter_mut().enumerate() {
                        let channel = registers.0[(i / 6) % 4];
                        *byte = match i % 6 {
                            // header byte: ready bit plus channel select
                            0 => 0x80 | ((i / 6) as u8) << 4,
                            1 => channel[0],
                            2 => channel[1],
                            3 => 0x80 | ((i / 6) as u8) << 4 | 0x08,
                            4 => channel[2],
                            _ => channel[3],
                        };
                    }
                }
            }
        }
        Ok(())
    }
}
