//! One-time assignment of unique bus addresses to MCP4728s which all left the factory at the same address.
//!
//! Every MCP4728 has an LDAC input; the address commands are only accepted by a device whose LDAC line is pulled
//! low at a precise point in the transaction, i.e., after the second byte has been clocked out and before it is
//! acknowledged. Wiring each device's LDAC to its own GPIO turns those lines into chip selects, which is what lets
//! identical devices be told apart.
//!
//! Provisioning repeats whole passes over every device until a pass finds nothing left to change. It never gives
//! up; a device that cannot be reprogrammed keeps the firmware in this loop, which is the intended outcome at
//! bring-up.

use crate::soft_i2c::{Ack, BitBang};
use embassy_time::Duration;
use embedded_hal::{delay::DelayNs, digital::OutputPin};

/// Time the device needs to commit a new address to EEPROM.
pub const ADDRESS_SETTLE: Duration = Duration::from_millis(20);

/// Pause between provisioning passes.
pub const PASS_BACKOFF: Duration = Duration::from_millis(10);

/// General call address.
const GENERAL_CALL: u8 = 0x00;
/// General call command asking the selected device for its address.
const READ_ADDRESS: u8 = 0x0C;
/// Every MCP4728 address has this prefix; only the lowest three bits are programmable.
const ADDRESS_PREFIX: u8 = 0x60;
/// Command bytes of the address write sequence, each carrying an address in bits 4..2.
const WRITE_CURRENT_ADDRESS: u8 = 0x61;
const WRITE_NEW_ADDRESS: u8 = 0x62;
const CONFIRM_NEW_ADDRESS: u8 = 0x63;

/// Errors raised while provisioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<B, P> {
    /// A bus primitive failed.
    Bus(B),
    /// An LDAC line could not be driven.
    Pin(P),
    /// There is no LDAC line with this index.
    UnknownChip(usize),
}

type ProvisioningError<B, CS> =
    Error<<B as BitBang>::Error, <CS as embedded_hal::digital::ErrorType>::Error>;

/// Drives `N` MCP4728s, each selected by its own LDAC line, to the addresses in `targets`.
pub struct Provisioner<B, CS, D, const N: usize> {
    bus: B,
    selects: [CS; N],
    targets: [u8; N],
    delay: D,
}

impl<B, CS, D, const N: usize> Provisioner<B, CS, D, N>
where
    B: BitBang,
    CS: OutputPin,
    D: DelayNs,
{
    /// Constructs a [`Provisioner`]. `targets[i]` is the 7-bit address wanted for the device on `selects[i]`.
    pub fn new(bus: B, selects: [CS; N], targets: [u8; N], delay: D) -> Self {
        Self {
            bus,
            selects,
            targets,
            delay,
        }
    }

    /// Gives back the bus, the LDAC lines (all high) and the delay provider.
    pub fn release(self) -> (B, [CS; N], D) {
        (self.bus, self.selects, self.delay)
    }

    /// Reads the current 7-bit address of the device on LDAC line `select`.
    pub fn read_address(&mut self, select: usize) -> Result<u8, ProvisioningError<B, CS>> {
        self.selected(select, |bus, cs| {
            bus.start().map_err(Error::Bus)?;
            bus.write_byte(GENERAL_CALL).map_err(Error::Bus)?;
            bus.send_byte(READ_ADDRESS).map_err(Error::Bus)?;
            cs.set_low().map_err(Error::Pin)?;
            bus.wait_ack().map_err(Error::Bus)?;
            bus.start().map_err(Error::Bus)?;
            bus.write_byte(ADDRESS_PREFIX << 1 | 1).map_err(Error::Bus)?;
            let reply = bus.read_byte(Ack::Nack).map_err(Error::Bus)?;
            bus.stop().map_err(Error::Bus)?;
            // `A2 A1 A0 1 A2 A1 A0 0`: the EEPROM copy of the address comes first
            Ok(ADDRESS_PREFIX | (reply >> 5) & 0b111)
        })
    }

    /// Moves the device on LDAC line `select` from address `old` to `new`, then waits for the new address to be
    /// committed.
    pub fn change_address(
        &mut self,
        old: u8,
        new: u8,
        select: usize,
    ) -> Result<(), ProvisioningError<B, CS>> {
        self.selected(select, |bus, cs| {
            bus.start().map_err(Error::Bus)?;
            bus.write_byte(old << 1).map_err(Error::Bus)?;
            bus.send_byte(WRITE_CURRENT_ADDRESS | (old & 0b111) << 2).map_err(Error::Bus)?;
            cs.set_low().map_err(Error::Pin)?;
            bus.wait_ack().map_err(Error::Bus)?;
            bus.write_byte(WRITE_NEW_ADDRESS | (new & 0b111) << 2).map_err(Error::Bus)?;
            bus.write_byte(CONFIRM_NEW_ADDRESS | (new & 0b111) << 2).map_err(Error::Bus)?;
            bus.stop().map_err(Error::Bus)?;
            Ok(())
        })?;
        self.delay.delay_ms(ADDRESS_SETTLE.as_millis() as u32);
        info!("Moved DAC on LDAC {} from {=u8:#x} to {=u8:#x}", select, old, new);
        Ok(())
    }

    /// Checks every device once, readdressing those not at their target. Returns how many were readdressed.
    pub fn pass(&mut self) -> Result<usize, ProvisioningError<B, CS>> {
        let mut changes = 0;
        for select in 0..N {
            let address = self.read_address(select)?;
            let target = self.targets[select];
            debug!(
                "DAC on LDAC {} is at {=u8:#x}, wanted at {=u8:#x}",
                select, address, target
            );
            if address != target {
                self.change_address(address, target, select)?;
                changes += 1;
            }
        }
        Ok(changes)
    }

    /// Runs passes until one completes without changing anything, and returns how many passes that took. Failed
    /// passes are retried.
    pub fn provision(&mut self) -> usize {
        let mut passes = 0;
        loop {
            passes += 1;
            match self.pass() {
                Ok(0) => {
                    info!("All {} DACs at their addresses after {} passes", N, passes);
                    return passes;
                }
                Ok(changes) => debug!("Pass {} readdressed {} DACs", passes, changes),
                Err(_) => warn!("Provisioning pass {} failed; retrying", passes),
            }
            self.delay.delay_ms(PASS_BACKOFF.as_millis() as u32);
        }
    }

    /// Runs `f` with every LDAC line high, passing it the line of the device being addressed. All lines are high
    /// again afterwards, even if `f` fails.
    fn selected<R>(
        &mut self,
        select: usize,
        f: impl FnOnce(&mut B, &mut CS) -> Result<R, ProvisioningError<B, CS>>,
    ) -> Result<R, ProvisioningError<B, CS>> {
        if select >= N {
            return Err(Error::UnknownChip(select));
        }
        self.deselect_all()?;
        let result = f(&mut self.bus, &mut self.selects[select]);
        self.deselect_all()?;
        result
    }

    fn deselect_all(&mut self) -> Result<(), ProvisioningError<B, CS>> {
        for cs in self.selects.iter_mut() {
            cs.set_high().map_err(Error::Pin)?;
        }
        Ok(())
    }
}
