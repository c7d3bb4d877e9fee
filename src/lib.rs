// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! qspi-nor
//!
//! This crate drives a serial NOR flash memory (Micron MT25Q family) over a
//! quad-SPI command bus, providing identification, subsector erase, page
//! program and read, plus an end-to-end self-test.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
use alloc::vec::Vec;

use core::time::Duration;
#[cfg(feature = "std")]
use indicatif::ProgressBar;

pub mod bus;
pub mod command;
pub mod id;
pub mod selftest;
pub mod sreg;

#[cfg(all(test, feature = "std"))]
mod sim;

pub use bus::{Clock, Deadline, QspiBus};
#[cfg(feature = "std")]
pub use bus::{SystemClock, TransportTimeout};
pub use command::{AddressWidth, Command, DataDirection};
pub use id::DeviceIdentity;
pub use selftest::{LogSink, Outcome, ReportSink, SelfTest, SelfTestConfig, SelfTestFailure,
                   SelfTestReport, Step, StepEvent};
pub use sreg::StatusRegister;

/// Largest amount of data a single page program may write, in bytes.
pub const PAGE_SIZE: usize = 256;

/// Size of the subsector erased by a single erase operation, in bytes.
pub const ERASE_SIZE: usize = 4096;

/// Value of every byte in an erased region.
///
/// NOR flash erases to all ones; devices with the opposite polarity are not supported.
pub const ERASED_BYTE: u8 = 0xFF;

/// Condition being polled for when a `Timeout` occurred.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitCondition {
    /// Waiting for the WEL bit to be set after WriteEnable.
    WriteEnableLatch,
    /// Waiting for the WIP bit to clear after an erase or program.
    WriteComplete,
}

impl core::fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            WaitCondition::WriteEnableLatch => write!(f, "write enable latch"),
            WaitCondition::WriteComplete => write!(f, "write completion"),
        }
    }
}

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("QSPI bus fault: {0}")]
    Bus(#[from] anyhow::Error),
    #[error("QSPI bus transfer exceeded its {timeout:?} timeout.")]
    BusTimeout { timeout: Duration },
    #[error("Timed out after {timeout:?} waiting for {condition}.")]
    Timeout { condition: WaitCondition, timeout: Duration },
    #[error("Invalid argument: {0}.")]
    InvalidArgument(&'static str),
    #[error("Verify mismatch at 0x{address:08X} (offset {offset}): \
             expected 0x{expected:02X}, read 0x{observed:02X}.")]
    VerifyMismatch { address: u32, offset: usize, expected: u8, observed: u8 },
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error<E = ()> {
    Bus(E),
    BusTimeout { timeout: Duration },
    Timeout { condition: WaitCondition, timeout: Duration },
    InvalidArgument(&'static str),
    VerifyMismatch { address: u32, offset: usize, expected: u8, observed: u8 },
}

#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, Error>;
#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, Error<()>>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// A span of flash memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashRegion {
    pub start: u32,
    pub length: u32,
}

impl FlashRegion {
    pub fn new(start: u32, length: u32) -> Self {
        FlashRegion { start, length }
    }

    /// The single erase subsector starting at `start`.
    pub fn subsector(start: u32) -> Self {
        FlashRegion { start, length: ERASE_SIZE as u32 }
    }
}

/// Progress of the current mutating operation.
///
/// Every erase, program or address mode change moves through
/// `Idle → WriteEnablePending → WriteEnableLatched → CommandIssued`.
/// `wait_while_busy()` moves to `DeviceBusy` once it has seen WIP set,
/// and returns to `Idle` once it observes WIP clear.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    WriteEnablePending,
    WriteEnableLatched,
    CommandIssued,
    DeviceBusy,
}

/// QSPI NOR Flash.
///
/// This struct provides the command protocol for an MT25Q-style flash,
/// borrowing the bus for its lifetime so no other user can interleave commands.
pub struct Flash<'a, B: QspiBus, C: Clock> {
    bus: &'a mut B,
    clock: C,

    /// Once read, the identity is cached.
    id: Option<DeviceIdentity>,

    /// Set once the device has been switched to 4-byte address mode.
    four_byte_addressing: bool,

    state: OperationState,

    /// Timeout applied to every individual bus transaction.
    transaction_timeout: Duration,

    /// How long to poll for WEL after sending WriteEnable.
    write_enable_timeout: Duration,
}

impl<'a, B: QspiBus, C: Clock> Flash<'a, B, C> {
    /// Create a new Flash instance using the given bus and clock.
    pub fn new(bus: &'a mut B, clock: C) -> Self {
        Flash {
            bus,
            clock,
            id: None,
            four_byte_addressing: false,
            state: OperationState::Idle,
            transaction_timeout: Duration::from_millis(100),
            write_enable_timeout: Duration::from_millis(100),
        }
    }

    /// Get the timeout applied to each bus transaction.
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    /// Set the timeout applied to each bus transaction. Defaults to 100ms.
    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.transaction_timeout = timeout;
    }

    /// Get the time allowed for WEL to latch after WriteEnable.
    pub fn write_enable_timeout(&self) -> Duration {
        self.write_enable_timeout
    }

    /// Set the time allowed for WEL to latch after WriteEnable. Defaults to 100ms.
    pub fn set_write_enable_timeout(&mut self, timeout: Duration) {
        self.write_enable_timeout = timeout;
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    pub fn erase_size(&self) -> usize {
        ERASE_SIZE
    }

    /// Get the device identity, if it has already been read.
    ///
    /// Call `read_identity()` to read it from the flash.
    pub fn get_id(&self) -> Option<DeviceIdentity> {
        self.id
    }

    /// True once `enable_32bit_addressing()` has succeeded since the last reset.
    pub fn four_byte_addressing(&self) -> bool {
        self.four_byte_addressing
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Block for `dur` using the flash's clock.
    pub fn delay(&mut self, dur: Duration) {
        self.clock.delay(dur);
    }

    /// Reset the attached flash.
    ///
    /// Sends EnableReset 0x66 followed by ResetMemory 0x99. The device needs
    /// at least 1ms to recover before it accepts further commands.
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting flash");
        self.command(Instruction::ResetEnable)?;
        self.command(Instruction::ResetMemory)?;
        self.state = OperationState::Idle;
        self.four_byte_addressing = false;
        Ok(())
    }

    /// Read the manufacturer, memory type and capacity bytes.
    ///
    /// `self.id` is updated with the new identity; use `get_id()` to
    /// retrieve it without re-reading it from the flash.
    pub fn read_identity(&mut self) -> Result<DeviceIdentity> {
        log::debug!("Reading flash identity");
        let data = self.read_bytes(&Command::read(Instruction::ReadId, 3))?;
        let id = DeviceIdentity::from_bytes([data[0], data[1], data[2]]);
        log::debug!("Read identity: {:02X?}", id);
        self.id = Some(id);
        Ok(id)
    }

    /// Switch the device to 4-byte address mode.
    ///
    /// The caller should `wait_while_busy()` before the next command.
    pub fn enable_32bit_addressing(&mut self) -> Result<()> {
        log::debug!("Entering 4-byte address mode");
        self.write_enable()?;
        self.issue(&Command::simple(Instruction::Enable4ByteAddress), None)?;
        self.four_byte_addressing = true;
        Ok(())
    }

    /// Read the status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        self.read_bytes(&Command::read(Instruction::ReadStatusRegister, 1))
            .map(|data| StatusRegister(data[0]))
    }

    /// Check if the device is currently busy performing an erase or program.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status().map(|status| status.get_write_in_progress())
    }

    /// Wait until the device stops being busy, or `timeout` elapses.
    ///
    /// The status register is polled back-to-back, at least once.
    pub fn wait_while_busy(&mut self, timeout: Duration) -> Result<()> {
        self.wait_while_busy_cb(timeout, |_| {})
    }

    /// Wait until the device stops being busy, or `timeout` elapses.
    ///
    /// Calls `cb` with the elapsed milliseconds after each status poll.
    pub fn wait_while_busy_cb<F: Fn(u32)>(&mut self, timeout: Duration, cb: F) -> Result<()> {
        log::trace!("Waiting up to {:?} for write completion", timeout);
        self.poll_status(timeout, WaitCondition::WriteComplete,
                         |status| !status.get_write_in_progress(), cb)?;
        self.state = OperationState::Idle;
        Ok(())
    }

    /// Wait until the device stops being busy, or `timeout` elapses.
    ///
    /// This is identical to `wait_while_busy()`, except it draws a spinner
    /// to the terminal while waiting, which is useful for erase-scale waits.
    #[cfg(feature = "std")]
    pub fn wait_while_busy_progress(&mut self, timeout: Duration) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        pb.set_message("Waiting for flash");
        let result = self.wait_while_busy_cb(timeout, |ms| {
            pb.set_message(&format!("Waiting for flash ({} ms)", ms));
            pb.tick();
        });
        pb.finish();
        result
    }

    /// Send the WriteEnable command and wait for WEL to be set.
    ///
    /// The device clears WEL after every completed erase, program or
    /// configuration write, so this must precede each mutating command.
    /// If WEL does not latch within the write-enable timeout the operation
    /// is abandoned.
    pub fn write_enable(&mut self) -> Result<()> {
        self.state = OperationState::WriteEnablePending;
        let timeout = self.write_enable_timeout;
        let result = self.command(Instruction::WriteEnable).and_then(|()| {
            self.poll_status(timeout, WaitCondition::WriteEnableLatch,
                             |status| status.get_write_enable_latch(), |_| {})
        });
        match result {
            Ok(_) => {
                self.state = OperationState::WriteEnableLatched;
                Ok(())
            },
            Err(err) => {
                self.state = OperationState::Idle;
                Err(err)
            },
        }
    }

    /// Erase one 4kB subsector.
    ///
    /// `region` must be exactly one subsector and aligned to it. Erasing is
    /// slow and runs in the background on the device; call `wait_while_busy()`
    /// with a generous timeout before relying on the contents.
    pub fn erase_region(&mut self, region: FlashRegion) -> Result<()> {
        if region.length as usize != ERASE_SIZE {
            log::error!("Erase length {} is not the {} byte subsector size",
                        region.length, ERASE_SIZE);
            return Err(Error::InvalidArgument("erase length must be one subsector"));
        }
        if region.start as usize % ERASE_SIZE != 0 {
            log::error!("Erase address 0x{:08X} is not subsector aligned", region.start);
            return Err(Error::InvalidArgument("erase address must be subsector aligned"));
        }
        log::debug!("Erasing 4kB subsector at 0x{:08X}", region.start);
        self.write_enable()?;
        self.issue(&Command::addressed(Instruction::SubsectorErase4K4B, region.start), None)
    }

    /// Program up to one page of data.
    ///
    /// `data` must be 1 to 256 bytes and must not cross a page boundary;
    /// otherwise nothing is sent to the device. Programming completes in the
    /// background; call `wait_while_busy()` afterwards.
    ///
    /// Note that this does *not* erase the flash beforehand.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            log::error!("Refusing to program zero bytes");
            return Err(Error::InvalidArgument("program data is empty"));
        }
        if data.len() > PAGE_SIZE {
            log::error!("Program of {} bytes exceeds page size {}", data.len(), PAGE_SIZE);
            return Err(Error::InvalidArgument("program data exceeds page size"));
        }
        if (address as usize % PAGE_SIZE) + data.len() > PAGE_SIZE {
            log::error!("Program of {} bytes at 0x{:08X} crosses a page boundary",
                        data.len(), address);
            return Err(Error::InvalidArgument("program would cross a page boundary"));
        }
        log::debug!("Programming {} bytes at 0x{:08X}", data.len(), address);
        self.write_enable()?;
        self.issue(&Command::write_4b(Instruction::PageProgram4B, address, data.len()), Some(data))
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// This uses the 4-byte ReadData instruction with no dummy cycles,
    /// which is slow but supported in every configuration.
    pub fn read_region(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if (address as u64) + (length as u64) > (1u64 << 32) {
            log::error!("Read of {} bytes at 0x{:08X} would wrap", length, address);
            return Err(Error::InvalidArgument("read would wrap past the end of the address space"));
        }
        log::debug!("Reading {} bytes at 0x{:08X}", length, address);
        self.read_bytes(&Command::read_4b(Instruction::ReadData4B, address, length))
    }

    /// Run one command on the bus using the configured transaction timeout.
    ///
    /// `payload` is required for commands with a write phase; the data of a read
    /// phase is returned.
    pub fn execute(&mut self, command: &Command, payload: Option<&[u8]>)
        -> Result<Option<Vec<u8>>>
    {
        bus::execute(&mut *self.bus, command, payload, self.transaction_timeout)
    }

    /// Convenience method for issuing a single instruction with no address or data.
    pub fn command<I: Into<u8>>(&mut self, instruction: I) -> Result<()> {
        self.execute(&Command::simple(instruction), None).map(|_| ())
    }

    fn read_bytes(&mut self, command: &Command) -> Result<Vec<u8>> {
        self.execute(command, None).map(Option::unwrap_or_default)
    }

    /// Issue a mutating command after WEL has latched.
    fn issue(&mut self, command: &Command, payload: Option<&[u8]>) -> Result<()> {
        if let Err(err) = self.execute(command, payload) {
            self.state = OperationState::Idle;
            return Err(err);
        }
        log::trace!("Command 0x{:02X} issued", command.instruction());
        self.state = OperationState::CommandIssued;
        Ok(())
    }

    /// Poll the status register until `done` holds, or `timeout` elapses
    /// from the first poll.
    fn poll_status<D, F>(&mut self, timeout: Duration, condition: WaitCondition, done: D, cb: F)
        -> Result<StatusRegister>
    where
        D: Fn(StatusRegister) -> bool,
        F: Fn(u32),
    {
        let deadline = Deadline::start(&mut self.clock, timeout);
        loop {
            let status = self.read_status()?;
            if done(status) {
                return Ok(status);
            }
            if condition == WaitCondition::WriteComplete {
                self.state = OperationState::DeviceBusy;
            }
            cb(deadline.elapsed_ms(&mut self.clock));
            if deadline.expired(&mut self.clock) {
                log::error!("Timed out after {:?} waiting for {}, status 0x{:02X}",
                            timeout, condition, status.0);
                return Err(Error::Timeout { condition, timeout });
            }
        }
    }
}

/// MT25Q instruction opcodes used by this driver.
///
/// Erase, program and read use the dedicated 4-byte address variants,
/// which take a 32-bit address regardless of the current address mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    ResetEnable = 0x66,
    ResetMemory = 0x99,
    ReadId = 0x9F,
    ReadStatusRegister = 0x05,
    WriteEnable = 0x06,
    Enable4ByteAddress = 0xB7,
    SubsectorErase4K4B = 0x21,
    PageProgram4B = 0x12,
    ReadData4B = 0x13,
}
