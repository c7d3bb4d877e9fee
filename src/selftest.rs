//! End-to-end flash self-test.
//!
//! Runs reset, identify, address mode switch, subsector erase with verify,
//! and page program with verify, stopping at the first failure.

use alloc::vec::Vec;
use core::time::Duration;

use crate::bus::{Clock, QspiBus};
use crate::{DeviceIdentity, Error, Flash, FlashRegion, Result, ERASED_BYTE, PAGE_SIZE};

/// Default test pattern: byte `i` of the page is `i ^ 0xA5`.
pub fn xor_a5(i: usize) -> u8 {
    (i as u8) ^ 0xA5
}

/// Parameters of a self-test run.
#[derive(Copy, Clone, Debug)]
pub struct SelfTestConfig {
    /// Start of the subsector to erase and program. Must be 4kB aligned.
    pub address: u32,
    /// Time allowed for the device to recover after reset.
    pub settle: Duration,
    /// Timeout for address mode changes and page programs.
    pub short_timeout: Duration,
    /// Timeout for the subsector erase.
    pub erase_timeout: Duration,
    /// Byte to program at each offset of the test page.
    pub pattern: fn(usize) -> u8,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        SelfTestConfig {
            address: 0x0000_1000,
            settle: Duration::from_millis(1),
            short_timeout: Duration::from_millis(100),
            erase_timeout: Duration::from_millis(5000),
            pattern: xor_a5,
        }
    }
}

/// Steps of the self-test, in the order they run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Reset,
    ReadIdentity,
    EnableAddressing,
    Erase,
    VerifyErase,
    Program,
    VerifyProgram,
}

#[derive(Debug)]
pub enum Outcome<'e> {
    Passed,
    /// The identify step passed with these bytes.
    Identified(DeviceIdentity),
    Failed(&'e Error),
}

/// Event emitted once per step that ran.
#[derive(Debug)]
pub struct StepEvent<'e> {
    pub step: Step,
    pub outcome: Outcome<'e>,
}

impl<'e> StepEvent<'e> {
    pub fn passed(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed(_))
    }
}

/// Receiver for self-test step events.
pub trait ReportSink {
    fn report(&mut self, event: &StepEvent<'_>);
}

impl<F: FnMut(&StepEvent<'_>)> ReportSink for F {
    fn report(&mut self, event: &StepEvent<'_>) {
        self(event)
    }
}

/// Sink forwarding events to the `log` facade.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&mut self, event: &StepEvent<'_>) {
        match event.outcome {
            Outcome::Passed => log::info!("Self-test {:?}: OK", event.step),
            Outcome::Identified(id) => log::info!(
                "Self-test {:?}: ID {:02X} {:02X} {:02X}",
                event.step, id.manufacturer, id.memory_type, id.capacity),
            Outcome::Failed(err) => log::error!("Self-test {:?}: failed: {:?}", event.step, err),
        }
    }
}

/// The step at which a self-test stopped, and why.
#[derive(Debug)]
pub struct SelfTestFailure {
    pub step: Step,
    pub error: Error,
}

impl core::fmt::Display for SelfTestFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Self-test failed at {:?}: {:?}", self.step, self.error)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SelfTestFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Summary of a successful self-test.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SelfTestReport {
    pub identity: DeviceIdentity,
    pub region: FlashRegion,
}

/// Self-test runner.
pub struct SelfTest<S: ReportSink> {
    config: SelfTestConfig,
    sink: S,
}

impl<S: ReportSink> SelfTest<S> {
    pub fn new(config: SelfTestConfig, sink: S) -> Self {
        SelfTest { config, sink }
    }

    pub fn config(&self) -> &SelfTestConfig {
        &self.config
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run every step against `flash`, stopping at the first failure.
    ///
    /// Each step that runs emits one event to the sink; steps after a
    /// failure are skipped.
    pub fn run<B: QspiBus, C: Clock>(&mut self, flash: &mut Flash<'_, B, C>)
        -> core::result::Result<SelfTestReport, SelfTestFailure>
    {
        let cfg = self.config;
        log::info!("Self-test start at 0x{:08X}", cfg.address);

        let result = flash.reset().map(|()| flash.delay(cfg.settle));
        self.check(Step::Reset, result)?;

        let identity = self.check(Step::ReadIdentity, flash.read_identity())?;

        let result = flash.enable_32bit_addressing()
            .and_then(|()| flash.wait_while_busy(cfg.short_timeout));
        self.check(Step::EnableAddressing, result)?;

        let region = FlashRegion::subsector(cfg.address);
        let result = flash.erase_region(region)
            .and_then(|()| flash.wait_while_busy(cfg.erase_timeout));
        self.check(Step::Erase, result)?;

        let result = flash.read_region(region.start, region.length as usize)
            .and_then(|data| verify_erased(region.start, &data));
        self.check(Step::VerifyErase, result)?;

        let pattern: Vec<u8> = (0..PAGE_SIZE).map(cfg.pattern).collect();
        let result = flash.program_page(cfg.address, &pattern)
            .and_then(|()| flash.wait_while_busy(cfg.short_timeout));
        self.check(Step::Program, result)?;

        let result = flash.read_region(cfg.address, PAGE_SIZE)
            .and_then(|data| verify_readback(cfg.address, &pattern, &data));
        if let Err(Error::VerifyMismatch { .. }) = result {
            if let Ok(status) = flash.read_status() {
                if status.is_protected() {
                    log::warn!("Flash write protection appears to be enabled (BP=0x{:X}).",
                               status.get_block_protect());
                }
            }
        }
        self.check(Step::VerifyProgram, result)?;

        log::info!("Self-test passed");
        Ok(SelfTestReport { identity, region })
    }

    /// Report the outcome of `step` and convert a failure.
    fn check<T: Copy + StepValue>(&mut self, step: Step, result: Result<T>)
        -> core::result::Result<T, SelfTestFailure>
    {
        match result {
            Ok(value) => {
                self.sink.report(&StepEvent { step, outcome: value.outcome() });
                Ok(value)
            },
            Err(error) => {
                self.sink.report(&StepEvent { step, outcome: Outcome::Failed(&error) });
                Err(SelfTestFailure { step, error })
            },
        }
    }
}

/// Values produced by successful steps.
trait StepValue {
    fn outcome(self) -> Outcome<'static>;
}

impl StepValue for () {
    fn outcome(self) -> Outcome<'static> {
        Outcome::Passed
    }
}

impl StepValue for DeviceIdentity {
    fn outcome(self) -> Outcome<'static> {
        Outcome::Identified(self)
    }
}

/// Check every byte of `data`, read from `address`, is erased.
pub fn verify_erased(address: u32, data: &[u8]) -> Result<()> {
    match data.iter().position(|&b| b != ERASED_BYTE) {
        Some(offset) => {
            let observed = data[offset];
            let addr = address.wrapping_add(offset as u32);
            log::error!("Erase verify failed at 0x{:08X}: read 0x{:02X}", addr, observed);
            Err(Error::VerifyMismatch { address: addr, offset, expected: ERASED_BYTE, observed })
        },
        None => Ok(()),
    }
}

/// Verify data read back from `address` matches what was written.
///
/// Returns Err::VerifyMismatch at the first differing byte, or
/// Err::InvalidArgument if the two buffers differ in length.
pub fn verify_readback(address: u32, wrote: &[u8], read: &[u8]) -> Result<()> {
    if wrote.len() != read.len() {
        log::error!("Readback of {} bytes does not match {} bytes written",
                    read.len(), wrote.len());
        return Err(Error::InvalidArgument("readback length differs from data written"));
    }
    let mismatch = wrote.iter().zip(read).enumerate().find(|(_, (a, b))| a != b);
    match mismatch {
        Some((offset, (a, b))) => {
            let addr = address.wrapping_add(offset as u32);
            log::error!("Readback mismatch at 0x{:08X}: Wrote 0x{:02X}, read 0x{:02X}",
                        addr, a, b);
            Err(Error::VerifyMismatch { address: addr, offset, expected: *a, observed: *b })
        },
        None => Ok(()),
    }
}
