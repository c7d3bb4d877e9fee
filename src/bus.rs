//! Bus transaction layer.
//!
//! The host environment supplies a [`QspiBus`] for the physical transfers and
//! a [`Clock`] for deadlines. [`execute`] runs one complete command on the bus.

use alloc::vec::Vec;
use core::convert::TryFrom;
use core::time::Duration;

use crate::command::{Command, DataDirection};
use crate::{AnyhowResult, Error, Result};

/// Trait for objects which provide access to a QSPI command bus.
///
/// A transaction is one call to `send()`, followed by one call to `transmit()`
/// or `receive()` when the command has a data phase. Each call must complete
/// or fail within `timeout`. Implementations report an exceeded timeout by
/// returning [`TransportTimeout`] (or `Error::BusTimeout` without `std`);
/// every other error is treated as a bus fault.
pub trait QspiBus {
    /// Send the instruction, address and dummy phases of `command`.
    fn send(&mut self, command: &Command, timeout: Duration) -> AnyhowResult<()>;

    /// Transmit the data phase of the last command sent.
    fn transmit(&mut self, data: &[u8], timeout: Duration) -> AnyhowResult<()>;

    /// Receive the data phase of the last command sent into `buf`.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> AnyhowResult<()>;
}

/// Monotonic millisecond time source used for all deadlines.
pub trait Clock {
    /// Current tick in milliseconds. The counter is allowed to wrap.
    fn now_ms(&mut self) -> u32;

    /// Block for at least `dur`.
    ///
    /// The default implementation spins on `now_ms()`.
    fn delay(&mut self, dur: Duration) {
        let deadline = Deadline::start(self, dur);
        while !deadline.expired(self) {}
    }
}

impl<F: FnMut() -> u32> Clock for F {
    fn now_ms(&mut self) -> u32 {
        self()
    }
}

/// Clock backed by `std::time::Instant`, measuring from its creation.
#[cfg(feature = "std")]
#[derive(Copy, Clone, Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: std::time::Instant::now() }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now_ms(&mut self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    fn delay(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// A wall-clock deadline measured from the moment it was started.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn start<C: Clock + ?Sized>(clock: &mut C, timeout: Duration) -> Self {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        Deadline { start: clock.now_ms(), timeout_ms }
    }

    /// Milliseconds since the deadline was started.
    pub fn elapsed_ms<C: Clock + ?Sized>(&self, clock: &mut C) -> u32 {
        clock.now_ms().wrapping_sub(self.start)
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &mut C) -> bool {
        self.elapsed_ms(clock) >= self.timeout_ms
    }
}

/// Error returned by bus implementations when a transfer exceeds its timeout.
#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
#[error("QSPI transfer did not complete within {0:?}")]
pub struct TransportTimeout(pub Duration);

#[cfg(feature = "std")]
fn bus_error(err: anyhow::Error) -> Error {
    match err.downcast_ref::<TransportTimeout>() {
        Some(TransportTimeout(timeout)) => Error::BusTimeout { timeout: *timeout },
        None => Error::Bus(err),
    }
}

#[cfg(not(feature = "std"))]
fn bus_error(err: Error) -> Error {
    err
}

/// Execute `command` on `bus`.
///
/// For commands with a write phase, `payload` must hold exactly the command's
/// data length. For commands with a read phase, the received bytes are returned.
/// No retries are attempted.
pub fn execute<B: QspiBus + ?Sized>(
    bus: &mut B,
    command: &Command,
    payload: Option<&[u8]>,
    timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    let data: &[u8] = match (command.data_direction(), payload) {
        (DataDirection::Write, Some(data)) if data.len() == command.data_length() => data,
        (DataDirection::Write, _) => {
            log::error!("Write payload does not match command data length {}",
                        command.data_length());
            return Err(Error::InvalidArgument("write payload must match command data length"));
        },
        (_, Some(_)) => {
            log::error!("Payload supplied for command 0x{:02X} without write phase",
                        command.instruction());
            return Err(Error::InvalidArgument("payload supplied for command without write phase"));
        },
        (_, None) => &[],
    };

    log::trace!("QSPI send: {:02X?}", command);
    bus.send(command, timeout).map_err(bus_error)?;

    match command.data_direction() {
        DataDirection::None => Ok(None),
        DataDirection::Write => {
            log::trace!("QSPI transmit: {:02X?}", data);
            bus.transmit(data, timeout).map_err(bus_error)?;
            Ok(None)
        },
        DataDirection::Read => {
            let mut buf = alloc::vec![0u8; command.data_length()];
            bus.receive(&mut buf, timeout).map_err(bus_error)?;
            log::trace!("QSPI receive: {:02X?}", &buf);
            Ok(Some(buf))
        },
    }
}
