//! Simulated MT25Q device for tests.
//!
//! Time is virtual: every `send()` advances the shared clock by `latency_ms`,
//! and erase/program keep WIP set for a fixed number of milliseconds.

use std::cell::Cell;
use std::convert::TryFrom;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::bus::{Clock, QspiBus, TransportTimeout};
use crate::command::{Command, DataDirection};
use crate::{Instruction, ERASE_SIZE, PAGE_SIZE};

pub struct SimClock {
    now: Rc<Cell<u32>>,
}

impl Clock for SimClock {
    fn now_ms(&mut self) -> u32 {
        self.now.get()
    }

    fn delay(&mut self, dur: Duration) {
        self.now.set(self.now.get().wrapping_add(dur.as_millis() as u32));
    }
}

pub struct SimFlash {
    now: Rc<Cell<u32>>,
    pub memory: Vec<u8>,
    pub identity: [u8; 3],
    pub latency_ms: u32,
    pub erase_ms: u32,
    pub program_ms: u32,
    /// When false, WriteEnable is ignored and WEL never sets.
    pub wel_latches: bool,
    /// When true, WIP reads as set forever.
    pub stuck_busy: bool,
    /// When true, BP0 reads as set and erase/program are ignored.
    pub protected: bool,
    /// Fail `send()` with a transport fault for this instruction.
    pub fail_on: Option<Instruction>,
    /// Fail `send()` with a transport timeout for this instruction.
    pub stall_on: Option<Instruction>,
    /// Every instruction passed to `send()`, in order.
    pub issued: Vec<u8>,
    pub four_byte: bool,
    wel: bool,
    reset_enabled: bool,
    busy_start: u32,
    busy_ms: u32,
    pending: Option<Command>,
}

impl SimFlash {
    /// 64kB device filled with zeros, plus a clock sharing its time base.
    pub fn new() -> (SimFlash, SimClock) {
        let now = Rc::new(Cell::new(1000));
        let sim = SimFlash {
            now: now.clone(),
            memory: vec![0x00; 0x1_0000],
            identity: [0x20, 0xBA, 0x20],
            latency_ms: 1,
            erase_ms: 40,
            program_ms: 2,
            wel_latches: true,
            stuck_busy: false,
            protected: false,
            fail_on: None,
            stall_on: None,
            issued: Vec::new(),
            four_byte: false,
            wel: false,
            reset_enabled: false,
            busy_start: 0,
            busy_ms: 0,
            pending: None,
        };
        (sim, SimClock { now })
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }

    /// Hold WIP set for `ms` from now.
    pub fn start_busy(&mut self, ms: u32) {
        self.busy_start = self.now();
        self.busy_ms = ms;
    }

    fn wip(&self) -> bool {
        self.stuck_busy || self.now().wrapping_sub(self.busy_start) < self.busy_ms
    }

    fn status(&self) -> u8 {
        (self.wip() as u8) | ((self.wel as u8) << 1) | ((self.protected as u8) << 2)
    }

    /// A mutating command is only accepted with WEL set and no write in progress.
    fn accept_write(&mut self) -> bool {
        let accepted = self.wel && !self.wip();
        self.wel = false;
        accepted
    }

    fn index(&self, address: u32) -> usize {
        address as usize % self.memory.len()
    }

    fn run_simple(&mut self, command: &Command) -> anyhow::Result<()> {
        let inst = Instruction::try_from(command.instruction())
            .map_err(|_| anyhow!("unsupported instruction 0x{:02X}", command.instruction()))?;
        match inst {
            Instruction::ResetEnable => self.reset_enabled = true,
            Instruction::ResetMemory => {
                if self.reset_enabled {
                    self.wel = false;
                    self.four_byte = false;
                    self.busy_ms = 0;
                }
            },
            Instruction::WriteEnable => {
                if self.wel_latches && !self.wip() {
                    self.wel = true;
                }
            },
            Instruction::Enable4ByteAddress => {
                if self.accept_write() {
                    self.four_byte = true;
                }
            },
            Instruction::SubsectorErase4K4B => {
                if self.accept_write() && !self.protected {
                    let base = self.index(command.address().unwrap_or(0)) & !(ERASE_SIZE - 1);
                    for byte in &mut self.memory[base..base + ERASE_SIZE] {
                        *byte = 0xFF;
                    }
                    let ms = self.erase_ms;
                    self.start_busy(ms);
                }
            },
            other => bail!("{:?} requires a data phase", other),
        }
        if inst != Instruction::ResetEnable {
            self.reset_enabled = false;
        }
        Ok(())
    }
}

impl QspiBus for SimFlash {
    fn send(&mut self, command: &Command, timeout: Duration) -> anyhow::Result<()> {
        self.now.set(self.now.get().wrapping_add(self.latency_ms));
        self.issued.push(command.instruction());
        let inst = Instruction::try_from(command.instruction()).ok();
        if inst.is_some() && inst == self.fail_on {
            bail!("injected fault on 0x{:02X}", command.instruction());
        }
        if inst.is_some() && inst == self.stall_on {
            return Err(TransportTimeout(timeout).into());
        }
        match command.data_direction() {
            DataDirection::None => self.run_simple(command),
            _ => {
                self.pending = Some(*command);
                Ok(())
            },
        }
    }

    fn transmit(&mut self, data: &[u8], _timeout: Duration) -> anyhow::Result<()> {
        let command = self.pending.take().ok_or_else(|| anyhow!("transmit without command"))?;
        if command.instruction() != u8::from(Instruction::PageProgram4B) {
            bail!("unexpected write phase for 0x{:02X}", command.instruction());
        }
        if self.accept_write() && !self.protected {
            // Programming wraps within the page and can only clear bits.
            let address = self.index(command.address().unwrap_or(0));
            let page = address & !(PAGE_SIZE - 1);
            for (i, byte) in data.iter().enumerate() {
                let offset = (address - page + i) % PAGE_SIZE;
                self.memory[page + offset] &= *byte;
            }
            let ms = self.program_ms;
            self.start_busy(ms);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> anyhow::Result<()> {
        let command = self.pending.take().ok_or_else(|| anyhow!("receive without command"))?;
        match Instruction::try_from(command.instruction()) {
            Ok(Instruction::ReadId) => {
                for (dst, src) in buf.iter_mut().zip(self.identity.iter()) {
                    *dst = *src;
                }
            },
            Ok(Instruction::ReadStatusRegister) => {
                let status = self.status();
                for dst in buf.iter_mut() {
                    *dst = status;
                }
            },
            Ok(Instruction::ReadData4B) => {
                let start = self.index(command.address().unwrap_or(0));
                for (i, dst) in buf.iter_mut().enumerate() {
                    *dst = self.memory[(start + i) % self.memory.len()];
                }
            },
            _ => bail!("unexpected read phase for 0x{:02X}", command.instruction()),
        }
        Ok(())
    }
}
