/// Width of the address phase of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressWidth {
    None,
    ThirtyTwoBit,
}

/// Direction of the data phase of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
}

/// A single QSPI command: instruction, optional address and optional data phase.
///
/// Commands can only be built through the constructors below, which guarantee
/// that an address is present exactly when the address width is not `None`,
/// and that the data length is non-zero exactly when there is a data phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Command {
    instruction: u8,
    address: Option<u32>,
    address_width: AddressWidth,
    data_direction: DataDirection,
    data_length: usize,
    dummy_cycles: u8,
}

impl Command {
    /// Instruction only, no address and no data.
    pub fn simple<C: Into<u8>>(instruction: C) -> Self {
        Command {
            instruction: instruction.into(),
            address: None,
            address_width: AddressWidth::None,
            data_direction: DataDirection::None,
            data_length: 0,
            dummy_cycles: 0,
        }
    }

    /// Instruction followed by `length` bytes read from the device, no address.
    pub fn read<C: Into<u8>>(instruction: C, length: usize) -> Self {
        Command::simple(instruction).with_data(DataDirection::Read, length)
    }

    /// Instruction and 32-bit address, no data.
    pub fn addressed<C: Into<u8>>(instruction: C, address: u32) -> Self {
        Command {
            address: Some(address),
            address_width: AddressWidth::ThirtyTwoBit,
            ..Command::simple(instruction)
        }
    }

    /// Instruction and 32-bit address followed by `length` bytes read from the device.
    pub fn read_4b<C: Into<u8>>(instruction: C, address: u32, length: usize) -> Self {
        Command::addressed(instruction, address).with_data(DataDirection::Read, length)
    }

    /// Instruction and 32-bit address followed by `length` bytes written to the device.
    pub fn write_4b<C: Into<u8>>(instruction: C, address: u32, length: usize) -> Self {
        Command::addressed(instruction, address).with_data(DataDirection::Write, length)
    }

    /// Insert `cycles` dummy clock cycles between the address and data phases.
    pub fn with_dummy_cycles(mut self, cycles: u8) -> Self {
        self.dummy_cycles = cycles;
        self
    }

    fn with_data(mut self, direction: DataDirection, length: usize) -> Self {
        if length == 0 {
            self.data_direction = DataDirection::None;
            self.data_length = 0;
        } else {
            self.data_direction = direction;
            self.data_length = length;
        }
        self
    }

    pub fn instruction(&self) -> u8 {
        self.instruction
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    pub fn address_width(&self) -> AddressWidth {
        self.address_width
    }

    pub fn data_direction(&self) -> DataDirection {
        self.data_direction
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn dummy_cycles(&self) -> u8 {
        self.dummy_cycles
    }
}
