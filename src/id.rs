/// Store the identification bytes read off a QSPI NOR flash with the 0x9F command.
///
/// The bytes are kept exactly as returned by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

impl DeviceIdentity {
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        DeviceIdentity { manufacturer: bytes[0], memory_type: bytes[1], capacity: bytes[2] }
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.manufacturer, self.memory_type, self.capacity]
    }

    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "std")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer & 0x7F).get() {
            // MT25Q parts still report the ST/Numonyx code they were designed under.
            Some(mfn) if mfn == "STMicroelectronics" => Some("Micron/STMicroelectronics"),
            other => other,
        }
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Memory type 0x{:02X}, Capacity 0x{:02X}",
               self.manufacturer, mfn, self.memory_type, self.capacity)
    }
}
