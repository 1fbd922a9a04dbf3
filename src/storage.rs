//! Storage backends for the server role
//!
//! The dispatcher resolves every request against a [`StorageBackend`]: four
//! independently addressed spaces (coils, discrete inputs, holding registers,
//! input registers) plus the serial-line status byte. A backend signals
//! refusal by returning a Modbus exception code, which the dispatcher emits
//! verbatim.
//!
//! [`ModbusMapping`] is the stock backend: four plain arrays, each with its
//! own start address and length. User backends (register banks over a bus,
//! database-backed spaces, computed values) implement the same trait.

use crate::error::ExceptionCode;
use crate::protocol::SlaveId;

/// Pack bits into bytes, 8 per byte, LSB first within each byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits from packed bytes, LSB first within each byte
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|byte| byte & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Polymorphic contract between the dispatcher and an address space.
///
/// Reads return the requested values; a shorter vector is treated by the
/// dispatcher as a server-device-failure. Writes apply the whole range or
/// return an exception. The dispatcher serializes calls per connection, so
/// implementations need no internal locking.
pub trait StorageBackend: Send {
    /// Whether this instance answers for `slave_id` *in addition to* the
    /// session's own server id (multi-drop RTU installations serving several
    /// ids from one process). The configured id and the broadcast address
    /// are always accepted.
    fn accept_slave(&self, _slave_id: SlaveId) -> bool {
        false
    }

    /// Status byte served for read-exception-status (FC07)
    fn exception_status(&self) -> Result<u8, ExceptionCode> {
        Ok(0)
    }

    /// Read `quantity` coils starting at `address`
    fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode>;

    /// Read `quantity` discrete inputs starting at `address`
    fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode>;

    /// Read `quantity` holding registers starting at `address`
    fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode>;

    /// Read `quantity` input registers starting at `address`
    fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode>;

    /// Drive a single coil
    fn write_coil(&mut self, address: u16, value: bool) -> Result<(), ExceptionCode>;

    /// Write a single holding register
    fn write_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode>;

    /// Drive a run of coils
    fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ExceptionCode>;

    /// Write a run of holding registers
    fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ExceptionCode>;
}

/// Map a requested range onto an array with a start offset.
///
/// The invariant is strict closure: the whole of
/// `[address, address + quantity)` must lie inside `[start, start + len)`.
fn map_range(
    start: u16,
    len: usize,
    address: u16,
    quantity: usize,
) -> Result<std::ops::Range<usize>, ExceptionCode> {
    let offset = (address as usize)
        .checked_sub(start as usize)
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    let end = offset
        .checked_add(quantity)
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    if end > len {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(offset..end)
}

/// The default register-backed storage: four independent arrays
#[derive(Debug, Clone)]
pub struct ModbusMapping {
    start_coils: u16,
    coils: Vec<bool>,
    start_discrete_inputs: u16,
    discrete_inputs: Vec<bool>,
    start_holding_registers: u16,
    holding_registers: Vec<u16>,
    start_input_registers: u16,
    input_registers: Vec<u16>,
    exception_status: u8,
}

impl ModbusMapping {
    /// Allocate four zeroed spaces starting at address 0
    pub fn new(
        nb_coils: u16,
        nb_discrete_inputs: u16,
        nb_holding_registers: u16,
        nb_input_registers: u16,
    ) -> Self {
        Self::with_start_addresses(
            0,
            nb_coils,
            0,
            nb_discrete_inputs,
            0,
            nb_holding_registers,
            0,
            nb_input_registers,
        )
    }

    /// Allocate four zeroed spaces with explicit start addresses
    #[allow(clippy::too_many_arguments)]
    pub fn with_start_addresses(
        start_coils: u16,
        nb_coils: u16,
        start_discrete_inputs: u16,
        nb_discrete_inputs: u16,
        start_holding_registers: u16,
        nb_holding_registers: u16,
        start_input_registers: u16,
        nb_input_registers: u16,
    ) -> Self {
        Self {
            start_coils,
            coils: vec![false; nb_coils as usize],
            start_discrete_inputs,
            discrete_inputs: vec![false; nb_discrete_inputs as usize],
            start_holding_registers,
            holding_registers: vec![0; nb_holding_registers as usize],
            start_input_registers,
            input_registers: vec![0; nb_input_registers as usize],
            exception_status: 0,
        }
    }

    /// Coil values, mutable (server-local initialization)
    pub fn coils_mut(&mut self) -> &mut [bool] {
        &mut self.coils
    }

    /// Discrete input values, mutable (set by the process, read by clients)
    pub fn discrete_inputs_mut(&mut self) -> &mut [bool] {
        &mut self.discrete_inputs
    }

    /// Holding register values, mutable
    pub fn holding_registers_mut(&mut self) -> &mut [u16] {
        &mut self.holding_registers
    }

    /// Input register values, mutable
    pub fn input_registers_mut(&mut self) -> &mut [u16] {
        &mut self.input_registers
    }

    /// Set the FC07 status byte
    pub fn set_exception_status(&mut self, status: u8) {
        self.exception_status = status;
    }
}

impl StorageBackend for ModbusMapping {
    fn exception_status(&self) -> Result<u8, ExceptionCode> {
        Ok(self.exception_status)
    }

    fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        let range = map_range(self.start_coils, self.coils.len(), address, quantity as usize)?;
        Ok(self.coils[range].to_vec())
    }

    fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        let range = map_range(
            self.start_discrete_inputs,
            self.discrete_inputs.len(),
            address,
            quantity as usize,
        )?;
        Ok(self.discrete_inputs[range].to_vec())
    }

    fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        let range = map_range(
            self.start_holding_registers,
            self.holding_registers.len(),
            address,
            quantity as usize,
        )?;
        Ok(self.holding_registers[range].to_vec())
    }

    fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        let range = map_range(
            self.start_input_registers,
            self.input_registers.len(),
            address,
            quantity as usize,
        )?;
        Ok(self.input_registers[range].to_vec())
    }

    fn write_coil(&mut self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        let range = map_range(self.start_coils, self.coils.len(), address, 1)?;
        self.coils[range.start] = value;
        Ok(())
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        let range = map_range(
            self.start_holding_registers,
            self.holding_registers.len(),
            address,
            1,
        )?;
        self.holding_registers[range.start] = value;
        Ok(())
    }

    fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        let range = map_range(self.start_coils, self.coils.len(), address, values.len())?;
        self.coils[range].copy_from_slice(values);
        Ok(())
    }

    fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let range = map_range(
            self.start_holding_registers,
            self.holding_registers.len(),
            address,
            values.len(),
        )?;
        self.holding_registers[range].copy_from_slice(values);
        Ok(())
    }
}
