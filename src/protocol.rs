//! Modbus protocol definitions and message handling
//!
//! The application layer is identical across RTU, ASCII and TCP: a request
//! descriptor is rendered into a PDU, the framing layer wraps it into an ADU,
//! and the confirmation is validated against the request. This module owns
//! the descriptors and the per-function arithmetic; framing lives in
//! [`crate::frame`].

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};

/// Modbus server (slave/unit) identifier
pub type SlaveId = u8;

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    /// FC01 - read coils
    ReadCoils,
    /// FC02 - read discrete inputs
    ReadDiscreteInputs,
    /// FC03 - read holding registers
    ReadHoldingRegisters,
    /// FC04 - read input registers
    ReadInputRegisters,
    /// FC05 - write single coil
    WriteSingleCoil,
    /// FC06 - write single register
    WriteSingleRegister,
    /// FC07 - read exception status (serial line)
    ReadExceptionStatus,
    /// FC15 - write multiple coils
    WriteMultipleCoils,
    /// FC16 - write multiple registers
    WriteMultipleRegisters,
    /// FC17 - report server id (serial line)
    ReportServerId,
    /// FC22 - mask write register
    MaskWriteRegister,
    /// FC23 - write then read registers in one transaction
    WriteAndReadRegisters,
    /// FC43/0x0E - read device identification
    ReadDeviceId,
}

impl ModbusFunction {
    /// Wire function code
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::ReadExceptionStatus => FC_READ_EXCEPTION_STATUS,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
            Self::ReportServerId => FC_REPORT_SERVER_ID,
            Self::MaskWriteRegister => FC_MASK_WRITE_REGISTER,
            Self::WriteAndReadRegisters => FC_WRITE_AND_READ_REGISTERS,
            Self::ReadDeviceId => FC_READ_DEVICE_ID,
        }
    }

    /// Decode a wire function code; `None` for codes outside the supported set
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            FC_READ_COILS => Some(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Some(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Some(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Some(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Some(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Some(Self::WriteSingleRegister),
            FC_READ_EXCEPTION_STATUS => Some(Self::ReadExceptionStatus),
            FC_WRITE_MULTIPLE_COILS => Some(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Some(Self::WriteMultipleRegisters),
            FC_REPORT_SERVER_ID => Some(Self::ReportServerId),
            FC_MASK_WRITE_REGISTER => Some(Self::MaskWriteRegister),
            FC_WRITE_AND_READ_REGISTERS => Some(Self::WriteAndReadRegisters),
            FC_READ_DEVICE_ID => Some(Self::ReadDeviceId),
            _ => None,
        }
    }

    /// True for the four read functions whose replies carry a byte-count prefix
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Per-function quantity maximum from the specification, if the function
    /// carries a quantity at all
    pub fn max_quantity(self) -> Option<u16> {
        match self {
            Self::ReadCoils | Self::ReadDiscreteInputs => Some(MAX_READ_BITS),
            Self::ReadHoldingRegisters | Self::ReadInputRegisters => Some(MAX_READ_REGISTERS),
            Self::WriteSingleCoil | Self::WriteSingleRegister | Self::MaskWriteRegister => Some(1),
            Self::WriteMultipleCoils => Some(MAX_WRITE_BITS),
            Self::WriteMultipleRegisters => Some(MAX_WRITE_REGISTERS),
            Self::WriteAndReadRegisters => Some(MAX_WR_READ_REGISTERS),
            Self::ReadExceptionStatus | Self::ReportServerId | Self::ReadDeviceId => None,
        }
    }
}

/// Expected length of a confirmation PDU, derived from the request.
///
/// `Undefined` means the length cannot be predicted from the request alone
/// (the reply carries its own length prefix or object list); the receive
/// engine then falls back to its length-inference state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedLength {
    /// Exact PDU length in bytes
    Known(usize),
    /// Length only discoverable while receiving
    Undefined,
}

/// A Modbus request descriptor held while awaiting the confirmation
#[derive(Debug, Clone)]
pub struct ModbusRequest {
    /// Addressed server (slave id on serial, unit id on TCP)
    pub slave_id: SlaveId,
    /// Requested function
    pub function: ModbusFunction,
    /// Starting address (read address for FC23)
    pub address: u16,
    /// Element count (read count for FC23; coil value for FC05 is carried in `data`)
    pub quantity: u16,
    /// Function-specific payload, already in wire byte order
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Read request for FC01-04
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Render the request into a PDU
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                PduBuilder::build_read_request(self.function.to_u8(), self.address, self.quantity)
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                PduBuilder::new()
                    .function_code(self.function.to_u8())?
                    .address(self.address)?
                    .data(&self.data)
                    .map(|b| b.build())
            }
            ModbusFunction::ReadExceptionStatus => PduBuilder::build_read_exception_status(),
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                PduBuilder::new()
                    .function_code(self.function.to_u8())?
                    .address(self.address)?
                    .quantity(self.quantity)?
                    .byte(self.data.len() as u8)?
                    .data(&self.data)
                    .map(|b| b.build())
            }
            ModbusFunction::ReportServerId => PduBuilder::build_report_server_id(),
            ModbusFunction::MaskWriteRegister => {
                // Both masks already rendered into `data`
                PduBuilder::new()
                    .function_code(self.function.to_u8())?
                    .address(self.address)?
                    .data(&self.data)
                    .map(|b| b.build())
            }
            ModbusFunction::WriteAndReadRegisters => {
                // Write-part (address, quantity, byte count, values) in `data`
                PduBuilder::new()
                    .function_code(self.function.to_u8())?
                    .address(self.address)?
                    .quantity(self.quantity)?
                    .data(&self.data)
                    .map(|b| b.build())
            }
            ModbusFunction::ReadDeviceId => PduBuilder::new()
                .function_code(0x2B)?
                .data(&self.data)
                .map(|b| b.build()),
        }
    }

    /// Predict the confirmation PDU length from this request.
    ///
    /// The report-server-id reply carries an 8-bit length prefix and the
    /// device-identification reply an object list, so both are `Undefined`.
    pub fn expected_response_length(&self) -> ExpectedLength {
        let n = self.quantity as usize;
        match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                ExpectedLength::Known(2 + n.div_ceil(8))
            }
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => ExpectedLength::Known(2 + 2 * n),
            ModbusFunction::WriteAndReadRegisters => ExpectedLength::Known(2 + 2 * n),
            ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleCoils
            | ModbusFunction::WriteMultipleRegisters => ExpectedLength::Known(5),
            ModbusFunction::MaskWriteRegister => ExpectedLength::Known(7),
            ModbusFunction::ReadExceptionStatus => ExpectedLength::Known(2),
            ModbusFunction::ReportServerId | ModbusFunction::ReadDeviceId => {
                ExpectedLength::Undefined
            }
        }
    }
}

/// A decoded, checksum-verified confirmation or indication payload
#[derive(Debug, Clone)]
pub struct ModbusResponse {
    /// Server the frame came from (slave byte or MBAP unit id)
    pub slave_id: SlaveId,
    /// Raw function code, exception flag included
    pub function: u8,
    /// PDU bytes after the function code
    data: Vec<u8>,
}

impl ModbusResponse {
    /// Wrap a decoded PDU
    pub fn new(slave_id: SlaveId, function: u8, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
        }
    }

    /// Function-specific payload (after the function code)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True when the exception flag is set
    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Exception code byte, if this is an exception reply
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Parse a FC01/FC02 style payload: byte-count prefix then packed bits,
    /// LSB of the first byte being the first requested bit
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ModbusError::bad_data("Empty bit response"))? as usize;

        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::bad_data(format!(
                "Bit response truncated: {} data bytes, byte count {}",
                self.data.len() - 1,
                byte_count
            )));
        }

        let mut bits = Vec::with_capacity(byte_count * 8);
        for &byte in &self.data[1..1 + byte_count] {
            for bit in 0..8 {
                bits.push(byte & (1 << bit) != 0);
            }
        }
        Ok(bits)
    }

    /// Parse a FC03/FC04/FC23 style payload: byte-count prefix then
    /// big-endian 16-bit registers
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ModbusError::bad_data("Empty register response"))? as usize;

        if byte_count % 2 != 0 || self.data.len() < 1 + byte_count {
            return Err(ModbusError::bad_data(format!(
                "Register response malformed: {} data bytes, byte count {}",
                self.data.len() - 1,
                byte_count
            )));
        }

        let mut registers = Vec::with_capacity(byte_count / 2);
        for pair in self.data[1..1 + byte_count].chunks_exact(2) {
            registers.push(((pair[0] as u16) << 8) | pair[1] as u16);
        }
        Ok(registers)
    }

    /// Big-endian u16 at an offset into the payload
    pub fn u16_at(&self, offset: usize) -> ModbusResult<u16> {
        if offset + 2 <= self.data.len() {
            Ok(((self.data[offset] as u16) << 8) | self.data[offset + 1] as u16)
        } else {
            Err(ModbusError::bad_data("Response too short"))
        }
    }
}
