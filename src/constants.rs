//! Modbus protocol constants based on the official specification
//!
//! These constants are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from the RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint
//! - Per-framing ADU maxima follow from the header/trailer geometry below

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// This is the fundamental limit inherited from the RS485 implementation:
/// RS485 ADU (256 bytes) - Server Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum function-specific data length inside a PDU (PDU minus function code)
pub const MAX_PDU_DATA: usize = MAX_PDU_SIZE - 1;

/// RTU header: server address only
pub const RTU_HEADER_LEN: usize = 1;

/// RTU trailer: CRC-16, low byte first on the wire
pub const RTU_CHECKSUM_LEN: usize = 2;

/// Maximum RTU ADU: address(1) + PDU(253) + CRC(2)
pub const MAX_RTU_ADU: usize = RTU_HEADER_LEN + MAX_PDU_SIZE + RTU_CHECKSUM_LEN;

/// ASCII binary image header: server address only (before hex expansion)
pub const ASCII_HEADER_LEN: usize = 1;

/// ASCII binary image trailer: LRC byte (before hex expansion)
pub const ASCII_CHECKSUM_LEN: usize = 1;

/// Maximum ASCII wire frame: ':' + 2 x (address + PDU + LRC) + CR + LF
pub const MAX_ASCII_ADU: usize = 1 + 2 * (ASCII_HEADER_LEN + MAX_PDU_SIZE + ASCII_CHECKSUM_LEN) + 2;

/// Full MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum TCP ADU: MBAP(7) + PDU(253)
pub const MAX_TCP_ADU: usize = MBAP_HEADER_LEN + MAX_PDU_SIZE;

// ============================================================================
// Addressing
// ============================================================================

/// Serial broadcast address; every server applies the request, none replies
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest server id allowed by the specification
pub const MAX_SERVER_ID: u8 = 247;

/// Highest server id accepted under the `MAX_SLAVE` quirk
pub const MAX_SERVER_ID_RELAXED: u8 = 255;

/// MBAP unit id meaning "any server" on a direct TCP link
pub const TCP_UNIT_ID_ANY: u8 = 0xFF;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: 1 (function) + 1 (byte count) + N x 2 <= 253, so N <= 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: 1 + 2 + 2 + 1 + N x 2 <= 253, so N <= 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum read quantity for FC23 (Write And Read Registers)
pub const MAX_WR_READ_REGISTERS: u16 = 125;

/// Maximum write quantity for FC23 (Write And Read Registers)
///
/// Request PDU: 1 + 2 + 2 + 2 + 2 + 1 + N x 2 <= 253, so N <= 121
pub const MAX_WR_WRITE_REGISTERS: u16 = 121;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of bits for FC01/FC02 (Read Coils/Discrete Inputs)
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum number of bits for FC15 (Write Multiple Coils)
pub const MAX_WRITE_BITS: u16 = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Read Exception Status (FC07, serial line)
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Report Server ID (FC17, serial line)
pub const FC_REPORT_SERVER_ID: u8 = 0x11;

/// Mask Write Register (FC22)
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Write And Read Registers (FC23)
pub const FC_WRITE_AND_READ_REGISTERS: u8 = 0x17;

/// Encapsulated Interface Transport (FC43)
pub const FC_READ_DEVICE_ID: u8 = 0x2B;

/// MEI type for Read Device Identification under FC43
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Exception flag ORed into the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Value written on the wire for a coil driven ON by FC05
pub const COIL_ON: u16 = 0xFF00;

/// Value written on the wire for a coil driven OFF by FC05
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Timeouts
// ============================================================================

/// Default response timeout (first byte of a confirmation), milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;

/// Default inter-character timeout within a frame, milliseconds
pub const DEFAULT_BYTE_TIMEOUT_MS: u64 = 500;

/// Wait applied by a server listening for an indication, seconds
pub const INDICATION_TIMEOUT_SECS: u64 = 60;
