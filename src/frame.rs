//! Frame codecs for the RTU, ASCII and TCP framings
//!
//! Every ADU decomposes into header + PDU + trailer:
//!
//! | Framing | Header | Trailer | Max ADU |
//! |---------|--------|---------|---------|
//! | RTU | address(1) | CRC-16(2), low byte first | 256 |
//! | ASCII | ':' + hex(address) | hex(LRC) + CRLF | 513 |
//! | TCP | MBAP: TID(2) + proto(2) + length(2) + unit(1) | none | 260 |
//!
//! RTU-over-TCP reuses the RTU codec on a stream transport; RTU-over-HID
//! drops the CRC because the report layer already delimits and protects
//! frames.
//!
//! The codec converts between wire bytes and [`AduParts`] and never touches
//! the transport; the receive engine hands it complete frames.

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::*;
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::protocol::ExpectedLength;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over a byte slice (poly 0xA001 reflected, init 0xFFFF)
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// LRC: two's complement of the 8-bit sum, so that summing all protected
/// bytes plus the LRC itself yields zero
#[inline]
pub fn lrc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Wire framing selector for the fixed set of built-in backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Serial RTU: binary with CRC-16 trailer
    Rtu,
    /// Serial ASCII: colon-framed uppercase hex with LRC
    Ascii,
    /// TCP with MBAP header, no checksum
    Tcp,
    /// RTU image inside HID reports: no CRC, the report layer delimits
    RtuHid,
}

/// A decoded, integrity-checked frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AduParts {
    /// Transaction id echoed between request and response (TCP only)
    pub tid: Option<u16>,
    /// Server address (slave byte or MBAP unit id)
    pub slave_id: u8,
    /// Function code plus function-specific data
    pub pdu: Vec<u8>,
}

/// Per-session framing state: format plus the TCP transaction counter.
///
/// The TID counter lives here rather than in a process-wide static so two
/// TCP sessions in one process get independent TID streams.
#[derive(Debug, Clone)]
pub struct Framing {
    format: FrameFormat,
    next_tid: u16,
}

impl Framing {
    /// Create framing state for a backend
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            next_tid: 0,
        }
    }

    /// The wire format in use
    #[inline]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Bytes preceding the function code in the binary frame image.
    ///
    /// For ASCII this counts decoded bytes, not wire characters.
    #[inline]
    pub fn header_len(&self) -> usize {
        match self.format {
            FrameFormat::Rtu | FrameFormat::RtuHid => RTU_HEADER_LEN,
            FrameFormat::Ascii => ASCII_HEADER_LEN,
            FrameFormat::Tcp => MBAP_HEADER_LEN,
        }
    }

    /// Trailer length in the binary frame image
    #[inline]
    pub fn checksum_len(&self) -> usize {
        match self.format {
            FrameFormat::Rtu => RTU_CHECKSUM_LEN,
            FrameFormat::Ascii => ASCII_CHECKSUM_LEN,
            FrameFormat::Tcp | FrameFormat::RtuHid => 0,
        }
    }

    /// Maximum ADU length in wire bytes
    #[inline]
    pub fn max_adu_len(&self) -> usize {
        match self.format {
            FrameFormat::Rtu | FrameFormat::RtuHid => MAX_RTU_ADU,
            FrameFormat::Ascii => MAX_ASCII_ADU,
            FrameFormat::Tcp => MAX_TCP_ADU,
        }
    }

    /// Take the next transaction id (TCP): monotone, wrapping at 2^16
    fn take_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    /// Transaction id the next request will carry (TCP)
    #[inline]
    pub fn peek_tid(&self) -> u16 {
        self.next_tid
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Wrap a request PDU into a wire ADU.
    ///
    /// For TCP this consumes a transaction id; the id used is returned so the
    /// exchange can correlate the confirmation.
    pub fn encode_request(&mut self, slave_id: u8, pdu: &[u8]) -> ModbusResult<(Vec<u8>, Option<u16>)> {
        match self.format {
            FrameFormat::Tcp => {
                let tid = self.take_tid();
                Ok((self.wrap_tcp(tid, slave_id, pdu), Some(tid)))
            }
            _ => Ok((self.wrap_serial(slave_id, pdu)?, None)),
        }
    }

    /// Wrap a response PDU, echoing the indication's transaction id
    pub fn encode_response(&self, slave_id: u8, tid: Option<u16>, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        match self.format {
            FrameFormat::Tcp => Ok(self.wrap_tcp(tid.unwrap_or(0), slave_id, pdu)),
            _ => self.wrap_serial(slave_id, pdu),
        }
    }

    /// Build an exception reply: function | 0x80 followed by the code byte
    pub fn encode_exception(
        &self,
        slave_id: u8,
        tid: Option<u16>,
        function: u8,
        code: ExceptionCode,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = [function | EXCEPTION_FLAG, code.to_u8()];
        self.encode_response(slave_id, tid, &pdu)
    }

    fn wrap_tcp(&self, tid: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        adu.extend_from_slice(&tid.to_be_bytes());
        adu.extend_from_slice(&0u16.to_be_bytes());
        adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        adu.push(unit_id);
        adu.extend_from_slice(pdu);
        adu
    }

    fn wrap_serial(&self, slave_id: u8, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        match self.format {
            FrameFormat::Rtu => {
                let mut adu = Vec::with_capacity(1 + pdu.len() + 2);
                adu.push(slave_id);
                adu.extend_from_slice(pdu);
                let crc = crc16(&adu);
                // Modbus convention: CRC low byte first on the wire
                adu.push((crc & 0xFF) as u8);
                adu.push((crc >> 8) as u8);
                Ok(adu)
            }
            FrameFormat::RtuHid => {
                let mut adu = Vec::with_capacity(1 + pdu.len());
                adu.push(slave_id);
                adu.extend_from_slice(pdu);
                Ok(adu)
            }
            FrameFormat::Ascii => {
                let mut raw = Vec::with_capacity(1 + pdu.len() + 1);
                raw.push(slave_id);
                raw.extend_from_slice(pdu);
                raw.push(lrc8(&raw));

                let mut adu = Vec::with_capacity(1 + raw.len() * 2 + 2);
                adu.push(b':');
                adu.extend_from_slice(hex::encode_upper(&raw).as_bytes());
                adu.extend_from_slice(b"\r\n");
                Ok(adu)
            }
            FrameFormat::Tcp => unreachable!("TCP frames are built by wrap_tcp"),
        }
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Verify a complete wire frame and split it into its parts.
    ///
    /// RTU recomputes the CRC, ASCII re-derives the LRC over the decoded
    /// bytes, TCP validates the MBAP length against the received frame.
    pub fn decode(&self, adu: &[u8]) -> ModbusResult<AduParts> {
        match self.format {
            FrameFormat::Rtu => {
                if adu.len() < RTU_HEADER_LEN + 1 + RTU_CHECKSUM_LEN {
                    return Err(ModbusError::protocol(format!(
                        "RTU frame too short: {} bytes",
                        adu.len()
                    )));
                }
                let payload = &adu[..adu.len() - 2];
                let computed = crc16(payload);
                let received =
                    ((adu[adu.len() - 1] as u16) << 8) | adu[adu.len() - 2] as u16;
                if computed != received {
                    return Err(ModbusError::BadChecksum { computed, received });
                }
                Ok(AduParts {
                    tid: None,
                    slave_id: adu[0],
                    pdu: payload[1..].to_vec(),
                })
            }
            FrameFormat::RtuHid => {
                if adu.len() < 2 {
                    return Err(ModbusError::protocol("HID frame too short"));
                }
                Ok(AduParts {
                    tid: None,
                    slave_id: adu[0],
                    pdu: adu[1..].to_vec(),
                })
            }
            FrameFormat::Ascii => {
                let body = adu
                    .strip_prefix(b":")
                    .ok_or_else(|| ModbusError::protocol("ASCII frame missing leading colon"))?;
                let body = body
                    .strip_suffix(b"\r\n")
                    .ok_or_else(|| ModbusError::protocol("ASCII frame missing CRLF"))?;
                let raw = hex::decode(body).map_err(|e| {
                    ModbusError::protocol(format!("ASCII frame has invalid hex: {}", e))
                })?;
                if raw.len() < 3 {
                    return Err(ModbusError::protocol("ASCII frame too short"));
                }
                // Sum of all decoded bytes including the LRC must be zero
                let computed = lrc8(&raw[..raw.len() - 1]);
                let received = raw[raw.len() - 1];
                if computed != received {
                    return Err(ModbusError::BadChecksum {
                        computed: computed as u16,
                        received: received as u16,
                    });
                }
                Ok(AduParts {
                    tid: None,
                    slave_id: raw[0],
                    pdu: raw[1..raw.len() - 1].to_vec(),
                })
            }
            FrameFormat::Tcp => {
                if adu.len() < MBAP_HEADER_LEN + 1 {
                    return Err(ModbusError::protocol(format!(
                        "TCP frame too short: {} bytes",
                        adu.len()
                    )));
                }
                let tid = ((adu[0] as u16) << 8) | adu[1] as u16;
                let protocol_id = ((adu[2] as u16) << 8) | adu[3] as u16;
                let length = (((adu[4] as u16) << 8) | adu[5] as u16) as usize;
                if protocol_id != 0 {
                    return Err(ModbusError::protocol(format!(
                        "MBAP protocol id {} is not Modbus",
                        protocol_id
                    )));
                }
                if length < 2 || length > MAX_MBAP_LENGTH || length != adu.len() - 6 {
                    return Err(ModbusError::protocol(format!(
                        "MBAP length {} inconsistent with frame of {} bytes",
                        length,
                        adu.len()
                    )));
                }
                Ok(AduParts {
                    tid: Some(tid),
                    slave_id: adu[6],
                    pdu: adu[7..].to_vec(),
                })
            }
        }
    }

    /// Translate an expected PDU length into an expected wire-frame length.
    ///
    /// Fails with "too many data" when the prediction exceeds the framing's
    /// ADU maximum, before any receive is attempted.
    pub fn expected_adu_len(&self, expected: ExpectedLength) -> ModbusResult<ExpectedLength> {
        let pdu_len = match expected {
            ExpectedLength::Undefined => return Ok(ExpectedLength::Undefined),
            ExpectedLength::Known(n) => n,
        };
        let wire_len = match self.format {
            FrameFormat::Rtu => RTU_HEADER_LEN + pdu_len + RTU_CHECKSUM_LEN,
            FrameFormat::RtuHid => RTU_HEADER_LEN + pdu_len,
            FrameFormat::Ascii => 1 + 2 * (ASCII_HEADER_LEN + pdu_len + ASCII_CHECKSUM_LEN) + 2,
            FrameFormat::Tcp => MBAP_HEADER_LEN + pdu_len,
        };
        if wire_len > self.max_adu_len() {
            return Err(ModbusError::too_many_data(format!(
                "Expected response of {} bytes exceeds the {}-byte ADU maximum",
                wire_len,
                self.max_adu_len()
            )));
        }
        Ok(ExpectedLength::Known(wire_len))
    }

    /// Length a request PDU may occupy on this framing; "too many data"
    /// when it does not fit
    pub fn check_request_fits(&self, pdu_len: usize) -> ModbusResult<()> {
        self.expected_adu_len(ExpectedLength::Known(pdu_len))
            .map(|_| ())
    }
}
