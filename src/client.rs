//! Modbus client
//!
//! The application layer is shared by every framing: build a request PDU,
//! wrap it for the wire, send it, receive the confirmation and cross-check
//! it against the request. [`GenericModbusClient`] implements that pipeline
//! once over any [`ModbusTransport`]; the concrete clients are aliases that
//! pair it with a transport and a frame format.
//!
//! # Exchange pipeline
//!
//! 1. Validate arguments (quantity within the per-function maximum, server
//!    id within range). Nothing is sent when validation fails.
//! 2. Build the PDU and wrap it into an ADU; TCP draws a transaction id.
//! 3. Send. A broadcast on a serial framing completes here: the request has
//!    no confirmation and the call reports success immediately.
//! 4. Receive under the response/byte timeout regime, with the frame length
//!    predicted from the request where possible.
//! 5. Validate the confirmation in order: integrity (done by the codec),
//!    transaction id and server id, exception flag, function code echo,
//!    quantity echo. The quantity check is strict: a reply whose quantity
//!    field contradicts the request is rejected even if its byte count is
//!    plausible.
//! 6. Copy the payload out.
//!
//! Failures pass through the configured error-recovery mode before they are
//! returned; a Modbus exception reply is an ordinary response and does not
//! trigger recovery.
//!
//! # Example
//!
//! ```rust,no_run
//! use triplex_modbus::{ModbusClient, ModbusTcpClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client = ModbusTcpClient::connect("127.0.0.1:502", Duration::from_secs(5)).await?;
//!
//!     let registers = client.read_03(1, 0x6B, 3).await?;
//!     println!("registers: {:?}", registers);
//!
//!     client.write_06(1, 0x10, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::config::SessionConfig;
use crate::constants::*;
use crate::engine::{receive_adu, MsgType};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::frame::{FrameFormat, Framing};
use crate::identification::DeviceIdResponse;
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::recovery::recover;
use crate::storage::pack_bits;
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Parsed report-server-id reply (FC17)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdReport {
    /// Server-specific id byte
    pub server_id: u8,
    /// Whether the run indicator is ON (0xFF)
    pub running: bool,
    /// Additional vendor data after the run indicator
    pub additional: Vec<u8>,
}

/// Client operations over every supported function code.
///
/// The primary names carry the function code (`read_01`, `write_10`) and
/// each has a semantic alias (`read_coils`, `write_multiple_registers`).
///
/// # Protocol limits
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read coils (0x01) | 2000 bits |
/// | Read discrete inputs (0x02) | 2000 bits |
/// | Read holding registers (0x03) | 125 registers |
/// | Read input registers (0x04) | 125 registers |
/// | Write multiple coils (0x0F) | 1968 bits |
/// | Write multiple registers (0x10) | 123 registers |
/// | Write-and-read registers (0x17) | read 125 / write 121 |
pub trait ModbusClient: Send {
    /// Read coils (function code 0x01)
    fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02)
    fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03)
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04)
    fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05)
    fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06)
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read exception status (function code 0x07, serial line)
    fn read_exception_status_07(
        &mut self,
        slave_id: SlaveId,
    ) -> impl Future<Output = ModbusResult<u8>> + Send;

    /// Write multiple coils (function code 0x0F)
    fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10)
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Report server id (function code 0x11, serial line)
    fn report_server_id_11(
        &mut self,
        slave_id: SlaveId,
    ) -> impl Future<Output = ModbusResult<ServerIdReport>> + Send;

    /// Mask write register (function code 0x16):
    /// `register <- (register AND and_mask) OR (or_mask AND NOT and_mask)`
    fn mask_write_16(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write then read registers in one transaction (function code 0x17)
    fn read_write_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// One read-device-identification transaction (function code 0x2B/0x0E)
    fn read_device_id_once(
        &mut self,
        slave_id: SlaveId,
        read_code: u8,
        object_id: u8,
    ) -> impl Future<Output = ModbusResult<DeviceIdResponse>> + Send;

    /// Collect device identification objects, following the next-object
    /// cursor across as many transactions as the server needs
    fn read_device_identification(
        &mut self,
        slave_id: SlaveId,
        read_code: u8,
    ) -> impl Future<Output = ModbusResult<Vec<(u8, Vec<u8>)>>> + Send;

    /// Whether the underlying transport is usable
    fn is_connected(&self) -> bool;

    /// Close the underlying transport
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Transport statistics
    fn get_stats(&self) -> TransportStats;

    // ===== Semantic aliases =====

    /// Alias for `read_01`
    #[inline]
    fn read_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_01(slave_id, address, quantity)
    }

    /// Alias for `read_02`
    #[inline]
    fn read_discrete_inputs(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_02(slave_id, address, quantity)
    }

    /// Alias for `read_03`
    #[inline]
    fn read_holding_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_03(slave_id, address, quantity)
    }

    /// Alias for `read_04`
    #[inline]
    fn read_input_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_04(slave_id, address, quantity)
    }

    /// Alias for `write_05`
    #[inline]
    fn write_single_coil(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_05(slave_id, address, value)
    }

    /// Alias for `write_06`
    #[inline]
    fn write_single_register(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_06(slave_id, address, value)
    }

    /// Alias for `write_0f`
    #[inline]
    fn write_multiple_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_0f(slave_id, address, values)
    }

    /// Alias for `write_10`
    #[inline]
    fn write_multiple_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_10(slave_id, address, values)
    }

    /// Alias for `mask_write_16`
    #[inline]
    fn mask_write_register(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.mask_write_16(slave_id, address, and_mask, or_mask)
    }

    /// Alias for `read_write_17`
    #[inline]
    fn write_and_read_registers(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_write_17(slave_id, read_address, read_quantity, write_address, values)
    }
}

/// Generic Modbus client over any transport and framing
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
    framing: Framing,
    config: SessionConfig,
    logger: CallbackLogger,
    /// Set after a serial broadcast: a noncompliant server may still reply,
    /// and whatever it sent must be discarded before the next exchange
    confirmation_to_ignore: bool,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    /// Create a client over `transport` speaking `format`
    pub fn new(transport: T, format: FrameFormat) -> Self {
        Self {
            transport,
            framing: Framing::new(format),
            config: SessionConfig::default(),
            logger: CallbackLogger::new(),
            confirmation_to_ignore: false,
        }
    }

    /// Replace the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a logger
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session configuration, mutable
    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutable
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn is_serial(&self) -> bool {
        matches!(
            self.framing.format(),
            FrameFormat::Rtu | FrameFormat::Ascii | FrameFormat::RtuHid
        )
    }

    fn validate_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        if slave_id > self.config.max_slave() {
            return Err(ModbusError::invalid_argument(format!(
                "Server id {} out of range 0..={}",
                slave_id,
                self.config.max_slave()
            )));
        }
        Ok(())
    }

    fn validate_quantity(function: ModbusFunction, quantity: u16) -> ModbusResult<()> {
        let max = function.max_quantity().unwrap_or(u16::MAX);
        if quantity == 0 || quantity > max {
            return Err(ModbusError::too_many_data(format!(
                "Quantity {} outside 1..={} for {:?}",
                quantity, max, function
            )));
        }
        Ok(())
    }

    /// Run recovery for a failed exchange, then hand the error back
    async fn fail(&mut self, error: ModbusError) -> ModbusError {
        recover(&mut self.transport, &self.config, &error).await;
        error
    }

    /// Execute one request/confirmation exchange.
    ///
    /// Returns `None` for a serial broadcast, which has no confirmation.
    pub async fn execute(&mut self, request: &ModbusRequest) -> ModbusResult<Option<ModbusResponse>> {
        self.validate_slave(request.slave_id)?;

        let pdu = request.to_pdu()?;
        self.framing.check_request_fits(pdu.len())?;

        // Predicted length is checked against the ADU maximum before any
        // byte moves
        let expected = self
            .framing
            .expected_adu_len(request.expected_response_length())?;

        // A stale reply to an earlier broadcast must not be mistaken for
        // this exchange's confirmation
        if self.confirmation_to_ignore {
            let _ = self.transport.flush().await;
            self.confirmation_to_ignore = false;
        }

        let (adu, tid) = self.framing.encode_request(request.slave_id, pdu.as_slice())?;
        if self.config.debug {
            self.logger.dump_sent(&adu);
        }
        if let Err(e) = self.transport.send(&adu).await {
            return Err(self.fail(e).await);
        }

        let is_broadcast = self.is_serial() && request.slave_id == BROADCAST_ADDRESS;
        if is_broadcast {
            debug!("broadcast request: not waiting for a confirmation");
            self.confirmation_to_ignore = true;
            return Ok(None);
        }

        let wire = match receive_adu(
            &mut self.transport,
            &self.framing,
            expected,
            MsgType::Confirmation,
            &self.config,
        )
        .await
        {
            Ok(wire) => wire,
            Err(e) => return Err(self.fail(e).await),
        };
        if self.config.debug {
            self.logger.dump_received(&wire);
        }

        let parts = match self.framing.decode(&wire) {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail(e).await),
        };

        match self.check_confirmation(request, tid, parts.tid, parts.slave_id, &parts.pdu) {
            Ok(()) => {}
            // Exception replies are expected responses: no recovery
            Err(e @ ModbusError::Exception { .. }) => return Err(e),
            Err(e) => return Err(self.fail(e).await),
        }

        Ok(Some(ModbusResponse::new(
            parts.slave_id,
            parts.pdu[0],
            parts.pdu[1..].to_vec(),
        )))
    }

    /// Confirmation checks, in specification order
    fn check_confirmation(
        &self,
        request: &ModbusRequest,
        sent_tid: Option<u16>,
        recv_tid: Option<u16>,
        responder: SlaveId,
        pdu: &[u8],
    ) -> ModbusResult<()> {
        if pdu.is_empty() {
            return Err(ModbusError::bad_data("Empty confirmation PDU"));
        }

        // Transaction id and addressing
        if self.framing.format() == FrameFormat::Tcp {
            if sent_tid != recv_tid {
                return Err(ModbusError::bad_data(format!(
                    "Transaction id mismatch: sent {:?}, received {:?}",
                    sent_tid, recv_tid
                )));
            }
            if request.slave_id != TCP_UNIT_ID_ANY
                && responder != request.slave_id
                && responder != TCP_UNIT_ID_ANY
            {
                return Err(ModbusError::BadSlave {
                    expected: request.slave_id,
                    actual: responder,
                });
            }
        } else if responder != request.slave_id {
            return Err(ModbusError::BadSlave {
                expected: request.slave_id,
                actual: responder,
            });
        }

        let fc = request.function.to_u8();

        // Exception reply: flagged function code followed by the code byte
        if pdu[0] == (fc | EXCEPTION_FLAG) {
            let raw = *pdu
                .get(1)
                .ok_or_else(|| ModbusError::bad_data("Exception reply without a code"))?;
            let code = ExceptionCode::from_u8(raw).ok_or_else(|| {
                ModbusError::bad_data(format!("Invalid exception code {:#04X}", raw))
            })?;
            return Err(ModbusError::exception(fc, code));
        }

        if pdu[0] != fc {
            return Err(ModbusError::bad_data(format!(
                "Function code mismatch: requested {:#04X}, received {:#04X}",
                fc, pdu[0]
            )));
        }

        self.check_quantity(request, &pdu[1..])
    }

    /// Cross-check the confirmation's counts and echoes against the request
    fn check_quantity(&self, request: &ModbusRequest, data: &[u8]) -> ModbusResult<()> {
        let q = request.quantity as usize;
        match request.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                expect_byte_count(data, q.div_ceil(8))
            }
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::WriteAndReadRegisters => expect_byte_count(data, 2 * q),
            ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::MaskWriteRegister => {
                // Full echo of address and value/masks
                let mut echo = Vec::with_capacity(2 + request.data.len());
                echo.extend_from_slice(&request.address.to_be_bytes());
                echo.extend_from_slice(&request.data);
                if data != echo.as_slice() {
                    return Err(ModbusError::bad_data("Write echo does not match the request"));
                }
                Ok(())
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                if data.len() != 4 {
                    return Err(ModbusError::bad_data("Write reply PDU has the wrong size"));
                }
                let addr = ((data[0] as u16) << 8) | data[1] as u16;
                let qty = ((data[2] as u16) << 8) | data[3] as u16;
                if addr != request.address {
                    return Err(ModbusError::bad_data(format!(
                        "Write reply address {:#06X} does not match request {:#06X}",
                        addr, request.address
                    )));
                }
                // Strict: a correct byte count cannot excuse a wrong quantity
                if qty != request.quantity {
                    return Err(ModbusError::bad_data(format!(
                        "Write reply quantity {} does not match request {}",
                        qty, request.quantity
                    )));
                }
                Ok(())
            }
            ModbusFunction::ReadExceptionStatus => {
                if data.len() != 1 {
                    return Err(ModbusError::bad_data("Exception status reply must be one byte"));
                }
                Ok(())
            }
            ModbusFunction::ReportServerId | ModbusFunction::ReadDeviceId => Ok(()),
        }
    }

    // ========================================================================
    // Raw access
    // ========================================================================

    /// Send a caller-built PDU as-is; returns the transaction id used.
    ///
    /// The confirmation, if one is expected, must be collected with
    /// [`receive_raw_confirmation`](Self::receive_raw_confirmation).
    pub async fn send_raw_request(&mut self, slave_id: SlaveId, pdu: &[u8]) -> ModbusResult<Option<u16>> {
        self.validate_slave(slave_id)?;
        if pdu.is_empty() {
            return Err(ModbusError::invalid_argument("Empty PDU"));
        }
        self.framing.check_request_fits(pdu.len())?;

        let (adu, tid) = self.framing.encode_request(slave_id, pdu)?;
        if self.config.debug {
            self.logger.dump_sent(&adu);
        }
        if let Err(e) = self.transport.send(&adu).await {
            return Err(self.fail(e).await);
        }
        Ok(tid)
    }

    /// Receive one confirmation frame and return its decoded parts without
    /// cross-checking it against any request
    pub async fn receive_raw_confirmation(&mut self) -> ModbusResult<ModbusResponse> {
        let wire = match receive_adu(
            &mut self.transport,
            &self.framing,
            crate::protocol::ExpectedLength::Undefined,
            MsgType::Confirmation,
            &self.config,
        )
        .await
        {
            Ok(wire) => wire,
            Err(e) => return Err(self.fail(e).await),
        };
        if self.config.debug {
            self.logger.dump_received(&wire);
        }
        let parts = match self.framing.decode(&wire) {
            Ok(parts) => parts,
            Err(e) => return Err(self.fail(e).await),
        };
        if parts.pdu.is_empty() {
            return Err(ModbusError::bad_data("Empty confirmation PDU"));
        }
        Ok(ModbusResponse::new(
            parts.slave_id,
            parts.pdu[0],
            parts.pdu[1..].to_vec(),
        ))
    }
}

impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        Self::validate_quantity(ModbusFunction::ReadCoils, quantity)?;
        let request = ModbusRequest::new_read(slave_id, ModbusFunction::ReadCoils, address, quantity);
        match self.execute(&request).await? {
            Some(response) => {
                let bits = response.parse_bits()?;
                Ok(bits.into_iter().take(quantity as usize).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        Self::validate_quantity(ModbusFunction::ReadDiscreteInputs, quantity)?;
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity);
        match self.execute(&request).await? {
            Some(response) => {
                let bits = response.parse_bits()?;
                Ok(bits.into_iter().take(quantity as usize).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        Self::validate_quantity(ModbusFunction::ReadHoldingRegisters, quantity)?;
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity);
        match self.execute(&request).await? {
            Some(response) => response.parse_registers(),
            None => Ok(Vec::new()),
        }
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        Self::validate_quantity(ModbusFunction::ReadInputRegisters, quantity)?;
        let request =
            ModbusRequest::new_read(slave_id, ModbusFunction::ReadInputRegisters, address, quantity);
        match self.execute(&request).await? {
            Some(response) => response.parse_registers(),
            None => Ok(Vec::new()),
        }
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let wire_value: u16 = if value { COIL_ON } else { COIL_OFF };
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: wire_value.to_be_bytes().to_vec(),
        };
        self.execute(&request).await?;
        Ok(())
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        };
        self.execute(&request).await?;
        Ok(())
    }

    async fn read_exception_status_07(&mut self, slave_id: SlaveId) -> ModbusResult<u8> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::ReadExceptionStatus,
            address: 0,
            quantity: 0,
            data: Vec::new(),
        };
        match self.execute(&request).await? {
            Some(response) => Ok(response.data()[0]),
            None => Err(ModbusError::invalid_argument(
                "Read exception status cannot be broadcast",
            )),
        }
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_BITS as usize {
            return Err(ModbusError::too_many_data(format!(
                "Coil count {} outside 1..={}",
                values.len(),
                MAX_WRITE_BITS
            )));
        }
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: pack_bits(values),
        };
        self.execute(&request).await?;
        Ok(())
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::too_many_data(format!(
                "Register count {} outside 1..={}",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }
        let mut data = Vec::with_capacity(values.len() * 2);
        for &value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data,
        };
        self.execute(&request).await?;
        Ok(())
    }

    async fn report_server_id_11(&mut self, slave_id: SlaveId) -> ModbusResult<ServerIdReport> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::ReportServerId,
            address: 0,
            quantity: 0,
            data: Vec::new(),
        };
        let response = self
            .execute(&request)
            .await?
            .ok_or_else(|| ModbusError::invalid_argument("Report server id cannot be broadcast"))?;

        let data = response.data();
        // Byte count, server id byte, run indicator, then vendor data
        if data.len() < 3 || (data[0] as usize) != data.len() - 1 {
            return Err(ModbusError::bad_data("Malformed report-server-id reply"));
        }
        Ok(ServerIdReport {
            server_id: data[1],
            running: data[2] == 0xFF,
            additional: data[3..].to_vec(),
        })
    }

    async fn mask_write_16(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&and_mask.to_be_bytes());
        data.extend_from_slice(&or_mask.to_be_bytes());
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::MaskWriteRegister,
            address,
            quantity: 1,
            data,
        };
        self.execute(&request).await?;
        Ok(())
    }

    async fn read_write_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        Self::validate_quantity(ModbusFunction::WriteAndReadRegisters, read_quantity)?;
        if values.is_empty() || values.len() > MAX_WR_WRITE_REGISTERS as usize {
            return Err(ModbusError::too_many_data(format!(
                "Write count {} outside 1..={}",
                values.len(),
                MAX_WR_WRITE_REGISTERS
            )));
        }

        let mut data = Vec::with_capacity(5 + values.len() * 2);
        data.extend_from_slice(&write_address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push((values.len() * 2) as u8);
        for &value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }

        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteAndReadRegisters,
            address: read_address,
            quantity: read_quantity,
            data,
        };
        match self.execute(&request).await? {
            Some(response) => response.parse_registers(),
            None => Ok(Vec::new()),
        }
    }

    async fn read_device_id_once(
        &mut self,
        slave_id: SlaveId,
        read_code: u8,
        object_id: u8,
    ) -> ModbusResult<DeviceIdResponse> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::ReadDeviceId,
            address: 0,
            quantity: 0,
            data: vec![MEI_READ_DEVICE_ID, read_code, object_id],
        };
        let response = self
            .execute(&request)
            .await?
            .ok_or_else(|| {
                ModbusError::invalid_argument("Device identification cannot be broadcast")
            })?;

        let mut pdu = Vec::with_capacity(1 + response.data().len());
        pdu.push(response.function);
        pdu.extend_from_slice(response.data());
        DeviceIdResponse::decode(&pdu)
    }

    async fn read_device_identification(
        &mut self,
        slave_id: SlaveId,
        read_code: u8,
    ) -> ModbusResult<Vec<(u8, Vec<u8>)>> {
        let mut objects = Vec::new();
        let mut cursor = 0u8;
        loop {
            let response = self.read_device_id_once(slave_id, read_code, cursor).await?;
            if response.more_follows && response.objects.is_empty() {
                return Err(ModbusError::bad_data(
                    "Device identification stream makes no progress",
                ));
            }
            objects.extend(response.objects);
            if !response.more_follows {
                return Ok(objects);
            }
            cursor = response.next_object_id;
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

fn expect_byte_count(data: &[u8], expected: usize) -> ModbusResult<()> {
    let actual = *data
        .first()
        .ok_or_else(|| ModbusError::bad_data("Confirmation missing its byte count"))?
        as usize;
    if actual != expected {
        return Err(ModbusError::bad_data(format!(
            "Byte count {} does not match the {} bytes implied by the request",
            actual, expected
        )));
    }
    Ok(())
}

// ============================================================================
// Concrete clients
// ============================================================================

/// Modbus TCP client
pub type ModbusTcpClient = GenericModbusClient<TcpTransport>;

/// RTU framing carried over a TCP stream (serial gateways)
pub struct ModbusRtuOverTcpClient;

impl ModbusTcpClient {
    /// Connect to a Modbus TCP server
    pub async fn connect(addr: &str, timeout: Duration) -> ModbusResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::invalid_argument(format!("Invalid address: {}", e)))?;
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(GenericModbusClient::new(transport, FrameFormat::Tcp))
    }

    /// Connect to an already resolved address
    pub async fn connect_addr(addr: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(GenericModbusClient::new(transport, FrameFormat::Tcp))
    }

    /// Protocol-independent connect: `node` may be a hostname or an IPv4 or
    /// IPv6 literal, `service` a port number or name
    pub async fn connect_pi(node: &str, service: &str, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::resolve(node, service, timeout).await?;
        Ok(GenericModbusClient::new(transport, FrameFormat::Tcp))
    }
}

impl ModbusRtuOverTcpClient {
    /// Connect to an RTU device behind a transparent TCP bridge
    pub async fn connect(
        addr: &str,
        timeout: Duration,
    ) -> ModbusResult<GenericModbusClient<TcpTransport>> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::invalid_argument(format!("Invalid address: {}", e)))?;
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(GenericModbusClient::new(transport, FrameFormat::Rtu))
    }
}

#[cfg(feature = "serial")]
pub use serial_clients::{ModbusAsciiClient, ModbusRtuClient};

#[cfg(feature = "serial")]
mod serial_clients {
    use super::*;
    use crate::transport::{SerialConfig, SerialTransport};

    /// Modbus RTU client over a serial port
    pub type ModbusRtuClient = GenericModbusClient<SerialTransport>;

    /// Modbus ASCII client over a serial port
    pub type ModbusAsciiClient = GenericModbusClient<SerialTransport>;

    impl GenericModbusClient<SerialTransport> {
        /// Open a serial RTU client
        pub fn new_rtu(config: SerialConfig) -> ModbusResult<Self> {
            let transport = SerialTransport::new(config)?;
            Ok(GenericModbusClient::new(transport, FrameFormat::Rtu))
        }

        /// Open a serial ASCII client
        pub fn new_ascii(config: SerialConfig) -> ModbusResult<Self> {
            let transport = SerialTransport::new(config)?;
            Ok(GenericModbusClient::new(transport, FrameFormat::Ascii))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use tokio::io::DuplexStream;

    type TestClient = GenericModbusClient<StreamTransport<DuplexStream>>;

    fn rtu_pair() -> (TestClient, StreamTransport<DuplexStream>) {
        let (near, far) = tokio::io::duplex(1024);
        let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Rtu);
        client.config_mut().response_timeout = crate::config::TimeoutSpec::from_millis(200).unwrap();
        (client, StreamTransport::new(far))
    }

    fn tcp_pair() -> (TestClient, StreamTransport<DuplexStream>) {
        let (near, far) = tokio::io::duplex(1024);
        let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Tcp);
        client.config_mut().response_timeout = crate::config::TimeoutSpec::from_millis(200).unwrap();
        (client, StreamTransport::new(far))
    }

    async fn respond_rtu(far: &mut StreamTransport<DuplexStream>, pdu: &[u8], slave: u8) {
        let mut framing = Framing::new(FrameFormat::Rtu);
        let (adu, _) = framing.encode_request(slave, pdu).unwrap();
        far.send(&adu).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_03_round_trip_rtu() {
        let (mut client, mut far) = rtu_pair();

        let reader = tokio::spawn(async move {
            // Wait for the request and check it byte for byte
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 16];
            let n = far.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]);

            respond_rtu(&mut far, &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x01, 0x00, 0x64], 0x11).await;
        });

        let registers = client.read_03(0x11, 0x6B, 3).await.unwrap();
        assert_eq!(registers, vec![0x022B, 0x0001, 0x0064]);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_quantity_validation_rejected_before_send() {
        let (mut client, _far) = rtu_pair();

        assert!(matches!(
            client.read_03(1, 0, 0).await,
            Err(ModbusError::TooManyData { .. })
        ));
        assert!(matches!(
            client.read_03(1, 0, 126).await,
            Err(ModbusError::TooManyData { .. })
        ));
        assert!(matches!(
            client.read_01(1, 0, 2001).await,
            Err(ModbusError::TooManyData { .. })
        ));
        assert!(matches!(
            client.write_10(1, 0, &[]).await,
            Err(ModbusError::TooManyData { .. })
        ));

        // Nothing was sent
        assert_eq!(client.get_stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_exception_reply_maps_to_error() {
        let (mut client, mut far) = tcp_pair();

        let reader = tokio::spawn(async move {
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 32];
            let _ = far.recv(&mut buf).await.unwrap();

            // Echo the TID, flag the function, illegal data address
            let reply = [0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x02];
            far.send(&reply).await.unwrap();
        });

        let err = client.read_01(1, 0x00FF, 1).await.unwrap_err();
        match err {
            ModbusError::Exception { function, code } => {
                assert_eq!(function, 0x01);
                assert_eq!(code, ExceptionCode::IllegalDataAddress);
                assert_eq!(ModbusError::exception(function, code).to_errno(), -2);
            }
            other => panic!("expected exception, got {:?}", other),
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_tid_mismatch_rejected() {
        let (mut client, mut far) = tcp_pair();

        let reader = tokio::spawn(async move {
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 32];
            let _ = far.recv(&mut buf).await.unwrap();

            // Wrong TID (0x0042 instead of 0x0000)
            let reply = [
                0x00, 0x42, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34,
            ];
            far.send(&reply).await.unwrap();
        });

        let err = client.read_03(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::BadData { .. }));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_slave_rejected_on_rtu() {
        let (mut client, mut far) = rtu_pair();

        let reader = tokio::spawn(async move {
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 16];
            let _ = far.recv(&mut buf).await.unwrap();

            // Reply from server 9 instead of 17
            respond_rtu(&mut far, &[0x03, 0x02, 0x12, 0x34], 0x09).await;
        });

        let err = client.read_03(0x11, 0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::BadSlave {
                expected: 0x11,
                actual: 0x09
            }
        ));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_returns_without_receiving() {
        let (mut client, mut far) = rtu_pair();

        // No server task: the call must complete anyway
        client.write_0f(0, 0, &[true, false, true]).await.unwrap();

        // The request did go out
        assert!(far.readable(Duration::from_millis(100)).await.unwrap());
        let mut buf = [0u8; 32];
        let n = far.recv(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0); // broadcast address
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_strict_quantity_cross_check() {
        let (mut client, mut far) = rtu_pair();

        let reader = tokio::spawn(async move {
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 32];
            let _ = far.recv(&mut buf).await.unwrap();

            // Quantity field says 3 although 2 registers were written
            respond_rtu(&mut far, &[0x10, 0x00, 0x10, 0x00, 0x03], 0x01).await;
        });

        let err = client.write_10(1, 0x10, &[1, 2]).await.unwrap_err();
        assert!(matches!(err, ModbusError::BadData { .. }));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_mask_write_echo_verified() {
        let (mut client, mut far) = rtu_pair();

        let reader = tokio::spawn(async move {
            assert!(far.readable(Duration::from_millis(500)).await.unwrap());
            let mut buf = [0u8; 32];
            let n = far.recv(&mut buf).await.unwrap();
            // Echo the request PDU back verbatim
            let pdu = buf[1..n - 2].to_vec();
            respond_rtu(&mut far, &pdu, 0x01).await;
        });

        client.mask_write_16(1, 0x0004, 0x00F2, 0x0025).await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_on_silent_server() {
        let (mut client, _far) = rtu_pair();

        let started = std::time::Instant::now();
        let err = client.read_03(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_slave_out_of_range_is_einval() {
        let (mut client, _far) = rtu_pair();

        let err = client.read_03(248, 0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument { .. }));
        assert_eq!(err.to_errno(), crate::error::errno::EINVAL);
    }
}
