//! Modbus server: indication receive and reply dispatch
//!
//! A [`ServerSession`] owns a transport, a framing, and a storage backend.
//! [`receive_indication`](ServerSession::receive_indication) runs the receive
//! engine in unknown-length mode and filters serial frames addressed to other
//! servers; [`reply`](ServerSession::reply) verifies the request, invokes the
//! backend, and sends the matching response or exception.
//!
//! The session serves one transport. Multi-connection servers keep one
//! session per accepted connection (or swap the transport of a single
//! session) and drive them from their own accept/poll loop; the engine never
//! multiplexes by itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use triplex_modbus::{FrameFormat, ModbusMapping, ModbusResult, ServerSession};
//! use triplex_modbus::transport::{StreamTransport};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let listener = TcpListener::bind("0.0.0.0:502").await?;
//!     let (socket, _) = listener.accept().await?;
//!
//!     let mapping = ModbusMapping::new(100, 100, 100, 100);
//!     let mut session =
//!         ServerSession::new(StreamTransport::new(socket), FrameFormat::Tcp, mapping);
//!     loop {
//!         session.serve_once().await?;
//!     }
//! }
//! ```

use tracing::debug;

use crate::config::{Quirks, SessionConfig};
use crate::constants::*;
use crate::engine::{receive_adu, MsgType};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::frame::{FrameFormat, Framing};
use crate::identification::DeviceIdentification;
use crate::logging::CallbackLogger;
use crate::protocol::ExpectedLength;
use crate::storage::{pack_bits, unpack_bits, StorageBackend};
use crate::transport::ModbusTransport;

/// A received, integrity-checked request frame
#[derive(Debug, Clone)]
pub struct Indication {
    /// Transaction id to echo (TCP only)
    pub tid: Option<u16>,
    /// Server address the request was sent to
    pub slave_id: u8,
    /// Function code plus function-specific data
    pub pdu: Vec<u8>,
}

impl Indication {
    /// Whether this request was broadcast on a serial bus
    pub fn is_broadcast(&self) -> bool {
        self.slave_id == BROADCAST_ADDRESS
    }

    fn u16_at(&self, offset: usize) -> u16 {
        ((self.pdu[offset] as u16) << 8) | self.pdu[offset + 1] as u16
    }
}

/// Outcome of the verification stage of the dispatcher
enum Verdict {
    /// Response PDU ready to send
    Respond(Vec<u8>),
    /// Exception to emit; the flag requests a sleep-and-flush first because
    /// the indication's length fields could not be trusted
    Except(ExceptionCode, bool),
}

/// Server session: transport + framing + storage backend
pub struct ServerSession<T: ModbusTransport, B: StorageBackend> {
    transport: T,
    framing: Framing,
    config: SessionConfig,
    backend: B,
    identification: Option<DeviceIdentification>,
    server_id_text: Vec<u8>,
    logger: CallbackLogger,
    /// After a foreign indication on a shared bus, the addressed server's
    /// confirmation is the next frame and must be skipped
    confirmation_to_ignore: bool,
}

impl<T: ModbusTransport, B: StorageBackend> ServerSession<T, B> {
    /// Create a session serving `backend` over `transport`
    pub fn new(transport: T, format: FrameFormat, backend: B) -> Self {
        Self {
            transport,
            framing: Framing::new(format),
            config: SessionConfig::default(),
            backend,
            identification: None,
            server_id_text: format!("TMB{}", env!("CARGO_PKG_VERSION")).into_bytes(),
            logger: CallbackLogger::new(),
            confirmation_to_ignore: false,
        }
    }

    /// Replace the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve device identification objects (FC43/0x0E)
    pub fn with_identification(mut self, identification: DeviceIdentification) -> Self {
        self.identification = Some(identification);
        self
    }

    /// Vendor data appended to the report-server-id reply
    pub fn with_server_id_text<V: Into<Vec<u8>>>(mut self, text: V) -> Self {
        self.server_id_text = text.into();
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

    /// The storage backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The storage backend, mutable
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
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

    /// Wait for an indication.
    ///
    /// Returns `None` when a serial frame addressed to a different server was
    /// observed and dropped: no reply, no flush, and the addressed server's
    /// confirmation will be skipped on the next call.
    pub async fn receive_indication(&mut self) -> ModbusResult<Option<Indication>> {
        if self.confirmation_to_ignore {
            self.confirmation_to_ignore = false;
            // Skip the confirmation belonging to another server's exchange;
            // an error here (timeout, noise) is not ours to report
            if let Ok(wire) = receive_adu(
                &mut self.transport,
                &self.framing,
                ExpectedLength::Undefined,
                MsgType::Confirmation,
                &self.config,
            )
            .await
            {
                debug!("skipped a foreign confirmation of {} bytes", wire.len());
            }
        }

        let wire = receive_adu(
            &mut self.transport,
            &self.framing,
            ExpectedLength::Undefined,
            MsgType::Indication,
            &self.config,
        )
        .await?;
        if self.config.debug {
            self.logger.dump_received(&wire);
        }

        let parts = self.framing.decode(&wire)?;
        if parts.pdu.is_empty() {
            return Err(ModbusError::protocol("Indication with an empty PDU"));
        }

        if self.is_serial() {
            let for_us = parts.slave_id == BROADCAST_ADDRESS
                || parts.slave_id == self.config.slave
                || self.backend.accept_slave(parts.slave_id);
            if !for_us {
                debug!(
                    "indication for server {} is not ours; dropping silently",
                    parts.slave_id
                );
                self.confirmation_to_ignore = true;
                return Ok(None);
            }
        }

        Ok(Some(Indication {
            tid: parts.tid,
            slave_id: parts.slave_id,
            pdu: parts.pdu,
        }))
    }

    /// Verify an indication, run it against the backend, and send the
    /// response. Returns the number of bytes put on the wire; zero means the
    /// reply was suppressed (broadcast).
    pub async fn reply(&mut self, indication: &Indication) -> ModbusResult<usize> {
        let function = indication.pdu[0];
        let verdict = self.dispatch(indication);

        let suppress = self.is_serial()
            && indication.is_broadcast()
            && !self.config.quirks.contains(Quirks::REPLY_TO_BROADCAST);

        let adu = match verdict {
            Verdict::Respond(pdu) => {
                if suppress {
                    debug!("broadcast side effects applied; reply suppressed");
                    return Ok(0);
                }
                self.framing
                    .encode_response(indication.slave_id, indication.tid, &pdu)?
            }
            Verdict::Except(code, flush) => {
                debug!(
                    "exception {} for function {:#04X}",
                    code, function
                );
                if flush {
                    // The length fields could not be trusted: let the tail of
                    // the mangled request drain, then discard it
                    tokio::time::sleep(self.config.response_timeout.as_duration()).await;
                    let _ = self.transport.flush().await;
                }
                if suppress {
                    return Ok(0);
                }
                self.framing
                    .encode_exception(indication.slave_id, indication.tid, function, code)?
            }
        };

        if self.config.debug {
            self.logger.dump_sent(&adu);
        }
        self.transport.send(&adu).await?;
        Ok(adu.len())
    }

    /// Receive one indication and answer it; a convenience for simple
    /// single-connection servers. Returns `false` when a foreign frame was
    /// dropped instead.
    pub async fn serve_once(&mut self) -> ModbusResult<bool> {
        match self.receive_indication().await? {
            Some(indication) => {
                self.reply(&indication).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        let function = pdu[0];

        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => self.read_bits(indication),
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => self.read_registers(indication),
            FC_WRITE_SINGLE_COIL => self.write_single_coil(indication),
            FC_WRITE_SINGLE_REGISTER => self.write_single_register(indication),
            FC_READ_EXCEPTION_STATUS => match self.backend.exception_status() {
                Ok(status) => Verdict::Respond(vec![function, status]),
                Err(code) => Verdict::Except(code, false),
            },
            FC_WRITE_MULTIPLE_COILS => self.write_multiple_coils(indication),
            FC_WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(indication),
            FC_REPORT_SERVER_ID => self.report_server_id(),
            FC_MASK_WRITE_REGISTER => self.mask_write_register(indication),
            FC_WRITE_AND_READ_REGISTERS => self.write_and_read_registers(indication),
            FC_READ_DEVICE_ID => self.read_device_id(indication),
            _ => {
                debug!("unknown function code {:#04X}", function);
                Verdict::Except(ExceptionCode::IllegalFunction, true)
            }
        }
    }

    fn read_bits(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 5 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let function = pdu[0];
        let address = indication.u16_at(1);
        let quantity = indication.u16_at(3);

        if quantity == 0 || quantity > MAX_READ_BITS {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }

        let result = if function == FC_READ_COILS {
            self.backend.read_coils(address, quantity)
        } else {
            self.backend.read_discrete_inputs(address, quantity)
        };

        match result {
            Ok(bits) if bits.len() >= quantity as usize => {
                let mut rsp = Vec::with_capacity(2 + (quantity as usize).div_ceil(8));
                rsp.push(function);
                let packed = pack_bits(&bits[..quantity as usize]);
                rsp.push(packed.len() as u8);
                rsp.extend_from_slice(&packed);
                Verdict::Respond(rsp)
            }
            // The backend claimed success but delivered short
            Ok(_) => Verdict::Except(ExceptionCode::ServerDeviceFailure, false),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn read_registers(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 5 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let function = pdu[0];
        let address = indication.u16_at(1);
        let quantity = indication.u16_at(3);

        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }

        let result = if function == FC_READ_HOLDING_REGISTERS {
            self.backend.read_holding_registers(address, quantity)
        } else {
            self.backend.read_input_registers(address, quantity)
        };

        match result {
            Ok(registers) if registers.len() >= quantity as usize => {
                Verdict::Respond(registers_response(function, &registers[..quantity as usize]))
            }
            Ok(_) => Verdict::Except(ExceptionCode::ServerDeviceFailure, false),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn write_single_coil(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 5 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let address = indication.u16_at(1);
        let value = indication.u16_at(3);

        if value != COIL_ON && value != COIL_OFF {
            return Verdict::Except(ExceptionCode::IllegalDataValue, false);
        }

        match self.backend.write_coil(address, value == COIL_ON) {
            Ok(()) => Verdict::Respond(pdu.clone()),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn write_single_register(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 5 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let address = indication.u16_at(1);
        let value = indication.u16_at(3);

        match self.backend.write_register(address, value) {
            Ok(()) => Verdict::Respond(pdu.clone()),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn write_multiple_coils(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 6 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let address = indication.u16_at(1);
        let quantity = indication.u16_at(3);
        let byte_count = pdu[5] as usize;

        if quantity == 0
            || quantity > MAX_WRITE_BITS
            || byte_count != (quantity as usize).div_ceil(8)
            || pdu.len() != 6 + byte_count
        {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }

        let bits = unpack_bits(&pdu[6..], quantity as usize);
        match self.backend.write_coils(address, &bits) {
            Ok(()) => Verdict::Respond(pdu[..5].to_vec()),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn write_multiple_registers(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 6 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let address = indication.u16_at(1);
        let quantity = indication.u16_at(3);
        let byte_count = pdu[5] as usize;

        if quantity == 0
            || quantity > MAX_WRITE_REGISTERS
            || byte_count != quantity as usize * 2
            || pdu.len() != 6 + byte_count
        {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }

        let values: Vec<u16> = pdu[6..]
            .chunks_exact(2)
            .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
            .collect();
        match self.backend.write_registers(address, &values) {
            Ok(()) => Verdict::Respond(pdu[..5].to_vec()),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn report_server_id(&self) -> Verdict {
        // Server id byte, run indicator ON, then the vendor text
        let mut rsp = Vec::with_capacity(4 + self.server_id_text.len());
        rsp.push(FC_REPORT_SERVER_ID);
        rsp.push((2 + self.server_id_text.len()) as u8);
        rsp.push(self.config.slave);
        rsp.push(0xFF);
        rsp.extend_from_slice(&self.server_id_text);
        Verdict::Respond(rsp)
    }

    fn mask_write_register(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 7 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let address = indication.u16_at(1);
        let and_mask = indication.u16_at(3);
        let or_mask = indication.u16_at(5);

        let current = match self.backend.read_holding_registers(address, 1) {
            Ok(values) if !values.is_empty() => values[0],
            Ok(_) => return Verdict::Except(ExceptionCode::ServerDeviceFailure, false),
            Err(code) => return Verdict::Except(code, false),
        };

        let masked = (current & and_mask) | (or_mask & !and_mask);
        match self.backend.write_register(address, masked) {
            Ok(()) => Verdict::Respond(pdu.clone()),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn write_and_read_registers(&mut self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 10 {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }
        let read_address = indication.u16_at(1);
        let read_quantity = indication.u16_at(3);
        let write_address = indication.u16_at(5);
        let write_quantity = indication.u16_at(7);
        let byte_count = pdu[9] as usize;

        if read_quantity == 0
            || read_quantity > MAX_WR_READ_REGISTERS
            || write_quantity == 0
            || write_quantity > MAX_WR_WRITE_REGISTERS
            || byte_count != write_quantity as usize * 2
            || pdu.len() != 10 + byte_count
        {
            return Verdict::Except(ExceptionCode::IllegalDataValue, true);
        }

        // Write before read, as the function requires
        let values: Vec<u16> = pdu[10..]
            .chunks_exact(2)
            .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
            .collect();
        if let Err(code) = self.backend.write_registers(write_address, &values) {
            return Verdict::Except(code, false);
        }

        match self.backend.read_holding_registers(read_address, read_quantity) {
            Ok(registers) if registers.len() >= read_quantity as usize => Verdict::Respond(
                registers_response(pdu[0], &registers[..read_quantity as usize]),
            ),
            Ok(_) => Verdict::Except(ExceptionCode::ServerDeviceFailure, false),
            Err(code) => Verdict::Except(code, false),
        }
    }

    fn read_device_id(&self, indication: &Indication) -> Verdict {
        let pdu = &indication.pdu;
        if pdu.len() < 4 || pdu[1] != MEI_READ_DEVICE_ID {
            return Verdict::Except(ExceptionCode::IllegalFunction, false);
        }
        let identification = match &self.identification {
            Some(identification) => identification,
            None => return Verdict::Except(ExceptionCode::IllegalFunction, false),
        };
        match identification.build_response(pdu[2], pdu[3], MAX_PDU_SIZE) {
            Ok(rsp) => Verdict::Respond(rsp),
            Err(code) => Verdict::Except(code, false),
        }
    }
}

fn registers_response(function: u8, registers: &[u16]) -> Vec<u8> {
    let mut rsp = Vec::with_capacity(2 + registers.len() * 2);
    rsp.push(function);
    rsp.push((registers.len() * 2) as u8);
    for &value in registers {
        rsp.extend_from_slice(&value.to_be_bytes());
    }
    rsp
}
