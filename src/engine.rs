//! Receive engine
//!
//! Pulls bytes from a transport until a complete frame is in hand, under the
//! two-phase timeout regime:
//!
//! - *start timeout* — between issuing the wait and the first byte. For a
//!   confirmation this is the response timeout; a server listening for an
//!   indication waits much longer (60 s stock).
//! - *byte timeout* — between successive bytes within one frame. A disabled
//!   byte timeout makes the whole frame share the start budget.
//!
//! When the frame length is not known in advance the engine infers it with a
//! state machine keyed on the function code:
//!
//! 1. **Function** — read up to and including the function code.
//! 2. **Meta** — read the fixed function-specific bytes that follow; for the
//!    multiple-write functions the last of these is an embedded byte count.
//! 3. **Data** — read the counted bytes (zero for most functions), then the
//!    trailer.
//!
//! Device-identification confirmations carry an object list instead of a
//! byte count, so the machine gains object-header/object-value steps that
//! walk the list as it arrives.
//!
//! The engine blocks its task but never multiplexes: serving several
//! connections means an outer loop that picks the readable descriptor and
//! runs the engine on it.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{ByteTimeout, SessionConfig};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{FrameFormat, Framing};
use crate::protocol::ExpectedLength;
use crate::transport::ModbusTransport;

/// Whether the engine is waiting for a request or for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Server side: a request from a client
    Indication,
    /// Client side: the reply to a request we sent
    Confirmation,
}

/// Length-inference steps for frames of initially unknown size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Reading the function-specific fixed bytes
    Meta,
    /// Reading the counted data bytes plus trailer
    Data,
    /// Walking a device-identification object list: id + length pairs
    ObjectHeader { remaining: u8 },
    /// Reading one object's value bytes
    ObjectValue { remaining: u8 },
    /// Frame complete
    Complete,
}

/// Receive one complete wire frame.
///
/// `expected` is the *wire* length (including header and trailer) predicted
/// from the request, or `Undefined` to infer the length while receiving.
/// The returned bytes are exactly one ADU as it appeared on the wire; no
/// integrity check has been applied yet.
pub async fn receive_adu<T: ModbusTransport>(
    transport: &mut T,
    framing: &Framing,
    expected: ExpectedLength,
    msg_type: MsgType,
    config: &SessionConfig,
) -> ModbusResult<Vec<u8>> {
    let start_timeout = match msg_type {
        MsgType::Confirmation => config.response_timeout.as_duration(),
        MsgType::Indication => config.indication_timeout,
    };

    match expected {
        ExpectedLength::Known(n) => debug!("waiting for a frame ({} bytes)", n),
        ExpectedLength::Undefined => debug!("waiting for a frame"),
    }

    if framing.format() == FrameFormat::Ascii {
        return receive_ascii(transport, start_timeout, config).await;
    }

    receive_binary(transport, framing, expected, msg_type, start_timeout, config).await
}

// ============================================================================
// Binary framings (RTU, TCP, RTU-over-HID)
// ============================================================================

async fn receive_binary<T: ModbusTransport>(
    transport: &mut T,
    framing: &Framing,
    expected: ExpectedLength,
    msg_type: MsgType,
    start_timeout: Duration,
    config: &SessionConfig,
) -> ModbusResult<Vec<u8>> {
    let header_len = framing.header_len();
    let checksum_len = framing.checksum_len();
    let max_len = framing.max_adu_len();
    let deadline = Instant::now() + start_timeout;

    let mut adu: Vec<u8> = Vec::with_capacity(max_len);

    // Function step: everything up to and including the function code
    read_exact(
        transport,
        &mut adu,
        header_len + 1,
        start_timeout,
        deadline,
        config,
        true,
    )
    .await?;

    let function = adu[header_len];

    // An exception reply is the shortest frame in the protocol: function
    // (flagged) plus one code byte. It overrides any predicted length.
    let mut step;
    let mut need;
    if function & EXCEPTION_FLAG != 0 && msg_type == MsgType::Confirmation {
        step = Step::Data;
        need = 1 + checksum_len;
    } else {
        match expected {
            ExpectedLength::Known(total) => {
                if total > max_len {
                    return Err(ModbusError::too_many_data(format!(
                        "Expected frame of {} bytes exceeds the {}-byte maximum",
                        total, max_len
                    )));
                }
                if total < adu.len() {
                    return Err(ModbusError::protocol("Expected frame shorter than its header"));
                }
                step = Step::Data;
                need = total - adu.len();
            }
            ExpectedLength::Undefined => {
                step = Step::Meta;
                need = meta_length(function, msg_type);
            }
        }
    }

    loop {
        if adu.len() + need > max_len {
            return Err(ModbusError::too_many_data(format!(
                "Frame grew past the {}-byte maximum",
                max_len
            )));
        }
        if need > 0 {
            read_exact(transport, &mut adu, need, start_timeout, deadline, config, false).await?;
        }

        (step, need) = match step {
            Step::Meta => {
                data_step(function, msg_type, &adu, header_len, checksum_len)?
            }
            Step::Data => (Step::Complete, 0),
            Step::ObjectHeader { remaining } => {
                // id byte + length byte were just read
                let value_len = adu[adu.len() - 1] as usize;
                if value_len == 0 {
                    next_object(remaining, checksum_len)
                } else {
                    (
                        Step::ObjectValue { remaining },
                        value_len,
                    )
                }
            }
            Step::ObjectValue { remaining } => next_object(remaining, checksum_len),
            Step::Complete => break,
        };

        if step == Step::Complete && need > 0 {
            // trailing bytes (data and/or checksum) still owed
            if adu.len() + need > max_len {
                return Err(ModbusError::too_many_data(format!(
                    "Frame grew past the {}-byte maximum",
                    max_len
                )));
            }
            read_exact(transport, &mut adu, need, start_timeout, deadline, config, false).await?;
            break;
        }
        if step == Step::Complete && need == 0 {
            break;
        }
    }

    transport.note_frame();
    trace!("received frame: {}", hex::encode_upper(&adu));
    Ok(adu)
}

/// Fixed bytes that follow the function code when the length is inferred
fn meta_length(function: u8, msg_type: MsgType) -> usize {
    match msg_type {
        MsgType::Indication => match function {
            FC_READ_COILS..=FC_WRITE_SINGLE_REGISTER => 4,
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => 5,
            FC_MASK_WRITE_REGISTER => 6,
            FC_WRITE_AND_READ_REGISTERS => 9,
            FC_READ_DEVICE_ID => 3,
            // FC_READ_EXCEPTION_STATUS, FC_REPORT_SERVER_ID and anything
            // unknown: the request is the function code alone
            _ => 0,
        },
        MsgType::Confirmation => match function {
            FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS => 4,
            FC_MASK_WRITE_REGISTER => 6,
            FC_READ_DEVICE_ID => 6,
            // Reads, report-server-id and write-and-read carry a one-byte
            // count; exception replies carry the code byte
            _ => 1,
        },
    }
}

/// Decide what follows the meta bytes
fn data_step(
    function: u8,
    msg_type: MsgType,
    adu: &[u8],
    header_len: usize,
    checksum_len: usize,
) -> ModbusResult<(Step, usize)> {
    match msg_type {
        MsgType::Indication => {
            let data = match function {
                FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                    adu[header_len + 5] as usize
                }
                FC_WRITE_AND_READ_REGISTERS => adu[header_len + 9] as usize,
                _ => 0,
            };
            Ok((Step::Data, data + checksum_len))
        }
        MsgType::Confirmation => match function {
            FC_READ_COILS..=FC_READ_INPUT_REGISTERS
            | FC_REPORT_SERVER_ID
            | FC_WRITE_AND_READ_REGISTERS => {
                let data = adu[header_len + 1] as usize;
                Ok((Step::Data, data + checksum_len))
            }
            FC_READ_DEVICE_ID => {
                // meta: MEI type, read code, conformity, more-follows,
                // next object id, number of objects
                let object_count = adu[header_len + 6];
                if object_count == 0 {
                    Ok((Step::Data, checksum_len))
                } else {
                    Ok((
                        Step::ObjectHeader {
                            remaining: object_count,
                        },
                        2,
                    ))
                }
            }
            _ => Ok((Step::Data, checksum_len)),
        },
    }
}

/// After one object finishes: another header, or the trailer
fn next_object(remaining: u8, checksum_len: usize) -> (Step, usize) {
    if remaining > 1 {
        (
            Step::ObjectHeader {
                remaining: remaining - 1,
            },
            2,
        )
    } else {
        (Step::Complete, checksum_len)
    }
}

/// Read exactly `count` more bytes into `adu`.
///
/// The first wait of a frame uses the start timeout; later waits use the
/// byte timeout, or the remaining start budget when the byte timeout is
/// disabled.
async fn read_exact<T: ModbusTransport>(
    transport: &mut T,
    adu: &mut Vec<u8>,
    count: usize,
    start_timeout: Duration,
    deadline: Instant,
    config: &SessionConfig,
    first: bool,
) -> ModbusResult<()> {
    let mut remaining = count;
    let mut first_wait = first && adu.is_empty();

    while remaining > 0 {
        let wait = if first_wait {
            start_timeout
        } else {
            match config.byte_timeout {
                ByteTimeout::Enabled(spec) => spec.as_duration(),
                ByteTimeout::Disabled => deadline.saturating_duration_since(Instant::now()),
            }
        };

        if wait.is_zero() || !transport.readable(wait).await? {
            return Err(ModbusError::timeout(
                if first_wait {
                    "Waiting for the first byte of a frame"
                } else {
                    "Waiting for the rest of a frame"
                },
                wait.as_millis() as u64,
            ));
        }
        first_wait = false;

        let mut chunk = vec![0u8; remaining];
        let n = transport.recv(&mut chunk).await?;
        if n == 0 {
            return Err(ModbusError::connection("Transport closed mid-frame"));
        }
        adu.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }
    Ok(())
}

// ============================================================================
// ASCII framing
// ============================================================================

/// ASCII frames are self-delimiting: a colon starts a frame (and
/// resynchronizes after noise), LF ends it. Length inference is not needed;
/// the decoded image is bounded by the 513-character wire maximum.
async fn receive_ascii<T: ModbusTransport>(
    transport: &mut T,
    start_timeout: Duration,
    config: &SessionConfig,
) -> ModbusResult<Vec<u8>> {
    let deadline = Instant::now() + start_timeout;
    let mut adu: Vec<u8> = Vec::with_capacity(MAX_ASCII_ADU);
    let mut first = true;

    loop {
        let wait = if first {
            start_timeout
        } else {
            match config.byte_timeout {
                ByteTimeout::Enabled(spec) => spec.as_duration(),
                ByteTimeout::Disabled => deadline.saturating_duration_since(Instant::now()),
            }
        };

        if wait.is_zero() || !transport.readable(wait).await? {
            return Err(ModbusError::timeout(
                "Waiting for an ASCII frame",
                wait.as_millis() as u64,
            ));
        }
        first = false;

        let mut byte = [0u8; 1];
        let n = transport.recv(&mut byte).await?;
        if n == 0 {
            return Err(ModbusError::connection("Transport closed mid-frame"));
        }

        match byte[0] {
            b':' => {
                // Start of frame; discard anything collected before it
                adu.clear();
                adu.push(b':');
            }
            b'\n' => {
                if adu.is_empty() {
                    continue;
                }
                adu.push(b'\n');
                transport.note_frame();
                trace!("received frame: {}", String::from_utf8_lossy(&adu).trim());
                return Ok(adu);
            }
            other => {
                if adu.is_empty() {
                    // Noise before the colon
                    continue;
                }
                adu.push(other);
                if adu.len() > MAX_ASCII_ADU {
                    return Err(ModbusError::too_many_data(format!(
                        "ASCII frame grew past {} characters",
                        MAX_ASCII_ADU
                    )));
                }
            }
        }
    }
}
