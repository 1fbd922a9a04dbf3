//! Read device identification (FC43 / MEI 0x0E)
//!
//! A device exposes a small object store: basic objects (vendor name,
//! product code, revision) that every conforming device carries, optional
//! regular objects (vendor URL, product name, model name, user application
//! name) and vendor-specific extended objects. Clients read the store as a
//! stream, resuming from the next-object cursor whenever a reply could not
//! hold the remaining objects.

use std::collections::BTreeMap;

use crate::constants::{FC_READ_DEVICE_ID, MAX_PDU_SIZE, MEI_READ_DEVICE_ID};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};

/// Object id of the vendor name (basic)
pub const OBJECT_VENDOR_NAME: u8 = 0x00;
/// Object id of the product code (basic)
pub const OBJECT_PRODUCT_CODE: u8 = 0x01;
/// Object id of the major/minor revision (basic)
pub const OBJECT_REVISION: u8 = 0x02;

/// Bytes of response header after the function code:
/// MEI type, read code, conformity, more-follows, next object id, count
const RESPONSE_HEADER_LEN: usize = 6;

/// Read device id codes selecting the access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDeviceIdCode {
    /// Stream access to the basic objects (0x00..=0x02)
    Basic = 1,
    /// Stream access to the regular objects (0x00..=0x06)
    Regular = 2,
    /// Stream access to the extended objects (0x00..=0xFF)
    Extended = 3,
    /// Individual access to one specific object
    Specific = 4,
}

impl ReadDeviceIdCode {
    /// Decode the wire value
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Basic),
            2 => Some(Self::Regular),
            3 => Some(Self::Extended),
            4 => Some(Self::Specific),
            _ => None,
        }
    }

    /// Wire value
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Last object id included in this access category's stream
    fn stream_end(self) -> u8 {
        match self {
            Self::Basic => 0x02,
            Self::Regular => 0x06,
            Self::Extended | Self::Specific => 0xFF,
        }
    }
}

/// The identification object store served by a server
#[derive(Debug, Clone)]
pub struct DeviceIdentification {
    objects: BTreeMap<u8, Vec<u8>>,
}

impl DeviceIdentification {
    /// Build a store with the three mandatory basic objects
    pub fn new<V, P, R>(vendor_name: V, product_code: P, revision: R) -> Self
    where
        V: Into<Vec<u8>>,
        P: Into<Vec<u8>>,
        R: Into<Vec<u8>>,
    {
        let mut objects = BTreeMap::new();
        objects.insert(OBJECT_VENDOR_NAME, vendor_name.into());
        objects.insert(OBJECT_PRODUCT_CODE, product_code.into());
        objects.insert(OBJECT_REVISION, revision.into());
        Self { objects }
    }

    /// Add or replace an object
    pub fn set_object<V: Into<Vec<u8>>>(&mut self, id: u8, value: V) {
        self.objects.insert(id, value.into());
    }

    /// Look up an object
    pub fn object(&self, id: u8) -> Option<&[u8]> {
        self.objects.get(&id).map(|v| v.as_slice())
    }

    /// Conformity level: highest populated category plus the
    /// individual-access bit
    pub fn conformity_level(&self) -> u8 {
        let category = match self.objects.keys().next_back() {
            Some(&id) if id > 0x06 => 0x03,
            Some(&id) if id > 0x02 => 0x02,
            _ => 0x01,
        };
        category | 0x80
    }

    /// Build the response PDU for one identification request.
    ///
    /// Stream access returns objects from `object_id` to the end of the
    /// category, truncating (with more-follows and the next-object cursor)
    /// when the PDU budget runs out. Individual access returns exactly one
    /// object or illegal-data-address.
    pub fn build_response(
        &self,
        read_code: u8,
        object_id: u8,
        max_pdu: usize,
    ) -> Result<Vec<u8>, ExceptionCode> {
        let code = ReadDeviceIdCode::from_u8(read_code).ok_or(ExceptionCode::IllegalDataValue)?;

        let selected: Vec<(u8, &[u8])> = match code {
            ReadDeviceIdCode::Specific => {
                let value = self.object(object_id).ok_or(ExceptionCode::IllegalDataAddress)?;
                vec![(object_id, value)]
            }
            _ => {
                // Stream access restarts at the first object when the cursor
                // names an absent object or one outside the category
                let start = if object_id <= code.stream_end() && self.objects.contains_key(&object_id)
                {
                    object_id
                } else {
                    OBJECT_VENDOR_NAME
                };
                self.objects
                    .range(start..=code.stream_end())
                    .map(|(&id, v)| (id, v.as_slice()))
                    .collect()
            }
        };

        let budget = max_pdu.min(MAX_PDU_SIZE);
        let mut pdu = Vec::with_capacity(budget);
        pdu.push(FC_READ_DEVICE_ID);
        pdu.push(MEI_READ_DEVICE_ID);
        pdu.push(read_code);
        pdu.push(self.conformity_level());
        // more-follows, next object id and count are patched below
        pdu.push(0x00);
        pdu.push(0x00);
        pdu.push(0x00);

        let mut included = 0u8;
        let mut next_id = None;
        for (id, value) in &selected {
            if pdu.len() + 2 + value.len() > budget {
                next_id = Some(*id);
                break;
            }
            pdu.push(*id);
            pdu.push(value.len() as u8);
            pdu.extend_from_slice(value);
            included += 1;
        }

        if let Some(next) = next_id {
            pdu[4] = 0xFF;
            pdu[5] = next;
        }
        pdu[6] = included;
        Ok(pdu)
    }
}

/// A decoded identification response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdResponse {
    /// Access mode echoed by the server
    pub read_code: u8,
    /// Conformity level byte
    pub conformity: u8,
    /// Whether another request is needed to fetch the rest
    pub more_follows: bool,
    /// Cursor to pass in the follow-up request
    pub next_object_id: u8,
    /// Objects carried by this reply
    pub objects: Vec<(u8, Vec<u8>)>,
}

impl DeviceIdResponse {
    /// Decode a response PDU (starting at the function code)
    pub fn decode(pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.len() < 1 + RESPONSE_HEADER_LEN {
            return Err(ModbusError::bad_data("Device identification reply too short"));
        }
        if pdu[0] != FC_READ_DEVICE_ID || pdu[1] != MEI_READ_DEVICE_ID {
            return Err(ModbusError::bad_data(format!(
                "Not a device identification reply: {:02X} {:02X}",
                pdu[0], pdu[1]
            )));
        }

        let object_count = pdu[6];
        let mut objects = Vec::with_capacity(object_count as usize);
        let mut cursor = 1 + RESPONSE_HEADER_LEN;
        for _ in 0..object_count {
            if cursor + 2 > pdu.len() {
                return Err(ModbusError::bad_data("Object list truncated"));
            }
            let id = pdu[cursor];
            let len = pdu[cursor + 1] as usize;
            cursor += 2;
            if cursor + len > pdu.len() {
                return Err(ModbusError::bad_data("Object value truncated"));
            }
            objects.push((id, pdu[cursor..cursor + len].to_vec()));
            cursor += len;
        }

        Ok(Self {
            read_code: pdu[2],
            conformity: pdu[3],
            more_follows: pdu[4] == 0xFF,
            next_object_id: pdu[5],
            objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceIdentification {
        DeviceIdentification::new("Acme Automation", "AMX-4000", "v2.11")
    }

    #[test]
    fn test_basic_response_round_trip() {
        let ident = sample();
        let pdu = ident.build_response(1, 0, MAX_PDU_SIZE).unwrap();

        let decoded = DeviceIdResponse::decode(&pdu).unwrap();
        assert_eq!(decoded.read_code, 1);
        assert!(!decoded.more_follows);
        assert_eq!(decoded.objects.len(), 3);
        assert_eq!(decoded.objects[0], (0x00, b"Acme Automation".to_vec()));
        assert_eq!(decoded.objects[1], (0x01, b"AMX-4000".to_vec()));
        assert_eq!(decoded.objects[2], (0x02, b"v2.11".to_vec()));
    }

    #[test]
    fn test_conformity_level_tracks_categories() {
        let mut ident = sample();
        assert_eq!(ident.conformity_level(), 0x81);

        ident.set_object(0x03, "https://acme.example");
        assert_eq!(ident.conformity_level(), 0x82);

        ident.set_object(0x80, "site 7");
        assert_eq!(ident.conformity_level(), 0x83);
    }

    #[test]
    fn test_truncation_sets_cursor_and_more_follows() {
        let mut ident = sample();
        ident.set_object(OBJECT_VENDOR_NAME, vec![b'x'; 60]);
        ident.set_object(OBJECT_PRODUCT_CODE, vec![b'y'; 60]);
        ident.set_object(OBJECT_REVISION, vec![b'z'; 60]);

        // Budget holds the header and only the first object
        let pdu = ident.build_response(1, 0, 80).unwrap();
        let first = DeviceIdResponse::decode(&pdu).unwrap();
        assert!(first.more_follows);
        assert_eq!(first.next_object_id, OBJECT_PRODUCT_CODE);
        assert_eq!(first.objects.len(), 1);

        // Resume from the cursor; collect the rest over further round trips
        let pdu = ident
            .build_response(1, first.next_object_id, MAX_PDU_SIZE)
            .unwrap();
        let rest = DeviceIdResponse::decode(&pdu).unwrap();
        assert!(!rest.more_follows);
        assert_eq!(rest.objects.len(), 2);
        assert_eq!(rest.objects[0].0, OBJECT_PRODUCT_CODE);
    }

    #[test]
    fn test_specific_access() {
        let ident = sample();
        let pdu = ident.build_response(4, OBJECT_REVISION, MAX_PDU_SIZE).unwrap();
        let decoded = DeviceIdResponse::decode(&pdu).unwrap();
        assert_eq!(decoded.objects, vec![(OBJECT_REVISION, b"v2.11".to_vec())]);

        assert_eq!(
            ident.build_response(4, 0x55, MAX_PDU_SIZE).unwrap_err(),
            ExceptionCode::IllegalDataAddress
        );
    }

    #[test]
    fn test_illegal_read_code() {
        let ident = sample();
        assert_eq!(
            ident.build_response(9, 0, MAX_PDU_SIZE).unwrap_err(),
            ExceptionCode::IllegalDataValue
        );
    }

    #[test]
    fn test_basic_stream_with_out_of_category_cursor() {
        let mut ident = sample();
        ident.set_object(0x04, "Widget 9");
        // Basic access cannot start at a regular object even though it exists
        let pdu = ident.build_response(1, 0x04, MAX_PDU_SIZE).unwrap();
        let decoded = DeviceIdResponse::decode(&pdu).unwrap();
        assert_eq!(decoded.objects[0].0, OBJECT_VENDOR_NAME);
        assert_eq!(decoded.objects.len(), 3);
    }

    #[test]
    fn test_stream_restarts_on_absent_cursor() {
        let ident = sample();
        // Object 0x05 does not exist; stream restarts at vendor name
        let pdu = ident.build_response(2, 0x05, MAX_PDU_SIZE).unwrap();
        let decoded = DeviceIdResponse::decode(&pdu).unwrap();
        assert_eq!(decoded.objects[0].0, OBJECT_VENDOR_NAME);
    }
}
