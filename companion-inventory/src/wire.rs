//! Inventory wire format.
//!
//! The stream is the body of a `UidData` protobuf message: a sequence of
//! field-1 length-delimited `ApplicationInfo` submessages. Each record is
//! self-framed (key, length, payload), so a consumer can decode records one
//! at a time and treats channel closure at a record boundary as
//! end-of-stream.
//!
//! ```text
//! ApplicationInfo {
//!   1: int32  uid
//!   2: int64  version
//!   3: string version_string
//!   4: string package_name
//!   5: string installer
//! }
//! ```

use std::io::{BufReader, ErrorKind, Read};

use prost::encoding::{decode_key, decode_varint, WireType};
use prost::Message;

use companion_core::AppInventoryRecord;

use crate::error::{io_err, InventoryError};

/// Field number of the repeated `ApplicationInfo` in the enclosing message.
pub const APPLICATION_INFO_FIELD: u32 = 1;

/// Longest legal varint encoding.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on one encoded record. Real records are a few hundred bytes.
pub const MAX_RECORD_LEN: u64 = 64 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct ApplicationInfo {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(int64, tag = "2")]
    pub version: i64,
    #[prost(string, tag = "3")]
    pub version_string: String,
    #[prost(string, tag = "4")]
    pub package_name: String,
    #[prost(string, tag = "5")]
    pub installer: String,
}

impl From<&AppInventoryRecord> for ApplicationInfo {
    fn from(record: &AppInventoryRecord) -> Self {
        Self {
            uid: record.uid,
            version: record.version_code,
            version_string: record.version_name.clone(),
            package_name: record.package_name.clone(),
            installer: record.installer_package_name.clone(),
        }
    }
}

impl From<ApplicationInfo> for AppInventoryRecord {
    fn from(info: ApplicationInfo) -> Self {
        Self {
            uid: info.uid,
            version_code: info.version,
            version_name: info.version_string,
            package_name: info.package_name,
            installer_package_name: info.installer,
        }
    }
}

/// Append one framed record to `buf`.
pub fn encode_record(record: &AppInventoryRecord, buf: &mut Vec<u8>) {
    let info = ApplicationInfo::from(record);
    prost::encoding::message::encode(APPLICATION_INFO_FIELD, &info, buf);
}

/// Incremental decoder over the read end of an inventory channel.
///
/// Yields one record per framed entry and stops at channel closure.
pub struct InventoryReader<R> {
    inner: BufReader<R>,
    finished: bool,
}

impl<R: Read> InventoryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            finished: false,
        }
    }

    /// Read the next record. `Ok(None)` means the producer closed the channel.
    pub fn read_record(&mut self) -> Result<Option<AppInventoryRecord>, InventoryError> {
        let Some(key) = self.read_varint_bytes()? else {
            return Ok(None);
        };
        let (tag, wire_type) = decode_key(&mut key.as_slice())?;
        if tag != APPLICATION_INFO_FIELD || wire_type != WireType::LengthDelimited {
            return Err(InventoryError::Malformed(format!(
                "unexpected field {tag} ({wire_type:?}) in inventory stream"
            )));
        }

        let Some(len) = self.read_varint_bytes()? else {
            return Err(InventoryError::Truncated);
        };
        let len = decode_varint(&mut len.as_slice())?;
        if len > MAX_RECORD_LEN {
            return Err(InventoryError::Malformed(format!(
                "record length {len} exceeds {MAX_RECORD_LEN}"
            )));
        }

        let mut payload = Vec::new();
        (&mut self.inner)
            .take(len)
            .read_to_end(&mut payload)
            .map_err(|err| io_err("reading inventory record", err))?;
        if (payload.len() as u64) < len {
            return Err(InventoryError::Truncated);
        }

        let info = ApplicationInfo::decode(payload.as_slice())?;
        Ok(Some(info.into()))
    }

    /// Raw bytes of the next varint. `None` on a clean end-of-stream.
    fn read_varint_bytes(&mut self) -> Result<Option<Vec<u8>>, InventoryError> {
        let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
        loop {
            let mut byte = [0u8; 1];
            match self.inner.read(&mut byte) {
                Ok(0) if bytes.is_empty() => return Ok(None),
                Ok(0) => return Err(InventoryError::Truncated),
                Ok(_) => {
                    bytes.push(byte[0]);
                    if byte[0] & 0x80 == 0 {
                        return Ok(Some(bytes));
                    }
                    if bytes.len() == MAX_VARINT_LEN {
                        return Err(InventoryError::Malformed("varint too long".to_string()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_err("reading inventory stream", err)),
            }
        }
    }
}

impl<R: Read> Iterator for InventoryReader<R> {
    type Item = Result<AppInventoryRecord, InventoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
