//! HPACK header compression (RFC 7541).
//!
//! The encoder indexes every field it sends into a 4096-byte dynamic table and
//! Huffman-codes strings whenever that is shorter, which is what browsers
//! put on the wire. When the peer allows a smaller table, fields are written
//! as literals without indexing so the peer's table is never touched.
//!
//! The decoder never panics on peer input. Every malformed block surfaces as
//! a COMPRESSION_ERROR.

pub mod huffman;
pub mod table;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::fingerprint::http2::DEFAULT_HEADER_TABLE_SIZE;
use crate::transport::h2::frame::ErrorCode;

use self::huffman::HuffmanError;
use self::table::{DynamicTable, Match};

/// Per-field overhead counted toward header list size (RFC 9113 Section 6.5.2).
pub const FIELD_OVERHEAD: u64 = 32;

/// Largest integer accepted from a peer.
const MAX_INTEGER: u64 = u32::MAX as u64;

/// Size of a field as counted against SETTINGS_MAX_HEADER_LIST_SIZE.
pub fn field_size(name: &str, value: &str) -> u64 {
    name.len() as u64 + value.len() as u64 + FIELD_OVERHEAD
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("table size update to {0} exceeds the advertised limit")]
    TableSizeTooLarge(usize),
    #[error("table size update after a header field")]
    LateTableSizeUpdate,
    #[error(transparent)]
    Huffman(#[from] HuffmanError),
}

impl From<HpackError> for Error {
    fn from(e: HpackError) -> Self {
        Error::protocol(
            ErrorCode::CompressionError,
            format!("HPACK decode error: {}", e),
        )
    }
}

/// Request header encoder.
pub struct HpackEncoder {
    table: DynamicTable,
    indexing: bool,
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(DEFAULT_HEADER_TABLE_SIZE as usize),
            indexing: true,
        }
    }

    /// Bound the dynamic table by the smaller of the peer's HEADER_TABLE_SIZE and
    /// our own limit. Once disabled, indexing stays off for the connection.
    pub fn set_max_table_size(&mut self, peer: u32, local_limit: u32) {
        if peer.min(local_limit) < DEFAULT_HEADER_TABLE_SIZE {
            self.indexing = false;
        }
    }

    /// Encode fields, in order, into one header block.
    pub fn encode(&mut self, fields: &[(String, String)]) -> Bytes {
        let mut out = Vec::new();
        for (name, value) in fields {
            self.encode_field(&mut out, name.as_bytes(), value.as_bytes());
        }
        Bytes::from(out)
    }

    fn encode_field(&mut self, out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
        let found = if self.indexing {
            self.table.find(name, value)
        } else {
            // Only static entries; the dynamic table stays empty.
            match self.table.find(name, value) {
                Some(Match::Field(i) | Match::Name(i)) if i > table::STATIC_LEN => None,
                other => other,
            }
        };
        let name_index = match found {
            Some(Match::Field(index)) => {
                encode_integer(out, index, 7, 0x80);
                return;
            }
            Some(Match::Name(index)) => index,
            None => 0,
        };
        if self.indexing {
            // Literal with incremental indexing (Section 6.2.1).
            encode_integer(out, name_index, 6, 0x40);
        } else {
            // Literal without indexing (Section 6.2.2).
            encode_integer(out, name_index, 4, 0x00);
        }
        if name_index == 0 {
            encode_string(out, name);
        }
        encode_string(out, value);
        if self.indexing {
            self.table.insert(name.to_vec(), value.to_vec());
        }
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_integer(out: &mut Vec<u8>, mut value: usize, prefix_bits: u8, first: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(first | value as u8);
        return;
    }
    out.push(first | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.push((value % 128 + 128) as u8);
        value /= 128;
    }
    out.push(value as u8);
}

/// String literal, Huffman-coded only when strictly shorter.
fn encode_string(out: &mut Vec<u8>, s: &[u8]) {
    let huffman_len = huffman::encoded_len(s);
    if huffman_len < s.len() {
        encode_integer(out, huffman_len, 7, 0x80);
        huffman::encode(s, out);
    } else {
        encode_integer(out, s.len(), 7, 0x00);
        out.extend_from_slice(s);
    }
}

fn decode_integer(buf: &mut &[u8], prefix_bits: u8) -> std::result::Result<usize, HpackError> {
    let (&first, rest) = buf.split_first().ok_or(HpackError::Truncated)?;
    *buf = rest;
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = first as u64 & max_prefix;
    if value < max_prefix {
        return Ok(value as usize);
    }
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf.split_first().ok_or(HpackError::Truncated)?;
        *buf = rest;
        value += ((byte & 0x7f) as u64) << shift;
        if value > MAX_INTEGER {
            return Err(HpackError::IntegerOverflow);
        }
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }
        shift += 7;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
    }
}

fn decode_string(buf: &mut &[u8]) -> std::result::Result<Vec<u8>, HpackError> {
    let huffman = buf.first().is_some_and(|b| b & 0x80 != 0);
    let len = decode_integer(buf, 7)?;
    if len > buf.len() {
        return Err(HpackError::Truncated);
    }
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    if huffman {
        Ok(huffman::decode(raw)?)
    } else {
        Ok(raw.to_vec())
    }
}

/// Response header decoder.
pub struct HpackDecoder {
    table: DynamicTable,
    /// HEADER_TABLE_SIZE we advertised; the peer may not exceed it.
    table_limit: usize,
    max_header_list_size: u64,
}

impl HpackDecoder {
    /// `table_size` is the HEADER_TABLE_SIZE we advertised; `max_header_list_size`
    /// the MAX_HEADER_LIST_SIZE.
    pub fn new(table_size: u32, max_header_list_size: u32) -> Self {
        Self {
            table: DynamicTable::new(table_size as usize),
            table_limit: table_size as usize,
            max_header_list_size: max_header_list_size as u64,
        }
    }

    /// Decode a complete header block.
    ///
    /// A malformed block is a connection COMPRESSION_ERROR. An oversized list is
    /// reported through [`DecodedBlock::oversized`] so only the stream fails;
    /// the block is still fully decoded to keep the table in sync, but its
    /// fields are dropped.
    pub fn decode(&mut self, block: &[u8]) -> Result<DecodedBlock> {
        Ok(self.decode_block(block)?)
    }

    fn decode_block(&mut self, mut buf: &[u8]) -> std::result::Result<DecodedBlock, HpackError> {
        let mut fields = Vec::new();
        let mut size = 0u64;
        let mut oversized = false;
        let mut seen_field = false;
        while let Some(&first) = buf.first() {
            let (name, value) = if first & 0x80 != 0 {
                let index = decode_integer(&mut buf, 7)?;
                let (name, value) = self
                    .table
                    .get(index)
                    .ok_or(HpackError::InvalidIndex(index))?;
                (name.to_vec(), value.to_vec())
            } else if first & 0x40 != 0 {
                let (name, value) = self.decode_literal(&mut buf, 6)?;
                self.table.insert(name.clone(), value.clone());
                (name, value)
            } else if first & 0x20 != 0 {
                if seen_field {
                    return Err(HpackError::LateTableSizeUpdate);
                }
                let new_size = decode_integer(&mut buf, 5)?;
                if new_size > self.table_limit {
                    return Err(HpackError::TableSizeTooLarge(new_size));
                }
                self.table.set_max_size(new_size);
                continue;
            } else {
                // Without indexing or never indexed; both have a 4-bit prefix.
                self.decode_literal(&mut buf, 4)?
            };
            seen_field = true;

            size += name.len() as u64 + value.len() as u64 + FIELD_OVERHEAD;
            if size > self.max_header_list_size {
                oversized = true;
                fields.clear();
            }
            if !oversized {
                fields.push((
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            }
        }
        Ok(DecodedBlock { fields, oversized })
    }

    fn decode_literal(
        &self,
        buf: &mut &[u8],
        prefix_bits: u8,
    ) -> std::result::Result<(Vec<u8>, Vec<u8>), HpackError> {
        let index = decode_integer(buf, prefix_bits)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            self.table
                .get(index)
                .ok_or(HpackError::InvalidIndex(index))?
                .0
                .to_vec()
        };
        let value = decode_string(buf)?;
        Ok((name, value))
    }
}

/// Fields of one decoded header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub fields: Vec<(String, String)>,
    pub oversized: bool,
}
