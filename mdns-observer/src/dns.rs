//! Adapter over `hickory-proto` for the parts of the DNS wire format the
//! observer and transport need: whole-message decode/encode, header-only
//! validity checks, and flattening of cache-relevant records.

use std::net::IpAddr;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use shared::{TxtRecord, TxtValue};
use shared::protocol::normalize_name;
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;
pub const RCODE_OK: u8 = 0;

/// Parse a full DNS message. Malformed input yields `None`.
pub fn decode(bytes: &[u8]) -> Option<Message> {
    Message::from_vec(bytes).ok()
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.to_vec().map_err(|e| Error::Encode(e.to_string()))
}

/// Check fixed header fields without parsing the body.
pub fn header_matches(bytes: &[u8], id: Option<u16>, qr: Option<bool>, rcode: Option<u8>) -> bool {
    if bytes.len() < HEADER_LEN {
        return false;
    }

    if let Some(id) = id {
        if u16::from_be_bytes([bytes[0], bytes[1]]) != id {
            return false;
        }
    }

    let fields = u16::from_be_bytes([bytes[2], bytes[3]]);

    if let Some(qr) = qr {
        if qr != (fields & 0x8000 != 0) {
            return false;
        }
    }

    if let Some(rcode) = rcode {
        if rcode != (fields & 0x000f) as u8 {
            return false;
        }
    }

    true
}

pub fn is_valid_query(bytes: &[u8]) -> bool {
    header_matches(bytes, None, Some(false), None)
}

pub fn is_valid_reply(bytes: &[u8], id: Option<u16>, rcode: Option<u8>) -> bool {
    header_matches(bytes, id, Some(true), rcode)
}

/// Multicast question for every instance of `service_type`.
pub fn ptr_query(service_type: &str) -> Result<Message> {
    let name = Name::from_utf8(format!("{}.", normalize_name(service_type)))
        .map_err(|e| Error::InvalidArgument(format!("bad service type {service_type}: {e}")))?;

    let mut message = Message::new();
    message
        .set_message_type(MessageType::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name, RecordType::PTR));
    Ok(message)
}

/// Cache-relevant record carried by an mDNS response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    /// Owner name, normalized
    pub name: String,
    /// Owner name as announced
    pub display_name: String,
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(TxtRecord),
    Addr(IpAddr),
}

impl ResourceRecord {
    fn from_record(record: &Record) -> Option<Self> {
        let data = match record.data()? {
            RData::SRV(srv) => RecordData::Srv {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: normalize_name(&srv.target().to_utf8()),
            },
            RData::TXT(txt) => RecordData::Txt(parse_txt(txt.txt_data())),
            RData::A(a) => RecordData::Addr(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => RecordData::Addr(IpAddr::V6(aaaa.0)),
            _ => return None,
        };

        let display_name = record.name().to_utf8().trim_end_matches('.').to_string();
        Some(Self {
            name: normalize_name(&display_name),
            display_name,
            ttl: record.ttl(),
            cache_flush: record.mdns_cache_flush(),
            data,
        })
    }
}

/// Answers followed by additionals; mDNS caches both sections alike.
pub fn cache_records(message: &Message) -> Vec<ResourceRecord> {
    message
        .answers()
        .iter()
        .chain(message.additionals())
        .filter_map(ResourceRecord::from_record)
        .collect()
}

/// Split each TXT string on its first `=`. A bare key is a flag; strings
/// with an empty key are ignored.
pub fn parse_txt(strings: &[Box<[u8]>]) -> TxtRecord {
    let mut txt = TxtRecord::new();

    for raw in strings {
        let entry = String::from_utf8_lossy(raw);
        match entry.split_once('=') {
            Some(("", _)) => continue,
            Some((key, value)) => txt.insert(key, TxtValue::Text(value.to_string())),
            None if entry.is_empty() => continue,
            None => txt.insert(entry.as_ref(), TxtValue::Flag(true)),
        }
    }

    txt
}
