//! FastCGI record framing
//!
//! Only the subset a responder client needs: begin-request, params and stdin
//! going out, stdout, stderr and end-request coming back.
//! Reference: https://fastcgi-archives.github.io/FastCGI_Specification.html

use std::io::{self, Read, Write};

pub const FCGI_VERSION_1: u8 = 1;

/// Largest content a single record can carry
pub const MAX_CONTENT_LENGTH: usize = 0xffff;

/// Role requested in BEGIN_REQUEST
pub const FCGI_RESPONDER: u16 = 1;

/// FastCGI record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::BeginRequest),
            2 => Some(Self::AbortRequest),
            3 => Some(Self::EndRequest),
            4 => Some(Self::Params),
            5 => Some(Self::Stdin),
            6 => Some(Self::Stdout),
            7 => Some(Self::Stderr),
            8 => Some(Self::Data),
            9 => Some(Self::GetValues),
            10 => Some(Self::GetValuesResult),
            11 => Some(Self::UnknownType),
            _ => None,
        }
    }
}

/// Protocol status carried by END_REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
    Other(u8),
}

impl From<u8> for ProtocolStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::RequestComplete,
            1 => Self::CantMpxConn,
            2 => Self::Overloaded,
            3 => Self::UnknownRole,
            other => Self::Other(other),
        }
    }
}

/// A FastCGI record header (8 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub const SIZE: usize = 8;

    pub fn from_bytes(buf: &[u8; 8]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let id = self.request_id.to_be_bytes();
        let cl = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            cl[0],
            cl[1],
            self.padding_length,
            0, // reserved
        ]
    }
}

/// A complete FastCGI record
#[derive(Debug, Clone)]
pub struct Record {
    pub header: Header,
    pub content: Vec<u8>,
}

impl Record {
    /// Build a record, padding the content to an 8-byte boundary.
    ///
    /// `content` must not exceed [`MAX_CONTENT_LENGTH`].
    pub fn new(record_type: RecordType, request_id: u16, content: &[u8]) -> Self {
        debug_assert!(content.len() <= MAX_CONTENT_LENGTH);
        let padding = (8 - content.len() % 8) % 8;
        Self {
            header: Header {
                version: FCGI_VERSION_1,
                record_type: record_type as u8,
                request_id,
                content_length: content.len() as u16,
                padding_length: padding as u8,
            },
            content: content.to_vec(),
        }
    }

    pub fn begin_request(request_id: u16, role: u16, keep_conn: bool) -> Self {
        let role = role.to_be_bytes();
        let flags = u8::from(keep_conn);
        Self::new(
            RecordType::BeginRequest,
            request_id,
            &[role[0], role[1], flags, 0, 0, 0, 0, 0],
        )
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.header.record_type)
    }

    /// Read a record from a stream.
    ///
    /// A clean EOF before the first header byte is reported as
    /// `UnexpectedEof` like any other truncation.
    pub fn read_from(stream: &mut impl Read) -> io::Result<Self> {
        let mut header_buf = [0u8; Header::SIZE];
        stream.read_exact(&mut header_buf)?;
        let header = Header::from_bytes(&header_buf);

        let mut content = vec![0u8; header.content_length as usize];
        if !content.is_empty() {
            stream.read_exact(&mut content)?;
        }

        if header.padding_length > 0 {
            let mut padding = vec![0u8; header.padding_length as usize];
            stream.read_exact(&mut padding)?;
        }

        Ok(Self { header, content })
    }

    pub fn write_to(&self, stream: &mut impl Write) -> io::Result<()> {
        stream.write_all(&self.header.to_bytes())?;
        stream.write_all(&self.content)?;
        if self.header.padding_length > 0 {
            let padding = [0u8; 8];
            stream.write_all(&padding[..self.header.padding_length as usize])?;
        }
        Ok(())
    }
}

/// Body of an END_REQUEST record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() < 8 {
            return None;
        }
        Some(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: ProtocolStatus::from(content[4]),
        })
    }
}

/// Encode a name-value pair for a PARAMS stream
pub fn encode_param(buf: &mut Vec<u8>, name: &str, value: &str) {
    encode_length(buf, name.len());
    encode_length(buf, value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Encode a length (1 or 4 bytes)
fn encode_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.push(((len >> 24) as u8) | 0x80);
        buf.push((len >> 16) as u8);
        buf.push((len >> 8) as u8);
        buf.push(len as u8);
    }
}

/// Write a whole stream (PARAMS, STDIN) split into records, followed by
/// the empty record that terminates it.
pub fn write_stream(
    out: &mut impl Write,
    record_type: RecordType,
    request_id: u16,
    data: &[u8],
) -> io::Result<()> {
    for chunk in data.chunks(MAX_CONTENT_LENGTH) {
        Record::new(record_type, request_id, chunk).write_to(out)?;
    }
    Record::new(record_type, request_id, &[]).write_to(out)
}
