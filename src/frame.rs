// Copyright 2020 Joyent, Inc.

//! Binary framing for the native protocol.
//!
//! Every message travels in a frame with a fixed header followed by a body of
//! `length` bytes:
//!
//! | version | flags | stream | opcode | length |
//! |---------|-------|--------|--------|--------|
//! | 1 byte  | 1 byte| 1 or 2 | 1 byte | 4 bytes|
//!
//! The top bit of the version byte marks a response. Protocol versions 1 and 2
//! use a one byte stream id, versions 3 and up use two bytes. Negative stream
//! ids are reserved for messages the server pushes on its own.
//!
//! The flags byte announces what a response body carries ahead of the message
//! itself. See [`Envelope`].

pub mod message;

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

pub use message::{
    ColumnSpec, ColumnType, Envelope, Event, QueryParams, QueryResult, Request, Response,
    Row, Rows, SchemaChange, StatusChange, TopologyChange,
};

pub const MIN_PROTOCOL_VERSION: u8 = 1;
pub const MAX_PROTOCOL_VERSION: u8 = 4;

/// The stream id server-pushed events arrive on.
pub const EVENT_STREAM: i16 = -1;

// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const RESPONSE_FLAG: u8 = 0x80;

pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Result<Opcode, Error> {
        let op = match b {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            _ => return Err(Error::Protocol(format!("unknown opcode {:#04x}", b))),
        };
        Ok(op)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub response: bool,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: usize,
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

/// The size of a frame header for the given protocol version.
pub fn header_len(version: u8) -> usize {
    if version > 2 {
        9
    } else {
        8
    }
}

/// The number of concurrently usable stream ids for a protocol version.
pub fn max_streams(version: u8) -> usize {
    if version > 2 {
        32768
    } else {
        128
    }
}

pub fn encode_frame(
    version: u8,
    response: bool,
    stream: i16,
    opcode: Opcode,
    body: &[u8],
) -> Vec<u8> {
    encode_frame_with_flags(version, response, 0, stream, opcode, body)
}

pub fn encode_frame_with_flags(
    version: u8,
    response: bool,
    flags: u8,
    stream: i16,
    opcode: Opcode,
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(version) + body.len());
    buf.push(if response { version | RESPONSE_FLAG } else { version });
    buf.push(flags);
    if version > 2 {
        let mut s = [0u8; 2];
        BigEndian::write_i16(&mut s, stream);
        buf.extend_from_slice(&s);
    } else {
        buf.push(stream as i8 as u8);
    }
    buf.push(opcode as u8);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, body.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(body);
    buf
}

/// Read the header of the next frame.
pub fn read_header<R: Read>(r: &mut R) -> Result<FrameHeader, Error> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;

    let version = first[0] & !RESPONSE_FLAG;
    let response = first[0] & RESPONSE_FLAG != 0;
    if version < MIN_PROTOCOL_VERSION || version > MAX_PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported frame version {}",
            version
        )));
    }

    let mut rest = [0u8; 8];
    let rest = &mut rest[..header_len(version) - 1];
    r.read_exact(rest)?;

    let flags = rest[0];
    let (stream, op_at) = if version > 2 {
        (BigEndian::read_i16(&rest[1..3]), 3)
    } else {
        (i16::from(rest[1] as i8), 2)
    };
    let opcode = Opcode::from_u8(rest[op_at])?;
    let length = BigEndian::read_u32(&rest[op_at + 1..op_at + 5]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("frame too large: {} bytes", length)));
    }

    Ok(FrameHeader {
        version,
        response,
        flags,
        stream,
        opcode,
        length,
    })
}

/// Read one complete frame.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame, Error> {
    let header = read_header(r)?;
    let mut body = vec![0u8; header.length];
    r.read_exact(&mut body)?;
    Ok(Frame { header, body })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn header_sizes_follow_version() {
        let v2 = encode_frame(2, false, 5, Opcode::Options, &[]);
        let v4 = encode_frame(4, false, 5, Opcode::Options, &[]);
        assert_eq!(v2.len(), 8);
        assert_eq!(v4.len(), 9);
    }

    #[test]
    fn frames_read_back() {
        for version in MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION {
            let bytes = encode_frame(version, true, EVENT_STREAM, Opcode::Event, b"abc");
            let frame = read_frame(&mut Cursor::new(bytes)).unwrap();
            assert_eq!(frame.header.version, version);
            assert!(frame.header.response);
            assert_eq!(frame.header.stream, EVENT_STREAM);
            assert_eq!(frame.header.opcode, Opcode::Event);
            assert_eq!(frame.body, b"abc".to_vec());
        }
    }

    #[test]
    fn flags_survive_the_header() {
        let flags = FLAG_TRACING | FLAG_WARNING;
        let bytes = encode_frame_with_flags(4, true, flags, 3, Opcode::Result, &[]);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.flags, flags);
        assert_eq!(header.stream, 3);
    }

    #[test]
    fn large_stream_ids_need_two_bytes() {
        let bytes = encode_frame(3, false, 30000, Opcode::Query, &[]);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.stream, 30000);
    }

    #[test]
    fn bad_headers_are_protocol_errors() {
        let mut bytes = encode_frame(4, false, 1, Opcode::Query, &[]);
        bytes[0] = 0x09;
        match read_header(&mut Cursor::new(bytes)) {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut bytes = encode_frame(4, false, 1, Opcode::Query, &[]);
        bytes[4] = 0x42;
        match read_header(&mut Cursor::new(bytes)) {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn truncated_frames_are_io_errors() {
        let bytes = encode_frame(4, false, 1, Opcode::Query, b"hello");
        match read_frame(&mut Cursor::new(&bytes[..11])) {
            Err(Error::Io(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
