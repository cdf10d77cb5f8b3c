// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::{Error, ServerError};
use crate::frame::{
    Frame, Opcode, FLAG_COMPRESSION, FLAG_CUSTOM_PAYLOAD, FLAG_TRACING, FLAG_WARNING,
};

pub const CQL_VERSION: &str = "3.0.0";

pub const TOPOLOGY_CHANGE: &str = "TOPOLOGY_CHANGE";
pub const STATUS_CHANGE: &str = "STATUS_CHANGE";
pub const SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";

const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

const ROWS_GLOBAL_TABLE_SPEC: i32 = 0x0001;
const QUERY_FLAG_VALUES: u8 = 0x01;

//
// Body encoding helpers. All integers are big-endian.
//

fn put_short(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_int(buf: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_short(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_long_string(buf: &mut Vec<u8>, s: &str) {
    put_int(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_short_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_short(buf, b.len() as u16);
    buf.extend_from_slice(b);
}

fn put_bytes(buf: &mut Vec<u8>, b: Option<&[u8]>) {
    match b {
        Some(b) => {
            put_int(buf, b.len() as i32);
            buf.extend_from_slice(b);
        }
        None => put_int(buf, -1),
    }
}

fn put_string_list(buf: &mut Vec<u8>, list: &[String]) {
    put_short(buf, list.len() as u16);
    for s in list {
        put_string(buf, s);
    }
}

fn put_inet(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(16);
            buf.extend_from_slice(&ip.octets());
        }
    }
    put_int(buf, i32::from(addr.port()));
}

/// A cursor over a frame body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Protocol(String::from("frame body truncated")));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn read_short(&mut self) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_int(&mut self) -> Result<i32, Error> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn read_len(&mut self) -> Result<usize, Error> {
        let n = self.read_int()?;
        if n < 0 {
            return Err(Error::Protocol(format!("negative length {}", n)));
        }
        Ok(n as usize)
    }

    fn read_utf8(&mut self, n: usize) -> Result<String, Error> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol(String::from("invalid UTF-8 string")))
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let n = self.read_short()? as usize;
        self.read_utf8(n)
    }

    fn read_long_string(&mut self) -> Result<String, Error> {
        let n = self.read_len()?;
        self.read_utf8(n)
    }

    fn read_short_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let n = self.read_short()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn read_bytes(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let n = self.read_int()?;
        if n < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(n as usize)?.to_vec()))
    }

    fn read_string_list(&mut self) -> Result<Vec<String>, Error> {
        let n = self.read_short()?;
        (0..n).map(|_| self.read_string()).collect()
    }

    fn read_string_map(&mut self) -> Result<BTreeMap<String, String>, Error> {
        let n = self.read_short()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            map.insert(k, v);
        }
        Ok(map)
    }

    fn read_string_multimap(&mut self) -> Result<HashMap<String, Vec<String>>, Error> {
        let n = self.read_short()?;
        let mut map = HashMap::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string_list()?;
            map.insert(k, v);
        }
        Ok(map)
    }

    fn read_inet(&mut self) -> Result<SocketAddr, Error> {
        let ip = match self.read_byte()? {
            4 => {
                let b = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => return Err(Error::Protocol(format!("invalid inet length {}", n))),
        };
        let port = self.read_int()?;
        Ok(SocketAddr::new(ip, port as u16))
    }
}

/// The parts of a response body that precede the message, each present only
/// when its header flag is set. They are read in the order the server writes
/// them: tracing id, then warnings, then the custom payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: BTreeMap<String, Option<Vec<u8>>>,
}

impl Envelope {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.tracing_id.is_some() {
            flags |= FLAG_TRACING;
        }
        if !self.warnings.is_empty() {
            flags |= FLAG_WARNING;
        }
        if !self.custom_payload.is_empty() {
            flags |= FLAG_CUSTOM_PAYLOAD;
        }
        flags
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(id) = &self.tracing_id {
            buf.extend_from_slice(id.as_bytes());
        }
        if !self.warnings.is_empty() {
            put_string_list(buf, &self.warnings);
        }
        if !self.custom_payload.is_empty() {
            put_short(buf, self.custom_payload.len() as u16);
            for (k, v) in &self.custom_payload {
                put_string(buf, k);
                put_bytes(buf, v.as_ref().map(Vec::as_slice));
            }
        }
    }

    /// Split `body` into the envelope announced by `flags` and the message
    /// that follows it.
    pub fn decode(flags: u8, body: &[u8]) -> Result<(Envelope, &[u8]), Error> {
        if flags & FLAG_COMPRESSION != 0 {
            return Err(Error::Protocol(String::from(
                "compressed frame on a connection without compression",
            )));
        }
        let mut d = Decoder::new(body);
        let mut env = Envelope::default();
        if flags & FLAG_TRACING != 0 {
            let raw = d.take(16)?;
            env.tracing_id = Some(Uuid::from_slice(raw).map_err(|e| {
                Error::Protocol(format!("invalid tracing id: {}", e))
            })?);
        }
        if flags & FLAG_WARNING != 0 {
            env.warnings = d.read_string_list()?;
        }
        if flags & FLAG_CUSTOM_PAYLOAD != 0 {
            let n = d.read_short()?;
            for _ in 0..n {
                let k = d.read_string()?;
                let v = d.read_bytes()?;
                env.custom_payload.insert(k, v);
            }
        }
        Ok((env, &body[d.pos..]))
    }
}

/// Consistency hint and pre-encoded bound values of a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParams {
    pub consistency: u16,
    pub values: Vec<Option<Vec<u8>>>,
}

impl QueryParams {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_short(buf, self.consistency);
        if self.values.is_empty() {
            buf.push(0);
        } else {
            buf.push(QUERY_FLAG_VALUES);
            self.encode_values(buf);
        }
    }

    fn encode_values(&self, buf: &mut Vec<u8>) {
        put_short(buf, self.values.len() as u16);
        for v in &self.values {
            put_bytes(buf, v.as_ref().map(Vec::as_slice));
        }
    }

    fn decode(d: &mut Decoder) -> Result<Self, Error> {
        let consistency = d.read_short()?;
        let flags = d.read_byte()?;
        let values = if flags & QUERY_FLAG_VALUES != 0 {
            Self::decode_values(d)?
        } else {
            Vec::new()
        };
        Ok(QueryParams {
            consistency,
            values,
        })
    }

    fn decode_values(d: &mut Decoder) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let n = d.read_short()?;
        (0..n).map(|_| d.read_bytes()).collect()
    }
}

/// Messages sent by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Startup(BTreeMap<String, String>),
    Options,
    Query { statement: String, params: QueryParams },
    Prepare(String),
    Execute { id: Vec<u8>, params: QueryParams },
    Register(Vec<String>),
}

impl Request {
    pub fn startup() -> Request {
        let mut options = BTreeMap::new();
        options.insert(String::from("CQL_VERSION"), String::from(CQL_VERSION));
        Request::Startup(options)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup(_) => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare(_) => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Register(_) => Opcode::Register,
        }
    }

    pub fn encode(&self, version: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Startup(options) => {
                put_short(&mut buf, options.len() as u16);
                for (k, v) in options {
                    put_string(&mut buf, k);
                    put_string(&mut buf, v);
                }
            }
            Request::Options => (),
            Request::Query { statement, params } => {
                put_long_string(&mut buf, statement);
                if version == 1 {
                    put_short(&mut buf, params.consistency);
                } else {
                    params.encode(&mut buf);
                }
            }
            Request::Prepare(statement) => put_long_string(&mut buf, statement),
            Request::Execute { id, params } => {
                put_short_bytes(&mut buf, id);
                if version == 1 {
                    params.encode_values(&mut buf);
                    put_short(&mut buf, params.consistency);
                } else {
                    params.encode(&mut buf);
                }
            }
            Request::Register(events) => put_string_list(&mut buf, events),
        }
        buf
    }

    pub fn decode(opcode: Opcode, version: u8, body: &[u8]) -> Result<Request, Error> {
        let mut d = Decoder::new(body);
        let req = match opcode {
            Opcode::Startup => Request::Startup(d.read_string_map()?),
            Opcode::Options => Request::Options,
            Opcode::Query => {
                let statement = d.read_long_string()?;
                let params = if version == 1 {
                    QueryParams {
                        consistency: d.read_short()?,
                        values: Vec::new(),
                    }
                } else {
                    QueryParams::decode(&mut d)?
                };
                Request::Query { statement, params }
            }
            Opcode::Prepare => Request::Prepare(d.read_long_string()?),
            Opcode::Execute => {
                let id = d.read_short_bytes()?;
                let params = if version == 1 {
                    let values = QueryParams::decode_values(&mut d)?;
                    QueryParams {
                        consistency: d.read_short()?,
                        values,
                    }
                } else {
                    QueryParams::decode(&mut d)?
                };
                Request::Execute { id, params }
            }
            Opcode::Register => Request::Register(d.read_string_list()?),
            other => {
                return Err(Error::Protocol(format!(
                    "{:?} is not a request opcode",
                    other
                )))
            }
        };
        Ok(req)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Int,
    Uuid,
    Varchar,
    Timeuuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Other(u16),
}

impl ColumnType {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ColumnType::Custom(name) => {
                put_short(buf, 0x0000);
                put_string(buf, name);
            }
            ColumnType::Ascii => put_short(buf, 0x0001),
            ColumnType::BigInt => put_short(buf, 0x0002),
            ColumnType::Blob => put_short(buf, 0x0003),
            ColumnType::Boolean => put_short(buf, 0x0004),
            ColumnType::Int => put_short(buf, 0x0009),
            ColumnType::Uuid => put_short(buf, 0x000C),
            ColumnType::Varchar => put_short(buf, 0x000D),
            ColumnType::Timeuuid => put_short(buf, 0x000F),
            ColumnType::Inet => put_short(buf, 0x0010),
            ColumnType::List(inner) => {
                put_short(buf, 0x0020);
                inner.encode(buf);
            }
            ColumnType::Map(k, v) => {
                put_short(buf, 0x0021);
                k.encode(buf);
                v.encode(buf);
            }
            ColumnType::Set(inner) => {
                put_short(buf, 0x0022);
                inner.encode(buf);
            }
            ColumnType::Other(id) => put_short(buf, *id),
        }
    }

    fn decode(d: &mut Decoder) -> Result<Self, Error> {
        let t = match d.read_short()? {
            0x0000 => ColumnType::Custom(d.read_string()?),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::BigInt,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0009 => ColumnType::Int,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0020 => ColumnType::List(Box::new(ColumnType::decode(d)?)),
            0x0021 => {
                let k = ColumnType::decode(d)?;
                let v = ColumnType::decode(d)?;
                ColumnType::Map(Box::new(k), Box::new(v))
            }
            0x0022 => ColumnType::Set(Box::new(ColumnType::decode(d)?)),
            other => ColumnType::Other(other),
        };
        Ok(t)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub kind: ColumnType,
}

impl ColumnSpec {
    pub fn new(keyspace: &str, table: &str, name: &str, kind: ColumnType) -> Self {
        ColumnSpec {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            name: name.to_string(),
            kind,
        }
    }
}

/// The rows returned by a query. Cell values are left in their wire encoding;
/// `Row` offers decoders for the handful of types the client itself reads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl Rows {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Rows {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Option<Vec<u8>>>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        let columns = &self.columns;
        self.rows.iter().map(move |cells| Row { columns, cells })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        // A single keyspace/table pair is written for the whole result.
        put_int(buf, ROWS_GLOBAL_TABLE_SPEC);
        put_int(buf, self.columns.len() as i32);
        let (ks, table) = self
            .columns
            .first()
            .map(|c| (c.keyspace.as_str(), c.table.as_str()))
            .unwrap_or(("", ""));
        put_string(buf, ks);
        put_string(buf, table);
        for col in &self.columns {
            put_string(buf, &col.name);
            col.kind.encode(buf);
        }
        put_int(buf, self.rows.len() as i32);
        for row in &self.rows {
            for cell in row {
                put_bytes(buf, cell.as_ref().map(Vec::as_slice));
            }
        }
    }

    fn decode(d: &mut Decoder) -> Result<Self, Error> {
        let flags = d.read_int()?;
        let count = d.read_len()?;
        let global = if flags & ROWS_GLOBAL_TABLE_SPEC != 0 {
            Some((d.read_string()?, d.read_string()?))
        } else {
            None
        };

        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let (keyspace, table) = match &global {
                Some((ks, t)) => (ks.clone(), t.clone()),
                None => (d.read_string()?, d.read_string()?),
            };
            let name = d.read_string()?;
            let kind = ColumnType::decode(d)?;
            columns.push(ColumnSpec {
                keyspace,
                table,
                name,
                kind,
            });
        }

        let nrows = d.read_len()?;
        let mut rows = Vec::with_capacity(nrows.min(1024));
        for _ in 0..nrows {
            let row = (0..count)
                .map(|_| d.read_bytes())
                .collect::<Result<Vec<_>, Error>>()?;
            rows.push(row);
        }
        Ok(Rows { columns, rows })
    }
}

/// A borrowed view of one row.
#[derive(Clone, Copy, Debug)]
pub struct Row<'a> {
    columns: &'a [ColumnSpec],
    cells: &'a [Option<Vec<u8>>],
}

impl<'a> Row<'a> {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// The raw cell for a column; `None` if the column is absent or null.
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.cells.get(idx)?.as_ref().map(Vec::as_slice)
    }

    pub fn get_text(&self, name: &str) -> Result<Option<String>, Error> {
        match self.get(name) {
            Some(raw) => value::decode_text(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i32>, Error> {
        match self.get(name) {
            Some(raw) => value::decode_int(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_inet(&self, name: &str) -> Result<Option<IpAddr>, Error> {
        match self.get(name) {
            Some(raw) => value::decode_inet(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_uuid(&self, name: &str) -> Result<Option<Uuid>, Error> {
        match self.get(name) {
            Some(raw) => value::decode_uuid(raw).map(Some),
            None => Ok(None),
        }
    }

    /// A `set<text>` column; null and absent columns read as empty.
    pub fn get_string_set(&self, name: &str) -> Result<Vec<String>, Error> {
        match self.get(name) {
            Some(raw) => value::decode_string_set(raw),
            None => Ok(Vec::new()),
        }
    }
}

/// Encoders and decoders for individual cell values.
pub mod value {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use byteorder::{BigEndian, ByteOrder};
    use uuid::Uuid;

    use super::{put_int, Decoder};
    use crate::error::Error;

    pub fn text(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    pub fn int(v: i32) -> Vec<u8> {
        let mut b = vec![0u8; 4];
        BigEndian::write_i32(&mut b, v);
        b
    }

    pub fn inet(ip: IpAddr) -> Vec<u8> {
        match ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    pub fn uuid(id: &Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    pub fn string_set(items: &[String]) -> Vec<u8> {
        let mut buf = Vec::new();
        put_int(&mut buf, items.len() as i32);
        for item in items {
            put_int(&mut buf, item.len() as i32);
            buf.extend_from_slice(item.as_bytes());
        }
        buf
    }

    pub fn decode_text(raw: &[u8]) -> Result<String, Error> {
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Protocol(String::from("invalid UTF-8 text value")))
    }

    pub fn decode_int(raw: &[u8]) -> Result<i32, Error> {
        if raw.len() != 4 {
            return Err(Error::Protocol(format!("invalid int length {}", raw.len())));
        }
        Ok(BigEndian::read_i32(raw))
    }

    pub fn decode_inet(raw: &[u8]) -> Result<IpAddr, Error> {
        match raw.len() {
            4 => Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            n => Err(Error::Protocol(format!("invalid inet length {}", n))),
        }
    }

    pub fn decode_uuid(raw: &[u8]) -> Result<Uuid, Error> {
        Uuid::from_slice(raw).map_err(|e| Error::Protocol(format!("invalid uuid: {}", e)))
    }

    pub fn decode_string_set(raw: &[u8]) -> Result<Vec<String>, Error> {
        let mut d = Decoder::new(raw);
        let n = d.read_len()?;
        (0..n)
            .map(|_| {
                let len = d.read_len()?;
                d.read_utf8(len)
            })
            .collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StatusChange {
    Up,
    Down,
}

pub const TARGET_KEYSPACE: &str = "KEYSPACE";
pub const TARGET_TABLE: &str = "TABLE";
pub const TARGET_TYPE: &str = "TYPE";
pub const TARGET_FUNCTION: &str = "FUNCTION";
pub const TARGET_AGGREGATE: &str = "AGGREGATE";

/// A schema change, reported as an event or as the result of a DDL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChange {
    pub change: String,
    /// What kind of object changed, one of the `TARGET_*` names.
    pub target: String,
    pub keyspace: String,
    /// The changed table, type, function or aggregate. Empty for keyspaces.
    pub name: String,
    /// Argument types of a changed function or aggregate.
    pub arguments: Vec<String>,
}

impl SchemaChange {
    pub fn keyspace<S: Into<String>>(change: S, keyspace: S) -> Self {
        SchemaChange {
            change: change.into(),
            target: String::from(TARGET_KEYSPACE),
            keyspace: keyspace.into(),
            name: String::new(),
            arguments: Vec::new(),
        }
    }

    pub fn table<S: Into<String>>(change: S, keyspace: S, table: S) -> Self {
        SchemaChange {
            change: change.into(),
            target: String::from(TARGET_TABLE),
            keyspace: keyspace.into(),
            name: table.into(),
            arguments: Vec::new(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, version: u8) {
        put_string(buf, &self.change);
        if version < 3 {
            put_string(buf, &self.keyspace);
            put_string(buf, &self.name);
            return;
        }
        put_string(buf, &self.target);
        put_string(buf, &self.keyspace);
        match self.target.as_str() {
            TARGET_KEYSPACE => (),
            TARGET_FUNCTION | TARGET_AGGREGATE => {
                put_string(buf, &self.name);
                put_string_list(buf, &self.arguments);
            }
            _ => put_string(buf, &self.name),
        }
    }

    // Versions 1 and 2 only know keyspaces and tables, told apart by an empty
    // table name. Later versions name the target explicitly.
    fn decode(d: &mut Decoder, version: u8) -> Result<Self, Error> {
        let change = d.read_string()?;
        if version < 3 {
            let keyspace = d.read_string()?;
            let table = d.read_string()?;
            let target = if table.is_empty() {
                TARGET_KEYSPACE
            } else {
                TARGET_TABLE
            };
            return Ok(SchemaChange {
                change,
                target: String::from(target),
                keyspace,
                name: table,
                arguments: Vec::new(),
            });
        }

        let target = d.read_string()?;
        let keyspace = d.read_string()?;
        let (name, arguments) = match target.as_str() {
            TARGET_KEYSPACE => (String::new(), Vec::new()),
            TARGET_TABLE | TARGET_TYPE => (d.read_string()?, Vec::new()),
            TARGET_FUNCTION | TARGET_AGGREGATE => (d.read_string()?, d.read_string_list()?),
            other => {
                return Err(Error::Protocol(format!(
                    "unknown schema change target {}",
                    other
                )))
            }
        };
        Ok(SchemaChange {
            change,
            target,
            keyspace,
            name,
            arguments,
        })
    }
}

/// A notification pushed by the server on the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Topology {
        change: TopologyChange,
        address: SocketAddr,
    },
    Status {
        change: StatusChange,
        address: SocketAddr,
    },
    Schema(SchemaChange),
}

impl Event {
    /// The event class name used when registering for events.
    pub fn class(&self) -> &'static str {
        match self {
            Event::Topology { .. } => TOPOLOGY_CHANGE,
            Event::Status { .. } => STATUS_CHANGE,
            Event::Schema(_) => SCHEMA_CHANGE,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, version: u8) {
        put_string(buf, self.class());
        match self {
            Event::Topology { change, address } => {
                let c = match change {
                    TopologyChange::NewNode => "NEW_NODE",
                    TopologyChange::RemovedNode => "REMOVED_NODE",
                    TopologyChange::MovedNode => "MOVED_NODE",
                };
                put_string(buf, c);
                put_inet(buf, address);
            }
            Event::Status { change, address } => {
                let c = match change {
                    StatusChange::Up => "UP",
                    StatusChange::Down => "DOWN",
                };
                put_string(buf, c);
                put_inet(buf, address);
            }
            Event::Schema(change) => change.encode(buf, version),
        }
    }

    fn decode(d: &mut Decoder, version: u8) -> Result<Self, Error> {
        let class = d.read_string()?;
        let event = match class.as_str() {
            TOPOLOGY_CHANGE => {
                let change = match d.read_string()?.as_str() {
                    "NEW_NODE" => TopologyChange::NewNode,
                    "REMOVED_NODE" => TopologyChange::RemovedNode,
                    "MOVED_NODE" => TopologyChange::MovedNode,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unknown topology change {}",
                            other
                        )))
                    }
                };
                Event::Topology {
                    change,
                    address: d.read_inet()?,
                }
            }
            STATUS_CHANGE => {
                let change = match d.read_string()?.as_str() {
                    "UP" => StatusChange::Up,
                    "DOWN" => StatusChange::Down,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unknown status change {}",
                            other
                        )))
                    }
                };
                Event::Status {
                    change,
                    address: d.read_inet()?,
                }
            }
            SCHEMA_CHANGE => Event::Schema(SchemaChange::decode(d, version)?),
            other => return Err(Error::Protocol(format!("unknown event type {}", other))),
        };
        Ok(event)
    }
}

/// The body of a RESULT message.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Vec<u8>),
    SchemaChange(SchemaChange),
}

impl QueryResult {
    pub fn rows(&self) -> Option<&Rows> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Rows> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, version: u8) {
        match self {
            QueryResult::Void => put_int(buf, RESULT_VOID),
            QueryResult::Rows(rows) => {
                put_int(buf, RESULT_ROWS);
                rows.encode(buf);
            }
            QueryResult::SetKeyspace(ks) => {
                put_int(buf, RESULT_SET_KEYSPACE);
                put_string(buf, ks);
            }
            QueryResult::Prepared(id) => {
                put_int(buf, RESULT_PREPARED);
                put_short_bytes(buf, id);
                // empty bind and result metadata
                put_int(buf, 0);
                put_int(buf, 0);
            }
            QueryResult::SchemaChange(change) => {
                put_int(buf, RESULT_SCHEMA_CHANGE);
                change.encode(buf, version);
            }
        }
    }

    fn decode(d: &mut Decoder, version: u8) -> Result<Self, Error> {
        let result = match d.read_int()? {
            RESULT_VOID => QueryResult::Void,
            RESULT_ROWS => QueryResult::Rows(Rows::decode(d)?),
            RESULT_SET_KEYSPACE => QueryResult::SetKeyspace(d.read_string()?),
            RESULT_PREPARED => QueryResult::Prepared(d.read_short_bytes()?),
            RESULT_SCHEMA_CHANGE => {
                QueryResult::SchemaChange(SchemaChange::decode(d, version)?)
            }
            other => return Err(Error::Protocol(format!("unknown result kind {}", other))),
        };
        Ok(result)
    }
}

/// Messages sent by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ready,
    Supported(HashMap<String, Vec<String>>),
    Result(QueryResult),
    Error(ServerError),
    Event(Event),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Ready => Opcode::Ready,
            Response::Supported(_) => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Error(_) => Opcode::Error,
            Response::Event(_) => Opcode::Event,
        }
    }

    pub fn encode(&self, version: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ready => (),
            Response::Supported(options) => {
                put_short(&mut buf, options.len() as u16);
                for (k, v) in options {
                    put_string(&mut buf, k);
                    put_string_list(&mut buf, v);
                }
            }
            Response::Result(result) => result.encode(&mut buf, version),
            Response::Error(err) => {
                put_int(&mut buf, err.code);
                put_string(&mut buf, &err.message);
            }
            Response::Event(event) => event.encode(&mut buf, version),
        }
        buf
    }

    pub fn decode(opcode: Opcode, version: u8, body: &[u8]) -> Result<Response, Error> {
        let mut d = Decoder::new(body);
        let resp = match opcode {
            Opcode::Ready => Response::Ready,
            Opcode::Supported => Response::Supported(d.read_string_multimap()?),
            Opcode::Result => Response::Result(QueryResult::decode(&mut d, version)?),
            Opcode::Error => {
                // Some error codes carry extra fields after the message;
                // they are not needed here.
                let code = d.read_int()?;
                let message = d.read_string()?;
                Response::Error(ServerError { code, message })
            }
            Opcode::Event => Response::Event(Event::decode(&mut d, version)?),
            other => {
                return Err(Error::Protocol(format!(
                    "{:?} is not a response opcode",
                    other
                )))
            }
        };
        Ok(resp)
    }

    /// Decode a whole response frame, envelope first.
    pub fn decode_frame(frame: &Frame) -> Result<(Envelope, Response), Error> {
        let (env, body) = Envelope::decode(frame.header.flags, &frame.body)?;
        let resp = Response::decode(frame.header.opcode, frame.header.version, body)?;
        Ok((env, resp))
    }

    /// Turn a response to a QUERY, PREPARE or EXECUTE into its result.
    pub fn into_result(self) -> Result<QueryResult, Error> {
        match self {
            Response::Result(result) => Ok(result),
            Response::Error(err) => Err(Error::Server(err)),
            other => Err(Error::Protocol(format!(
                "unexpected {:?} response",
                other.opcode()
            ))),
        }
    }
}
