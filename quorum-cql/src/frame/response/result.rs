use crate::frame::frame_errors::{CqlResponseParseError, LowLevelDeserializationError};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use bytes::{BufMut, Bytes};
use std::net::IpAddr;
use std::result::Result as StdResult;
use uuid::Uuid;

// Metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    /// Absent in protocol v1.
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

impl TableSpec {
    pub fn new(ks_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            ks_name: ks_name.into(),
            table_name: table_name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

impl ColumnSpec {
    pub fn new(table_spec: TableSpec, name: impl Into<String>, typ: ColumnType) -> Self {
        Self {
            table_spec,
            name: name.into(),
            typ,
        }
    }
}

/// Describes the columns of a result set and where the next page starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

/// Describes the bind markers of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Only reported by protocol v4.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One row of raw cells, in column order. `None` is a null cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

impl Row {
    fn cell(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).and_then(|cell| cell.as_deref())
    }

    /// Reads a `text`, `varchar` or `ascii` cell.
    pub fn text(&self, index: usize) -> StdResult<Option<&str>, LowLevelDeserializationError> {
        self.cell(index)
            .map(std::str::from_utf8)
            .transpose()
            .map_err(Into::into)
    }

    /// Reads a `uuid` or `timeuuid` cell.
    pub fn uuid(&self, index: usize) -> StdResult<Option<Uuid>, LowLevelDeserializationError> {
        let Some(mut raw) = self.cell(index) else {
            return Ok(None);
        };
        let raw: [u8; 16] = types::read_raw_bytes(16, &mut raw)?.try_into()?;
        Ok(Some(Uuid::from_bytes(raw)))
    }

    /// Reads an `inet` cell.
    pub fn inet(&self, index: usize) -> StdResult<Option<IpAddr>, LowLevelDeserializationError> {
        self.cell(index)
            .map(|mut raw| types::read_ip_addr(raw.len(), &mut raw))
            .transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Position of the column called `name`, if the server sent metadata.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata
            .col_specs
            .iter()
            .position(|spec| spec.name == name)
    }

    pub fn rows_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

impl Result {
    /// Writes the body of a RESULT response. Used by scripted servers in tests.
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> StdResult<(), std::num::TryFromIntError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                ser_result_metadata(&rows.metadata, buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in &row.columns {
                        types::write_bytes_opt(cell.as_ref(), buf)?;
                    }
                }
            }
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(0x0003, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(0x0004, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                ser_prepared_metadata(version, &prepared.prepared_metadata, buf)?;
                if version >= ProtocolVersion::V2 {
                    ser_result_metadata(&prepared.result_metadata, buf)?;
                }
            }
            Result::SchemaChange(schema_change) => {
                types::write_int(0x0005, buf);
                schema_change.event.serialize(version, buf)?;
            }
        }
        Ok(())
    }
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, CqlResponseParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => {
            let type_str = types::read_string(buf)?;
            match type_str {
                "org.apache.cassandra.db.marshal.DurationType" => Duration,
                _ => Custom(type_str.to_owned()),
            }
        }
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        // 0x000A is the v1/v2 "text" id, an alias of varchar
        0x000A | 0x000D => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_size: usize = types::read_short(buf)?.into();

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut elems = Vec::with_capacity(len);
            for _ in 0..len {
                elems.push(deser_type(buf)?);
            }
            Tuple(elems)
        }
        id => return Err(CqlResponseParseError::UnsupportedColumnType(id)),
    })
}

fn ser_type(typ: &ColumnType, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
    use ColumnType::*;
    let id: u16 = match typ {
        Custom(name) => {
            types::write_short(0x0000, buf);
            return types::write_string(name, buf);
        }
        Ascii => 0x0001,
        BigInt => 0x0002,
        Blob => 0x0003,
        Boolean => 0x0004,
        Counter => 0x0005,
        Decimal => 0x0006,
        Double => 0x0007,
        Float => 0x0008,
        Int => 0x0009,
        Timestamp => 0x000B,
        Uuid => 0x000C,
        Text => 0x000D,
        Varint => 0x000E,
        Timeuuid => 0x000F,
        Inet => 0x0010,
        Date => 0x0011,
        Time => 0x0012,
        SmallInt => 0x0013,
        TinyInt => 0x0014,
        Duration => 0x0015,
        List(elem) | Set(elem) => {
            types::write_short(if matches!(typ, List(_)) { 0x0020 } else { 0x0022 }, buf);
            return ser_type(elem, buf);
        }
        Map(key, value) => {
            types::write_short(0x0021, buf);
            ser_type(key, buf)?;
            return ser_type(value, buf);
        }
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            types::write_short(0x0030, buf);
            types::write_string(keyspace, buf)?;
            types::write_string(type_name, buf)?;
            types::write_short_length(field_types.len(), buf)?;
            for (name, typ) in field_types {
                types::write_string(name, buf)?;
                ser_type(typ, buf)?;
            }
            return Ok(());
        }
        Tuple(elems) => {
            types::write_short(0x0031, buf);
            types::write_short_length(elems.len(), buf)?;
            for typ in elems {
                ser_type(typ, buf)?;
            }
            return Ok(());
        }
    };
    types::write_short(id, buf);
    Ok(())
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, CqlResponseParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, CqlResponseParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

/// The first column's table spec becomes the global one when every column shares it.
fn global_table_spec(col_specs: &[ColumnSpec]) -> Option<&TableSpec> {
    let first = &col_specs.first()?.table_spec;
    col_specs
        .iter()
        .all(|spec| &spec.table_spec == first)
        .then_some(first)
}

fn ser_col_specs(
    col_specs: &[ColumnSpec],
    global: bool,
    buf: &mut impl BufMut,
) -> StdResult<(), std::num::TryFromIntError> {
    for spec in col_specs {
        if !global {
            types::write_string(&spec.table_spec.ks_name, buf)?;
            types::write_string(&spec.table_spec.table_name, buf)?;
        }
        types::write_string(&spec.name, buf)?;
        ser_type(&spec.typ, buf)?;
    }
    Ok(())
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, CqlResponseParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()?;

    let col_specs = if no_metadata {
        vec![]
    } else {
        let global_table_spec = global_tables_spec
            .then(|| deser_table_spec(buf))
            .transpose()?;

        deser_col_specs(buf, global_table_spec, col_count)?
    };

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn ser_result_metadata(
    metadata: &ResultMetadata,
    buf: &mut impl BufMut,
) -> StdResult<(), std::num::TryFromIntError> {
    let global = global_table_spec(&metadata.col_specs);
    let mut flags = 0;
    if global.is_some() {
        flags |= FLAG_GLOBAL_TABLES_SPEC;
    }
    if metadata.paging_state.is_some() {
        flags |= FLAG_HAS_MORE_PAGES;
    }
    if metadata.col_specs.is_empty() {
        flags |= FLAG_NO_METADATA;
    }
    types::write_int(flags, buf);
    types::write_int_length(metadata.col_count, buf)?;
    if let Some(paging_state) = &metadata.paging_state {
        types::write_bytes(paging_state, buf)?;
    }
    if let Some(spec) = global {
        types::write_string(&spec.ks_name, buf)?;
        types::write_string(&spec.table_name, buf)?;
    }
    ser_col_specs(&metadata.col_specs, global.is_some(), buf)
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<PreparedMetadata, CqlResponseParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::new();
    if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf)?;
        pk_indexes.reserve(pk_count);
        for _ in 0..pk_count {
            pk_indexes.push(types::read_short(buf)?);
        }
    }

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()?;

    let col_specs = deser_col_specs(buf, global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn ser_prepared_metadata(
    version: ProtocolVersion,
    metadata: &PreparedMetadata,
    buf: &mut impl BufMut,
) -> StdResult<(), std::num::TryFromIntError> {
    let global = global_table_spec(&metadata.col_specs);
    types::write_int(
        if global.is_some() {
            FLAG_GLOBAL_TABLES_SPEC
        } else {
            0
        },
        buf,
    );
    types::write_int_length(metadata.col_count, buf)?;
    if version >= ProtocolVersion::V4 {
        types::write_int_length(metadata.pk_indexes.len(), buf)?;
        for index in &metadata.pk_indexes {
            types::write_short(*index, buf);
        }
    }
    if let Some(spec) = global {
        types::write_string(&spec.ks_name, buf)?;
        types::write_string(&spec.table_name, buf)?;
    }
    ser_col_specs(&metadata.col_specs, global.is_some(), buf)
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, CqlResponseParseError> {
    let metadata = deser_result_metadata(buf)?;
    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for _ in 0..metadata.col_count {
            columns.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
        }
        rows.push(Row { columns });
    }

    Ok(Rows { metadata, rows })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, CqlResponseParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<Prepared, CqlResponseParseError> {
    let id_len = types::read_short(buf)? as usize;
    let id: Bytes = types::read_raw_bytes(id_len, buf)?.to_owned().into();
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = if version >= ProtocolVersion::V2 {
        deser_result_metadata(buf)?
    } else {
        ResultMetadata::default()
    };
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<SchemaChange, CqlResponseParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(version, buf)?,
    })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<Result, CqlResponseParseError> {
    Ok(match types::read_int(buf)? {
        0x0001 => Result::Void,
        0x0002 => Result::Rows(deser_rows(buf)?),
        0x0003 => Result::SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Result::Prepared(deser_prepared(version, buf)?),
        0x0005 => Result::SchemaChange(deser_schema_change(version, buf)?),
        k => return Err(CqlResponseParseError::UnknownResultKind(k)),
    })
}
