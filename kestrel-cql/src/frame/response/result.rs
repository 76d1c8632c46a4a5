//! The RESULT response: Void, Rows, SetKeyspace, Prepared and SchemaChange.

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::{CqlResultParseError, LowLevelDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::value::{DeserializationError, DeserializeValue};

// Result kinds
const KIND_VOID: i32 = 0x0001;
const KIND_ROWS: i32 = 0x0002;
const KIND_SET_KEYSPACE: i32 = 0x0003;
const KIND_PREPARED: i32 = 0x0004;
const KIND_SCHEMA_CHANGE: i32 = 0x0005;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
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
        keyspace: String,
        type_name: String,
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

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
    /// Set when the server has more pages for this query.
    pub paging_state: Option<Bytes>,
    /// Sent with the rows of an EXECUTE whose result metadata id went stale.
    pub new_metadata_id: Option<Bytes>,
}

/// The bind markers of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Bind marker positions of the partition key columns, in partition key order.
    /// Empty before protocol v4.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Bytes,
    /// Present from the protocol version that introduced it.
    pub result_metadata_id: Option<Bytes>,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

/// A single row with its cells still in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

impl Row {
    /// Reads column `idx` as `T`. Returns `None` when the row has no such column.
    pub fn get<T: DeserializeValue>(
        &self,
        idx: usize,
    ) -> Option<std::result::Result<T, DeserializationError>> {
        self.columns
            .get(idx)
            .map(|cell| T::deserialize(cell.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, CqlResultParseError> {
    use ColumnType::*;
    let meta_err = CqlResultParseError::RowsMetadataParseError;
    let id = types::read_short(buf).map_err(|err| meta_err(err.into()))?;
    Ok(match id {
        0x0000 => {
            let type_str = types::read_string(buf).map_err(meta_err)?;
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
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
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
            let keyspace = types::read_string(buf).map_err(meta_err)?.to_owned();
            let type_name = types::read_string(buf).map_err(meta_err)?.to_owned();
            let fields_size = types::read_short(buf).map_err(|err| meta_err(err.into()))?;

            let mut field_types = Vec::with_capacity(fields_size.into());
            for _ in 0..fields_size {
                let field_name = types::read_string(buf).map_err(meta_err)?.to_owned();
                field_types.push((field_name, deser_type(buf)?));
            }

            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short(buf).map_err(|err| meta_err(err.into()))?;
            let mut elems = Vec::with_capacity(len.into());
            for _ in 0..len {
                elems.push(deser_type(buf)?);
            }
            Tuple(elems)
        }
        id => return Err(CqlResultParseError::UnknownColumnType(id)),
    })
}

fn ser_type(
    typ: &ColumnType,
    buf: &mut impl BufMut,
) -> std::result::Result<(), std::num::TryFromIntError> {
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
        List(elem) => {
            types::write_short(0x0020, buf);
            return ser_type(elem, buf);
        }
        Map(key, value) => {
            types::write_short(0x0021, buf);
            ser_type(key, buf)?;
            return ser_type(value, buf);
        }
        Set(elem) => {
            types::write_short(0x0022, buf);
            return ser_type(elem, buf);
        }
        UserDefinedType {
            keyspace,
            type_name,
            field_types,
        } => {
            types::write_short(0x0030, buf);
            types::write_string(keyspace, buf)?;
            types::write_string(type_name, buf)?;
            types::write_short(field_types.len().try_into()?, buf);
            for (name, typ) in field_types {
                types::write_string(name, buf)?;
                ser_type(typ, buf)?;
            }
            return Ok(());
        }
        Tuple(elems) => {
            types::write_short(0x0031, buf);
            types::write_short(elems.len().try_into()?, buf);
            for typ in elems {
                ser_type(typ, buf)?;
            }
            return Ok(());
        }
    };
    types::write_short(id, buf);
    Ok(())
}

fn deser_table_spec(
    buf: &mut &[u8],
) -> std::result::Result<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_tables_spec: bool,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, CqlResultParseError> {
    let meta_err = CqlResultParseError::RowsMetadataParseError;
    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf))
        .transpose()
        .map_err(meta_err)?;

    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(meta_err)?,
        };
        let name = types::read_string(buf).map_err(meta_err)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn ser_col_specs(
    col_specs: &[ColumnSpec],
    buf: &mut impl BufMut,
) -> std::result::Result<(), std::num::TryFromIntError> {
    for spec in col_specs {
        types::write_string(&spec.table_spec.ks_name, buf)?;
        types::write_string(&spec.table_spec.table_name, buf)?;
        types::write_string(&spec.name, buf)?;
        ser_type(&spec.typ, buf)?;
    }
    Ok(())
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> std::result::Result<ResultMetadata, CqlResultParseError> {
    let meta_err = CqlResultParseError::RowsMetadataParseError;
    let flags = types::read_int(buf).map_err(|err| meta_err(err.into()))?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;
    let metadata_changed = flags & FLAG_METADATA_CHANGED != 0;

    let col_count = types::read_int_length(buf).map_err(meta_err)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()
        .map_err(meta_err)?;
    let new_metadata_id = metadata_changed
        .then(|| types::read_short_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()
        .map_err(meta_err)?;

    let col_specs = if no_metadata {
        Vec::new()
    } else {
        deser_col_specs(buf, global_tables_spec, col_count)?
    };

    Ok(ResultMetadata {
        col_count,
        col_specs,
        paging_state,
        new_metadata_id,
    })
}

fn ser_result_metadata(
    metadata: &ResultMetadata,
    buf: &mut impl BufMut,
) -> std::result::Result<(), std::num::TryFromIntError> {
    let mut flags = 0;
    if metadata.paging_state.is_some() {
        flags |= FLAG_HAS_MORE_PAGES;
    }
    if metadata.col_specs.is_empty() {
        flags |= FLAG_NO_METADATA;
    }
    if metadata.new_metadata_id.is_some() {
        flags |= FLAG_METADATA_CHANGED;
    }
    types::write_int(flags, buf);
    types::write_int_length(metadata.col_count, buf)?;
    if let Some(paging_state) = &metadata.paging_state {
        types::write_bytes(paging_state, buf)?;
    }
    if let Some(new_metadata_id) = &metadata.new_metadata_id {
        types::write_short_bytes(new_metadata_id, buf)?;
    }
    ser_col_specs(&metadata.col_specs, buf)
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<PreparedMetadata, CqlResultParseError> {
    let meta_err = CqlResultParseError::PreparedMetadataParseError;
    let flags = types::read_int(buf).map_err(|err| meta_err(err.into()))?;
    let col_count = types::read_int_length(buf).map_err(meta_err)?;

    let mut pk_indexes = Vec::new();
    if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf).map_err(meta_err)?;
        pk_indexes.reserve(pk_count);
        for _ in 0..pk_count {
            pk_indexes.push(types::read_short(buf).map_err(|err| meta_err(err.into()))?);
        }
    }

    let col_specs = deser_col_specs(buf, flags & FLAG_GLOBAL_TABLES_SPEC != 0, col_count)?;
    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_prepared(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Prepared, CqlResultParseError> {
    let id_err = CqlResultParseError::PreparedIdParseError;
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf).map_err(id_err)?);
    let result_metadata_id = version
        .supports_result_metadata_id()
        .then(|| types::read_short_bytes(buf).map(Bytes::copy_from_slice))
        .transpose()
        .map_err(id_err)?;
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = deser_result_metadata(buf)?;

    Ok(Prepared {
        id,
        result_metadata_id,
        prepared_metadata,
        result_metadata,
    })
}

fn ser_prepared(
    version: ProtocolVersion,
    prepared: &Prepared,
    buf: &mut impl BufMut,
) -> std::result::Result<(), std::num::TryFromIntError> {
    types::write_short_bytes(&prepared.id, buf)?;
    if version.supports_result_metadata_id() {
        let id = prepared.result_metadata_id.as_deref().unwrap_or_default();
        types::write_short_bytes(id, buf)?;
    }

    let metadata = &prepared.prepared_metadata;
    // Column specs always carry their own table spec.
    types::write_int(0, buf);
    types::write_int_length(metadata.col_count, buf)?;
    if version >= ProtocolVersion::V4 {
        types::write_int_length(metadata.pk_indexes.len(), buf)?;
        for index in &metadata.pk_indexes {
            types::write_short(*index, buf);
        }
    }
    ser_col_specs(&metadata.col_specs, buf)?;
    ser_result_metadata(&prepared.result_metadata, buf)
}

fn deser_rows(buf: &mut &[u8]) -> std::result::Result<Rows, CqlResultParseError> {
    let metadata = deser_result_metadata(buf)?;

    let rows_err = CqlResultParseError::RowsParseError;
    let rows_count = types::read_int_length(buf).map_err(rows_err)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let columns = (0..metadata.col_count)
            .map(|_| {
                types::read_bytes_opt(buf)
                    .map(|cell| cell.map(Bytes::copy_from_slice))
                    .map_err(rows_err)
            })
            .collect::<std::result::Result<_, _>>()?;
        rows.push(Row { columns });
    }

    Ok(Rows { metadata, rows })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> std::result::Result<Result, CqlResultParseError> {
    use self::Result::*;
    let kind = types::read_int(buf)
        .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?;

    Ok(match kind {
        KIND_VOID => Void,
        KIND_ROWS => Rows(deser_rows(buf)?),
        KIND_SET_KEYSPACE => SetKeyspace(self::SetKeyspace {
            keyspace_name: types::read_string(buf)
                .map_err(CqlResultParseError::SetKeyspaceParseError)?
                .to_owned(),
        }),
        KIND_PREPARED => Prepared(deser_prepared(version, buf)?),
        KIND_SCHEMA_CHANGE => SchemaChange(self::SchemaChange {
            event: SchemaChangeEvent::deserialize(buf)
                .map_err(CqlResultParseError::SchemaChangeParseError)?,
        }),
        _ => return Err(CqlResultParseError::UnknownResultId(kind)),
    })
}

impl Result {
    /// Writes the body of a RESULT frame. Test servers use this to forge results.
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> std::result::Result<(), std::num::TryFromIntError> {
        match self {
            Result::Void => types::write_int(KIND_VOID, buf),
            Result::SetKeyspace(set_keyspace) => {
                types::write_int(KIND_SET_KEYSPACE, buf);
                types::write_string(&set_keyspace.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(KIND_PREPARED, buf);
                ser_prepared(version, prepared, buf)?;
            }
            Result::SchemaChange(change) => {
                types::write_int(KIND_SCHEMA_CHANGE, buf);
                change.event.serialize(buf)?;
            }
            Result::Rows(rows) => {
                types::write_int(KIND_ROWS, buf);
                ser_result_metadata(&rows.metadata, buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in &row.columns {
                        types::write_bytes_opt(cell.as_deref(), buf)?;
                    }
                }
            }
        }
        Ok(())
    }
}
