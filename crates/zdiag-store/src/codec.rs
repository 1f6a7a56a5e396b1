//! 紧凑字符串介质
//!
//! 嵌入式内嵌集合的线上编码：每条记录
//! `(<Int32|Int64>)<id>,<字段>,<字段>,...;`，记录自带`;`终结符、
//! 无记录间分隔；小数一律`.`分隔（与区域设置无关）；布尔写`0`/`1`。
//! 只支持数值与布尔字段，字符串、字符、日期、图片一律
//! `UnsupportedFieldType`。空引用编码为标签后的空数字。

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use zdiag_core::entity::EntityId;
use zdiag_core::error::{RepositoryError, Result};
use zdiag_core::io::{NoRefs, RecordReader, RecordWriter, RefResolver};
use zdiag_core::schema::{FieldKind, InnerObjectsDef};

const TAG_INT32: &str = "(Int32)";
const TAG_INT64: &str = "(Int64)";

/// 字符串介质写入器
pub struct StringRecordWriter {
    def: InnerObjectsDef,
    buffer: String,
    position: usize,
    scope_open: bool,
    record_open: bool,
    id_written: bool,
}

impl StringRecordWriter {
    pub fn new(def: InnerObjectsDef) -> Self {
        Self {
            def,
            buffer: String::new(),
            position: 0,
            scope_open: false,
            record_open: false,
            id_written: false,
        }
    }

    /// 取出编码结果
    pub fn into_encoded(self) -> String {
        self.buffer
    }

    fn push_field(&mut self, text: &str) -> Result<()> {
        if !self.record_open {
            return Err(RepositoryError::Integrity(
                "no inner record open for writing".into(),
            ));
        }
        let declared = self.def.fields.len();
        if self.position >= declared {
            return Err(RepositoryError::SchemaOverrun {
                entity_type: self.def.name.clone(),
                position: self.position,
                declared,
            });
        }
        self.buffer.push(',');
        self.buffer.push_str(text);
        self.position += 1;
        Ok(())
    }
}

impl RecordWriter for StringRecordWriter {
    fn prepare(&mut self, _entity_id: Option<EntityId>) -> Result<()> {
        self.buffer.clear();
        self.position = 0;
        self.scope_open = false;
        self.record_open = false;
        self.id_written = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.push_field(if value { "1" } else { "0" })
    }

    fn write_byte(&mut self, value: u8) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_f32(&mut self, value: f32) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.push_field(&value.to_string())
    }

    fn write_char(&mut self, _value: char) -> Result<()> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Char))
    }

    fn write_string(&mut self, _value: &str) -> Result<()> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::String))
    }

    fn write_date(&mut self, _value: DateTime<Utc>) -> Result<()> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Date))
    }

    fn write_image(&mut self, _value: &[u8]) -> Result<()> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Image))
    }

    fn write_id(&mut self, id: Option<EntityId>) -> Result<()> {
        if !self.record_open {
            return Err(RepositoryError::Integrity(
                "no inner record open for writing".into(),
            ));
        }
        if self.id_written {
            return Err(RepositoryError::Integrity(
                "identity must lead the inner record".into(),
            ));
        }
        match id {
            None => self.buffer.push_str(TAG_INT32),
            Some(id) => {
                let raw = id.raw();
                if i32::try_from(raw).is_ok() {
                    self.buffer.push_str(TAG_INT32);
                } else {
                    self.buffer.push_str(TAG_INT64);
                }
                self.buffer.push_str(&raw.to_string());
            }
        }
        self.id_written = true;
        Ok(())
    }

    fn begin_write_inner_objects(&mut self, name: &str) -> Result<()> {
        if name != self.def.name {
            return Err(RepositoryError::Integrity(format!(
                "unknown inner collection '{name}'"
            )));
        }
        self.scope_open = true;
        Ok(())
    }

    fn begin_write_inner_object(&mut self) -> Result<()> {
        if !self.scope_open {
            return Err(RepositoryError::Integrity(
                "inner collection scope not open".into(),
            ));
        }
        self.record_open = true;
        self.id_written = false;
        self.position = 0;
        Ok(())
    }

    fn end_write_inner_object(&mut self) -> Result<()> {
        self.buffer.push(';');
        self.record_open = false;
        Ok(())
    }

    fn end_write_inner_objects(&mut self) -> Result<()> {
        self.scope_open = false;
        Ok(())
    }

    fn delete_inner_objects(&mut self, _name: &str) -> Result<()> {
        // 嵌入单元格整体覆盖，没有旧子行可清
        Ok(())
    }
}

struct EncodedRecord {
    id: Option<EntityId>,
    fields: VecDeque<String>,
}

/// 字符串介质读取器
pub struct StringRecordReader {
    def: InnerObjectsDef,
    records: VecDeque<EncodedRecord>,
    current: Option<EncodedRecord>,
    id_taken: bool,
    position: usize,
    refs: NoRefs,
}

impl StringRecordReader {
    /// 解析编码文本；格式错误立即报`Parse`
    pub fn parse(encoded: &str, def: InnerObjectsDef) -> Result<Self> {
        let mut records = VecDeque::new();
        for raw in encoded.split(';') {
            if raw.is_empty() {
                continue;
            }
            let rest = raw
                .strip_prefix(TAG_INT32)
                .or_else(|| raw.strip_prefix(TAG_INT64))
                .ok_or_else(|| {
                    RepositoryError::Parse(format!("missing type tag in record '{raw}'"))
                })?;
            let mut parts = rest.split(',');
            let id_token = parts.next().unwrap_or("");
            let id = if id_token.is_empty() {
                None
            } else {
                Some(EntityId(id_token.parse().map_err(RepositoryError::parse)?))
            };
            records.push_back(EncodedRecord {
                id,
                fields: parts.map(str::to_string).collect(),
            });
        }
        Ok(Self {
            def,
            records,
            current: None,
            id_taken: false,
            position: 0,
            refs: NoRefs,
        })
    }

    /// 解析出的记录数
    pub fn record_count(&self) -> usize {
        self.records.len() + usize::from(self.current.is_some())
    }

    fn next_token(&mut self) -> Result<String> {
        let declared = self.def.fields.len();
        if self.position >= declared {
            return Err(RepositoryError::SchemaOverrun {
                entity_type: self.def.name.clone(),
                position: self.position,
                declared,
            });
        }
        let record = self.current.as_mut().ok_or_else(|| {
            RepositoryError::Integrity("no inner record open for reading".into())
        })?;
        let token = record.fields.pop_front().ok_or_else(|| {
            RepositoryError::Parse(format!("record in '{}' is short of fields", self.def.name))
        })?;
        self.position += 1;
        Ok(token)
    }
}

impl RecordReader for StringRecordReader {
    fn resolver(&self) -> &dyn RefResolver {
        &self.refs
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.next_token()?.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(RepositoryError::Parse(format!("invalid bool '{other}'"))),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_i16(&mut self) -> Result<i16> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_f32(&mut self) -> Result<f32> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_f64(&mut self) -> Result<f64> {
        self.next_token()?.parse().map_err(RepositoryError::parse)
    }

    fn read_char(&mut self) -> Result<char> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Char))
    }

    fn read_string(&mut self) -> Result<String> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::String))
    }

    fn read_date(&mut self) -> Result<DateTime<Utc>> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Date))
    }

    fn read_image(&mut self) -> Result<Vec<u8>> {
        Err(RepositoryError::UnsupportedFieldType(FieldKind::Image))
    }

    fn read_id(&mut self) -> Result<Option<EntityId>> {
        let record = self.current.as_ref().ok_or_else(|| {
            RepositoryError::Integrity("no inner record open for reading".into())
        })?;
        if self.id_taken {
            return Err(RepositoryError::Integrity(
                "record identity already read".into(),
            ));
        }
        self.id_taken = true;
        Ok(record.id)
    }

    fn begin_inner_objects(&mut self, name: &str) -> Result<()> {
        if name != self.def.name {
            return Err(RepositoryError::Integrity(format!(
                "unknown inner collection '{name}'"
            )));
        }
        Ok(())
    }

    fn begin_inner_object(&mut self) -> Result<bool> {
        self.current = self.records.pop_front();
        self.id_taken = false;
        self.position = 0;
        Ok(self.current.is_some())
    }

    fn end_inner_object(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn end_inner_objects(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdiag_core::schema::FieldDef;

    fn ranges_def() -> InnerObjectsDef {
        InnerObjectsDef::new(
            "value_ranges",
            zdiag_core::schema::InnerStorage::Embedded,
            vec![FieldDef::new("lower", FieldKind::Float)],
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut writer = StringRecordWriter::new(ranges_def());
        writer.prepare(None).unwrap();
        writer.begin_write_inner_objects("value_ranges").unwrap();

        writer.begin_write_inner_object().unwrap();
        writer.write_id(Some(EntityId(7))).unwrap();
        writer.write_f32(0.5).unwrap();
        writer.end_write_inner_object().unwrap();

        writer.begin_write_inner_object().unwrap();
        writer.write_id(None).unwrap();
        writer.write_f32(12.25).unwrap();
        writer.end_write_inner_object().unwrap();

        writer.end_write_inner_objects().unwrap();
        let encoded = writer.into_encoded();
        assert_eq!(encoded, "(Int32)7,0.5;(Int32),12.25;");

        let mut reader = StringRecordReader::parse(&encoded, ranges_def()).unwrap();
        reader.begin_inner_objects("value_ranges").unwrap();

        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_id().unwrap(), Some(EntityId(7)));
        assert_eq!(reader.read_f32().unwrap(), 0.5);
        reader.end_inner_object().unwrap();

        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_id().unwrap(), None);
        assert_eq!(reader.read_f32().unwrap(), 12.25);
        reader.end_inner_object().unwrap();

        assert!(!reader.begin_inner_object().unwrap());
        reader.end_inner_objects().unwrap();
    }

    #[test]
    fn test_large_identity_gets_int64_tag() {
        let mut writer = StringRecordWriter::new(ranges_def());
        writer.begin_write_inner_objects("value_ranges").unwrap();
        writer.begin_write_inner_object().unwrap();
        writer.write_id(Some(EntityId(1_i64 << 40))).unwrap();
        writer.write_f32(1.0).unwrap();
        writer.end_write_inner_object().unwrap();
        writer.end_write_inner_objects().unwrap();

        let encoded = writer.into_encoded();
        assert!(encoded.starts_with("(Int64)"));

        let mut reader = StringRecordReader::parse(&encoded, ranges_def()).unwrap();
        reader.begin_inner_objects("value_ranges").unwrap();
        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_id().unwrap(), Some(EntityId(1_i64 << 40)));
    }

    #[test]
    fn test_unsupported_field_types_rejected() {
        let mut writer = StringRecordWriter::new(ranges_def());
        writer.begin_write_inner_objects("value_ranges").unwrap();
        writer.begin_write_inner_object().unwrap();
        assert!(matches!(
            writer.write_string("text"),
            Err(RepositoryError::UnsupportedFieldType(FieldKind::String))
        ));
        assert!(matches!(
            writer.write_image(&[1, 2, 3]),
            Err(RepositoryError::UnsupportedFieldType(FieldKind::Image))
        ));
    }

    #[test]
    fn test_schema_overrun_detected() {
        let mut writer = StringRecordWriter::new(ranges_def());
        writer.begin_write_inner_objects("value_ranges").unwrap();
        writer.begin_write_inner_object().unwrap();
        writer.write_id(Some(EntityId(1))).unwrap();
        writer.write_f32(1.0).unwrap();
        // 描述符只声明一个字段
        assert!(matches!(
            writer.write_f32(2.0),
            Err(RepositoryError::SchemaOverrun { position: 1, .. })
        ));
    }

    #[test]
    fn test_bool_encoding() {
        let def = InnerObjectsDef::new(
            "flags",
            zdiag_core::schema::InnerStorage::Embedded,
            vec![
                FieldDef::new("a", FieldKind::Bool),
                FieldDef::new("b", FieldKind::Bool),
            ],
        );
        let mut writer = StringRecordWriter::new(def.clone());
        writer.begin_write_inner_objects("flags").unwrap();
        writer.begin_write_inner_object().unwrap();
        writer.write_id(None).unwrap();
        writer.write_bool(true).unwrap();
        writer.write_bool(false).unwrap();
        writer.end_write_inner_object().unwrap();
        let encoded = writer.into_encoded();
        assert_eq!(encoded, "(Int32),1,0;");

        let mut reader = StringRecordReader::parse(&encoded, def).unwrap();
        reader.begin_inner_objects("flags").unwrap();
        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_id().unwrap(), None);
        assert!(reader.read_bool().unwrap());
        assert!(!reader.read_bool().unwrap());
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(matches!(
            StringRecordReader::parse("7,0.5;", ranges_def()),
            Err(RepositoryError::Parse(_))
        ));
        assert!(matches!(
            StringRecordReader::parse("(Int32)x,0.5;", ranges_def()),
            Err(RepositoryError::Parse(_))
        ));
        // 空输入是零条记录，不是错误
        let reader = StringRecordReader::parse("", ranges_def()).unwrap();
        assert_eq!(reader.record_count(), 0);
    }
}
