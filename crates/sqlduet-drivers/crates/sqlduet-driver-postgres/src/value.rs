//! Conversion between `Value` and the PostgreSQL wire types
//!
//! Parameters are coerced to the type the server inferred for each placeholder
//! when the statement was prepared, so an `Int64` bound to an `int4` column is
//! written as four bytes and a decimal string bound to `numeric` is written in
//! the binary NUMERIC format.

use bytes::{BufMut, BytesMut};
use postgres_types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use sqlduet_core::{Result, Value};
use tokio_postgres::Row as PgRow;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Owned parameter value with a `ToSql` impl matching the prepared type
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PgValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(String),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    DateTimeUtc(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    DateTime(chrono::NaiveDateTime),
    TextArray(Vec<String>),
}

impl PgValue {
    /// Convert a value for a placeholder whose type the server inferred
    pub(crate) fn from_value_for_type(value: &Value, target_type: &Type) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => match *target_type {
                Type::INT2 | Type::INT4 | Type::INT8 => Self::coerce_int(i64::from(*v), target_type),
                _ => PgValue::Bool(*v),
            },

            Value::Int16(v) => Self::coerce_int(i64::from(*v), target_type),
            Value::Int32(v) => Self::coerce_int(i64::from(*v), target_type),
            Value::Int64(v) => Self::coerce_int(*v, target_type),

            Value::Float32(v) => Self::coerce_float(f64::from(*v), target_type),
            Value::Float64(v) => Self::coerce_float(*v, target_type),

            Value::Decimal(v) | Value::String(v) => Self::coerce_string(v, target_type),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => match *target_type {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(v.to_string()),
                _ => PgValue::Uuid(*v),
            },
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::DateTimeUtc(v) => PgValue::DateTimeUtc(*v),
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::DateTime(v) => PgValue::DateTime(*v),
            Value::Array(items) => PgValue::TextArray(items.iter().map(|v| v.to_string()).collect()),
        }
    }

    /// Pick the integer width matching the target column type
    fn coerce_int(value: i64, target_type: &Type) -> Self {
        match *target_type {
            Type::INT2 => PgValue::Int16(value as i16),
            Type::INT4 => PgValue::Int32(value as i32),
            Type::FLOAT4 => PgValue::Float32(value as f32),
            Type::FLOAT8 => PgValue::Float64(value as f64),
            Type::NUMERIC => PgValue::Numeric(value.to_string()),
            Type::BOOL => PgValue::Bool(value != 0),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(value.to_string()),
            _ => PgValue::Int64(value),
        }
    }

    fn coerce_float(value: f64, target_type: &Type) -> Self {
        match *target_type {
            Type::FLOAT4 => PgValue::Float32(value as f32),
            Type::NUMERIC => PgValue::Numeric(value.to_string()),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR => PgValue::String(value.to_string()),
            _ => PgValue::Float64(value),
        }
    }

    /// Parse text into the placeholder's type. Unparseable input is sent as text
    /// and left for the server to reject with a precise message.
    pub(crate) fn coerce_string(value: &str, target_type: &Type) -> Self {
        let fallback = || PgValue::String(value.to_string());
        let trimmed = value.trim();
        match *target_type {
            Type::INT2 => trimmed.parse().map(PgValue::Int16).unwrap_or_else(|_| fallback()),
            Type::INT4 => trimmed.parse().map(PgValue::Int32).unwrap_or_else(|_| fallback()),
            Type::INT8 => trimmed.parse().map(PgValue::Int64).unwrap_or_else(|_| fallback()),
            Type::FLOAT4 => trimmed.parse().map(PgValue::Float32).unwrap_or_else(|_| fallback()),
            Type::FLOAT8 => trimmed.parse().map(PgValue::Float64).unwrap_or_else(|_| fallback()),
            Type::NUMERIC => PgValue::Numeric(trimmed.to_string()),
            Type::BOOL => match trimmed.to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => PgValue::Bool(true),
                "f" | "false" | "no" | "off" | "0" => PgValue::Bool(false),
                _ => fallback(),
            },
            Type::UUID => uuid::Uuid::parse_str(trimmed)
                .map(PgValue::Uuid)
                .unwrap_or_else(|_| fallback()),
            Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(value)
                .map(PgValue::Json)
                .unwrap_or_else(|_| fallback()),
            Type::DATE => chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(PgValue::Date)
                .unwrap_or_else(|_| fallback()),
            Type::TIME => chrono::NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f")
                .map(PgValue::Time)
                .unwrap_or_else(|_| fallback()),
            Type::TIMESTAMP => parse_naive_datetime(trimmed)
                .map(PgValue::DateTime)
                .unwrap_or_else(fallback),
            Type::TIMESTAMPTZ => chrono::DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|ts| ts.with_timezone(&chrono::Utc))
                .or_else(|| parse_naive_datetime(trimmed).map(|ts| ts.and_utc()))
                .map(PgValue::DateTimeUtc)
                .unwrap_or_else(fallback),
            _ => fallback(),
        }
    }

    /// Used when the server reports fewer parameter types than values supplied
    pub(crate) fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => PgValue::Bool(*v),
            Value::Int16(v) => PgValue::Int16(*v),
            Value::Int32(v) => PgValue::Int32(*v),
            Value::Int64(v) => PgValue::Int64(*v),
            Value::Float32(v) => PgValue::Float32(*v),
            Value::Float64(v) => PgValue::Float64(*v),
            Value::Decimal(v) => PgValue::Numeric(v.clone()),
            Value::String(v) => PgValue::String(v.clone()),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::Uuid(v) => PgValue::Uuid(*v),
            Value::Json(v) => PgValue::Json(v.clone()),
            Value::DateTimeUtc(v) => PgValue::DateTimeUtc(*v),
            Value::Date(v) => PgValue::Date(*v),
            Value::Time(v) => PgValue::Time(*v),
            Value::DateTime(v) => PgValue::DateTime(*v),
            Value::Array(items) => PgValue::TextArray(items.iter().map(|v| v.to_string()).collect()),
        }
    }
}

fn parse_naive_datetime(value: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::Int16(v) => v.to_sql(ty, out),
            PgValue::Int32(v) => v.to_sql(ty, out),
            PgValue::Int64(v) => v.to_sql(ty, out),
            PgValue::Float32(v) => v.to_sql(ty, out),
            PgValue::Float64(v) => v.to_sql(ty, out),
            PgValue::Numeric(v) => {
                encode_numeric(v, out)?;
                Ok(IsNull::No)
            }
            // Written as raw UTF-8, which is also the binary form of enums and other text-like types
            PgValue::String(v) => {
                out.put_slice(v.as_bytes());
                Ok(IsNull::No)
            }
            PgValue::Bytes(v) => v.to_sql(ty, out),
            PgValue::Uuid(v) => v.to_sql(ty, out),
            PgValue::Json(v) => v.to_sql(ty, out),
            PgValue::DateTimeUtc(v) => v.to_sql(ty, out),
            PgValue::Date(v) => v.to_sql(ty, out),
            PgValue::Time(v) => v.to_sql(ty, out),
            PgValue::DateTime(v) => v.to_sql(ty, out),
            PgValue::TextArray(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Write a plain decimal literal (`-12.340`) in PostgreSQL's binary NUMERIC format:
/// base-10000 digit groups preceded by count, weight, sign and display scale.
pub(crate) fn encode_numeric(text: &str, out: &mut BytesMut) -> std::result::Result<(), BoxError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(NUMERIC_NAN);
        out.put_u16(0);
        return Ok(());
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return Err(format!("invalid numeric literal '{}'", text).into());
    }

    let dscale = frac_part.len();
    let int_pad = (4 - int_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let group = |chunk: &[u8]| -> u16 {
        chunk.iter().fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'))
    };
    let int_groups: Vec<u16> = int_digits.as_bytes().chunks(4).map(group).collect();
    let frac_groups: Vec<u16> = frac_digits.as_bytes().chunks(4).map(group).collect();

    let mut weight = int_groups.len() as i32 - 1;
    let mut digits: Vec<u16> = int_groups.into_iter().chain(frac_groups).collect();

    let leading_zeros = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading_zeros);
    weight -= leading_zeros as i32;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    let sign = if digits.is_empty() || !negative {
        NUMERIC_POS
    } else {
        NUMERIC_NEG
    };
    if digits.is_empty() {
        weight = 0;
    }

    out.put_i16(i16::try_from(digits.len())?);
    out.put_i16(i16::try_from(weight)?);
    out.put_u16(sign);
    out.put_u16(u16::try_from(dscale)?);
    for d in digits {
        out.put_u16(d);
    }
    Ok(())
}

/// NUMERIC decoded to its exact decimal text, keeping the display scale
#[derive(Debug)]
pub(crate) struct PgNumericString(pub(crate) String);

impl PgNumericString {
    fn parse(raw: &[u8]) -> std::result::Result<String, BoxError> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC payload: too short".into());
        }

        let ndigits = i16::from_be_bytes([raw[0], raw[1]]) as usize;
        let weight = i16::from_be_bytes([raw[2], raw[3]]);
        let sign = u16::from_be_bytes([raw[4], raw[5]]);
        let dscale = i16::from_be_bytes([raw[6], raw[7]]) as usize;
        if raw.len() < 8 + ndigits * 2 {
            return Err("invalid NUMERIC payload: truncated digits".into());
        }
        if sign == NUMERIC_NAN {
            return Ok("NaN".to_string());
        }

        let digits: Vec<u16> = (0..ndigits)
            .map(|i| u16::from_be_bytes([raw[8 + i * 2], raw[9 + i * 2]]))
            .collect();
        if digits.iter().any(|g| *g > 9999) {
            return Err("invalid NUMERIC payload: group out of range".into());
        }

        // digit i has weight (weight - i)
        let digit_at = |w: i32| -> u16 {
            let idx = i32::from(weight) - w;
            if idx >= 0 {
                digits.get(idx as usize).copied().unwrap_or(0)
            } else {
                0
            }
        };

        let mut integer_text = String::new();
        if weight >= 0 {
            for w in (0..=i32::from(weight)).rev() {
                let g = digit_at(w);
                if integer_text.is_empty() {
                    integer_text.push_str(&g.to_string());
                } else {
                    integer_text.push_str(&format!("{g:04}"));
                }
            }
        } else {
            integer_text.push('0');
        }

        let mut fraction_text = String::new();
        let mut w = -1;
        while fraction_text.len() < dscale {
            fraction_text.push_str(&format!("{:04}", digit_at(w)));
            w -= 1;
        }
        fraction_text.truncate(dscale);

        let mut output = String::new();
        let is_zero = digits.iter().all(|d| *d == 0);
        if sign == NUMERIC_NEG && !is_zero {
            output.push('-');
        }
        output.push_str(&integer_text);
        if !fraction_text.is_empty() {
            output.push('.');
            output.push_str(&fraction_text);
        }
        Ok(output)
    }
}

impl<'a> FromSql<'a> for PgNumericString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Raw UTF-8 payload, used for enums and other text-like custom types
#[derive(Debug)]
struct PgFallbackString(String);

impl<'a> FromSql<'a> for PgFallbackString {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(String::from_utf8(raw.to_vec())?))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a PgRow, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert one column of a PostgreSQL row
pub(crate) fn postgres_to_value(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_().name();

    let value = match type_name {
        "bool" => get::<bool>(row, idx).map(Value::Bool),
        "int2" => get::<i16>(row, idx).map(Value::Int16),
        "int4" => get::<i32>(row, idx).map(Value::Int32),
        "int8" => get::<i64>(row, idx).map(Value::Int64),
        "oid" => get::<u32>(row, idx).map(|v| Value::Int64(i64::from(v))),
        "float4" => get::<f32>(row, idx).map(Value::Float32),
        "float8" => get::<f64>(row, idx).map(Value::Float64),
        "numeric" => get::<PgNumericString>(row, idx).map(|v| Value::Decimal(v.0)),
        "text" | "varchar" | "bpchar" | "name" | "char" => get::<String>(row, idx).map(Value::String),
        "bytea" => get::<Vec<u8>>(row, idx).map(Value::Bytes),
        "uuid" => get::<uuid::Uuid>(row, idx).map(Value::Uuid),
        "json" | "jsonb" => get::<serde_json::Value>(row, idx).map(Value::Json),
        "date" => get::<chrono::NaiveDate>(row, idx).map(Value::Date),
        "time" => get::<chrono::NaiveTime>(row, idx).map(Value::Time),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeUtc),
        // Array type names carry a leading underscore
        "_text" | "_varchar" | "_bpchar" | "_name" => get::<Vec<String>>(row, idx)
            .map(|arr| Value::Array(arr.into_iter().map(Value::String).collect())),
        "_int2" => get::<Vec<i16>>(row, idx)
            .map(|arr| Value::Array(arr.into_iter().map(Value::Int16).collect())),
        "_int4" => get::<Vec<i32>>(row, idx)
            .map(|arr| Value::Array(arr.into_iter().map(Value::Int32).collect())),
        "_int8" => get::<Vec<i64>>(row, idx)
            .map(|arr| Value::Array(arr.into_iter().map(Value::Int64).collect())),
        "_bool" => get::<Vec<bool>>(row, idx)
            .map(|arr| Value::Array(arr.into_iter().map(Value::Bool).collect())),
        _ => get::<PgFallbackString>(row, idx).map(|v| Value::String(v.0)),
    };

    Ok(value.unwrap_or(Value::Null))
}
