// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// Bencoded dict/list codec for the binary request surface, plus the
// `json_to_bt` / `bt_to_json` converter pair used to answer requests in
// the encoding they arrived in.

use std::collections::BTreeMap;

use base64::Engine;

use crate::error::{Error, Result};

/// A decoded bencode value.  Dict keys are raw byte strings; `BTreeMap`
/// keeps them in the ASCII-sorted order canonical bencoding requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(value.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Serialize a value into canonical bencoding.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(v) => {
            out.push(b'i');
            out.extend_from_slice(v.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Parse a single bencoded value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut pos = 0;
    let value = decode_at(bytes, &mut pos)?;
    if pos != bytes.len() {
        return Err(Error::BadRequest("trailing bytes after bencoded value".into()));
    }
    Ok(value)
}

fn decode_at(bytes: &[u8], pos: &mut usize) -> Result<Value> {
    match bytes.get(*pos) {
        Some(b'i') => {
            *pos += 1;
            let end = find_byte(bytes, *pos, b'e')?;
            let text = std::str::from_utf8(&bytes[*pos..end])
                .map_err(|_| Error::BadRequest("non-ascii integer".into()))?;
            let value: i64 = text
                .parse()
                .map_err(|_| Error::BadRequest(format!("bad bencoded integer {text:?}")))?;
            *pos = end + 1;
            Ok(Value::Int(value))
        }
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            while bytes.get(*pos) != Some(&b'e') {
                if *pos >= bytes.len() {
                    return Err(Error::BadRequest("unterminated bencoded list".into()));
                }
                items.push(decode_at(bytes, pos)?);
            }
            *pos += 1;
            Ok(Value::List(items))
        }
        Some(b'd') => {
            *pos += 1;
            let mut entries = BTreeMap::new();
            let mut last_key: Option<Vec<u8>> = None;
            while bytes.get(*pos) != Some(&b'e') {
                if *pos >= bytes.len() {
                    return Err(Error::BadRequest("unterminated bencoded dict".into()));
                }
                let key = match decode_at(bytes, pos)? {
                    Value::Bytes(key) => key,
                    _ => return Err(Error::BadRequest("dict key must be a string".into())),
                };
                if let Some(prev) = &last_key {
                    if *prev >= key {
                        return Err(Error::BadRequest("dict keys out of order".into()));
                    }
                }
                let value = decode_at(bytes, pos)?;
                last_key = Some(key.clone());
                entries.insert(key, value);
            }
            *pos += 1;
            Ok(Value::Dict(entries))
        }
        Some(c) if c.is_ascii_digit() => {
            let colon = find_byte(bytes, *pos, b':')?;
            let len_text = std::str::from_utf8(&bytes[*pos..colon])
                .map_err(|_| Error::BadRequest("bad string length".into()))?;
            let len: usize = len_text
                .parse()
                .map_err(|_| Error::BadRequest(format!("bad string length {len_text:?}")))?;
            let start = colon + 1;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| Error::BadRequest("string length overruns input".into()))?;
            *pos = end;
            Ok(Value::Bytes(bytes[start..end].to_vec()))
        }
        Some(c) => Err(Error::BadRequest(format!(
            "unexpected byte 0x{c:02x} in bencoded value"
        ))),
        None => Err(Error::BadRequest("empty bencoded value".into())),
    }
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Result<usize> {
    bytes[from..]
        .iter()
        .position(|b| *b == needle)
        .map(|offset| from + offset)
        .ok_or_else(|| Error::BadRequest("truncated bencoded value".into()))
}

/// Convert a JSON value into a bencode value.  Strings become byte
/// strings; bools, floats and nulls have no bencoded representation and
/// are rejected.
pub fn json_to_bt(json: &serde_json::Value) -> Result<Value> {
    match json {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| Error::BadRequest(format!("unrepresentable number {n}"))),
        serde_json::Value::String(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
        serde_json::Value::Array(items) => Ok(Value::List(
            items.iter().map(json_to_bt).collect::<Result<Vec<_>>>()?,
        )),
        serde_json::Value::Object(entries) => {
            let mut dict = BTreeMap::new();
            for (key, value) in entries {
                dict.insert(key.as_bytes().to_vec(), json_to_bt(value)?);
            }
            Ok(Value::Dict(dict))
        }
        serde_json::Value::Bool(_) | serde_json::Value::Null => Err(Error::BadRequest(
            "bools and nulls have no bencoded representation".into(),
        )),
    }
}

/// Convert a bencode value into JSON.  Byte strings that are valid UTF-8
/// come back as JSON strings (making the converter pair a round-trip for
/// JSON-originated data); raw binary is base64-encoded.
pub fn bt_to_json(value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::Int(v) => Ok(serde_json::Value::from(*v)),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Ok(serde_json::Value::String(text.to_owned())),
            Err(_) => Ok(serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            )),
        },
        Value::List(items) => Ok(serde_json::Value::Array(
            items.iter().map(bt_to_json).collect::<Result<Vec<_>>>()?,
        )),
        Value::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (key, item) in entries {
                let key = String::from_utf8(key.clone())
                    .map_err(|_| Error::BadRequest("non-utf8 dict key".into()))?;
                map.insert(key, bt_to_json(item)?);
            }
            Ok(serde_json::Value::Object(map))
        }
    }
}
