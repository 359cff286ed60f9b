//! Self-delimiting binary wire format for the media-relay control protocol
//! (§4.6): length-prefixed byte strings, base-10 terminated integers, and
//! nested lists/dictionaries — the format this lineage's control-plane peers
//! (rtpengine-alikes) speak. No reference implementation of this wire format
//! appears anywhere in this crate's retrieved corpus; it is built directly
//! from §4.6's textual description rather than copied from an example.

use std::collections::BTreeMap;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BValue>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    pub fn str(s: impl Into<String>) -> Self {
        BValue::Bytes(s.into().into_bytes())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BValue> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}

pub fn encode(value: &BValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BValue, out: &mut Vec<u8>) {
    match value {
        BValue::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        BValue::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BValue::Dict(map) => {
            out.push(b'd');
            for (k, v) in map {
                encode_into(&BValue::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

pub fn decode(input: &[u8]) -> Result<BValue> {
    let mut pos = 0;
    let value = decode_at(input, &mut pos)?;
    Ok(value)
}

fn decode_at(input: &[u8], pos: &mut usize) -> Result<BValue> {
    let tag = *input.get(*pos).ok_or_else(|| Error::protocol("bencode: unexpected end of input"))?;
    match tag {
        b'i' => {
            *pos += 1;
            let end = find(input, *pos, b'e')?;
            let text = std::str::from_utf8(&input[*pos..end]).map_err(|_| Error::protocol("bencode: non-utf8 integer"))?;
            let n: i64 = text.parse().map_err(|_| Error::protocol("bencode: malformed integer"))?;
            *pos = end + 1;
            Ok(BValue::Int(n))
        }
        b'l' => {
            *pos += 1;
            let mut items = Vec::new();
            while input.get(*pos) != Some(&b'e') {
                items.push(decode_at(input, pos)?);
            }
            *pos += 1;
            Ok(BValue::List(items))
        }
        b'd' => {
            *pos += 1;
            let mut map = BTreeMap::new();
            while input.get(*pos) != Some(&b'e') {
                let key = decode_at(input, pos)?;
                let key_bytes = match key {
                    BValue::Bytes(b) => b,
                    _ => return Err(Error::protocol("bencode: dict key must be a byte string")),
                };
                let value = decode_at(input, pos)?;
                map.insert(key_bytes, value);
            }
            *pos += 1;
            Ok(BValue::Dict(map))
        }
        b'0'..=b'9' => {
            let colon = find(input, *pos, b':')?;
            let len_text = std::str::from_utf8(&input[*pos..colon]).map_err(|_| Error::protocol("bencode: non-utf8 length"))?;
            let len: usize = len_text.parse().map_err(|_| Error::protocol("bencode: malformed string length"))?;
            let start = colon + 1;
            let end = start + len;
            if end > input.len() {
                return Err(Error::protocol("bencode: string length exceeds input"));
            }
            *pos = end;
            Ok(BValue::Bytes(input[start..end].to_vec()))
        }
        other => Err(Error::protocol(format!("bencode: unexpected tag byte {other}"))),
    }
}

fn find(input: &[u8], from: usize, needle: u8) -> Result<usize> {
    input[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or_else(|| Error::protocol("bencode: missing terminator"))
}

pub fn dict(pairs: Vec<(&str, BValue)>) -> BValue {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
        map.insert(k.as_bytes().to_vec(), v);
    }
    BValue::Dict(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_integer() {
        let v = BValue::Int(-42);
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn round_trips_byte_string() {
        let v = BValue::str("offer");
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn round_trips_nested_dict_and_list() {
        let v = dict(vec![
            ("command", BValue::str("offer")),
            ("flags", BValue::List(vec![BValue::str("a"), BValue::str("b")])),
            ("call-id", BValue::str("abc123")),
        ]);
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn get_reads_dict_field() {
        let v = dict(vec![("result", BValue::str("ok"))]);
        assert_eq!(v.get("result").and_then(|r| r.as_str()), Some("ok"));
    }

    #[test]
    fn truncated_string_length_errors() {
        assert!(decode(b"10:short").is_err());
    }
}
