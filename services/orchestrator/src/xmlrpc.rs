//! Minimal XML-RPC codec: enough of the wire format to drive supervisord.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Double(f64),
    Str(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, member: &str) -> Option<&Value> {
        match self {
            Value::Struct(map) => map.get(member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Param<'a> {
    Str(&'a str),
    Bool(bool),
}

#[derive(Debug, Error)]
pub enum XmlRpcError {
    #[error("xml parse: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("fault {code}: {message}")]
    Fault { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub fn encode_call(method: &str, params: &[Param<'_>]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for p in params {
        out.push_str("<param><value>");
        let _ = match p {
            Param::Str(s) => write!(out, "<string>{}</string>", escape(s)),
            Param::Bool(b) => write!(out, "<boolean>{}</boolean>", u8::from(*b)),
        };
        out.push_str("</value></param>");
    }
    out.push_str("</params></methodCall>");
    out
}

enum Frame {
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>, Option<String>),
}

#[derive(Default)]
struct Decoder {
    stack: Vec<Frame>,
    top: Vec<Value>,
    text: String,
    scalar: Option<Vec<u8>>,
    emitted: bool,
    fault: bool,
}

impl Decoder {
    fn emit(&mut self, v: Value) {
        self.emitted = true;
        match self.stack.last_mut() {
            Some(Frame::Array(items)) => items.push(v),
            Some(Frame::Struct(map, name)) => {
                if let Some(n) = name.take() {
                    map.insert(n, v);
                }
            }
            None => self.top.push(v),
        }
    }

    fn scalar(tag: &[u8], text: &str) -> Result<Value, XmlRpcError> {
        let bad = || XmlRpcError::Malformed(format!("bad {} value {text:?}", String::from_utf8_lossy(tag)));
        Ok(match tag {
            b"int" | b"i4" | b"i8" => Value::Int(text.trim().parse().map_err(|_| bad())?),
            b"boolean" => Value::Bool(match text.trim() {
                "1" => true,
                "0" => false,
                _ => return Err(bad()),
            }),
            b"double" => Value::Double(text.trim().parse().map_err(|_| bad())?),
            _ => Value::Str(text.to_string()),
        })
    }
}

fn is_scalar(tag: &[u8]) -> bool {
    matches!(
        tag,
        b"int" | b"i4" | b"i8" | b"boolean" | b"double" | b"string" | b"dateTime.iso8601" | b"base64"
    )
}

/// Decodes a `methodResponse` into its single return value.
/// A `<fault>` response becomes `XmlRpcError::Fault`.
pub fn decode_response(body: &str) -> Result<Value, XmlRpcError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut d = Decoder::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"fault" => d.fault = true,
                b"array" => d.stack.push(Frame::Array(Vec::new())),
                b"struct" => d.stack.push(Frame::Struct(BTreeMap::new(), None)),
                b"name" | b"value" => {
                    d.text.clear();
                    d.emitted = false;
                }
                tag if is_scalar(tag) => {
                    d.scalar = Some(tag.to_vec());
                    d.text.clear();
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"string" | b"value" | b"nil" => d.emit(Value::Str(String::new())),
                b"struct" => d.emit(Value::Struct(BTreeMap::new())),
                b"array" => d.emit(Value::Array(Vec::new())),
                _ => {}
            },
            Event::Text(t) => d.text.push_str(&t.unescape()?),
            Event::CData(t) => d.text.push_str(&String::from_utf8_lossy(&t.into_inner())),
            Event::End(e) => match e.name().as_ref() {
                b"name" => {
                    let name = std::mem::take(&mut d.text);
                    if let Some(Frame::Struct(_, pending)) = d.stack.last_mut() {
                        *pending = Some(name);
                    }
                }
                b"value" => {
                    if !d.emitted {
                        let text = std::mem::take(&mut d.text);
                        d.emit(Value::Str(text));
                    }
                    d.emitted = false;
                }
                b"array" => match d.stack.pop() {
                    Some(Frame::Array(items)) => d.emit(Value::Array(items)),
                    _ => return Err(XmlRpcError::Malformed("unbalanced </array>".into())),
                },
                b"struct" => match d.stack.pop() {
                    Some(Frame::Struct(map, _)) => d.emit(Value::Struct(map)),
                    _ => return Err(XmlRpcError::Malformed("unbalanced </struct>".into())),
                },
                tag if is_scalar(tag) => {
                    if let Some(kind) = d.scalar.take() {
                        let text = std::mem::take(&mut d.text);
                        let v = Decoder::scalar(&kind, &text)?;
                        d.emit(v);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let value = d
        .top
        .into_iter()
        .next()
        .ok_or_else(|| XmlRpcError::Malformed("no return value".into()))?;

    if d.fault {
        return Err(XmlRpcError::Fault {
            code: value.get("faultCode").and_then(Value::as_i64).unwrap_or(-1),
            message: value
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(value)
}
