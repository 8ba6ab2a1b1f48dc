// RESP2 command encoding and reply parsing for the remote store client.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{Error, ErrorKind};

pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_DEPTH: usize = 16;

#[derive(Clone, Debug, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::Bulk(bytes) => bytes,
            RespValue::Simple(text) => Some(Bytes::from(text)),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => items,
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        self.into_bytes()
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
    }

    /// Turn a server error reply into an `Error`; any other value passes through.
    pub fn into_result(self) -> Result<RespValue, Error> {
        match self {
            RespValue::Error(message) => Err(Error::new(ErrorKind::Protocol)
                .with_message(format!("server error: {message}"))),
            other => Ok(other),
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        out.put_slice(arg.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Parse one reply from the front of `buf`, consuming it. `Ok(None)` means more bytes are needed.
pub fn decode_reply(buf: &mut BytesMut) -> Result<Option<RespValue>, Error> {
    match parse_value(buf, 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(data: &[u8], depth: usize) -> Result<Option<(RespValue, usize)>, Error> {
    if depth > MAX_DEPTH {
        return Err(protocol_error("reply nesting too deep"));
    }
    let Some(&prefix) = data.first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(&data[1..]) else {
        return Ok(None);
    };
    let line = &data[1..1 + line_end];
    let header_len = 1 + line_end + 2;

    match prefix {
        b'+' => Ok(Some((RespValue::Simple(line_text(line)), header_len))),
        b'-' => Ok(Some((RespValue::Error(line_text(line)), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), header_len)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(protocol_error("bulk reply too large"));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(protocol_error("missing CRLF after bulk reply"));
            }
            let bytes = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((RespValue::Bulk(Some(bytes)), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), header_len)));
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(protocol_error("array reply too large"));
            }
            let mut items = Vec::with_capacity(len.min(64));
            let mut offset = header_len;
            for _ in 0..len {
                match parse_value(&data[offset..], depth + 1)? {
                    Some((item, consumed)) => {
                        items.push(item);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), offset)))
        }
        other => Err(protocol_error(format!(
            "unexpected reply prefix 0x{other:02x}"
        ))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

fn line_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn parse_int(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| protocol_error("invalid integer in reply"))
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Protocol).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::{RespValue, decode_reply, encode_command};
    use crate::core::error::ErrorKind;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let mut out = BytesMut::new();
        encode_command(&["SET", "k", "v"], &mut out);
        assert_eq!(&out[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn decodes_scalars() {
        let mut buf = BytesMut::from(&b"+OK\r\n:42\r\n$-1\r\n-ERR nope\r\n"[..]);
        assert_eq!(
            decode_reply(&mut buf).expect("ok"),
            Some(RespValue::Simple("OK".to_string()))
        );
        assert_eq!(
            decode_reply(&mut buf).expect("int"),
            Some(RespValue::Integer(42))
        );
        assert_eq!(
            decode_reply(&mut buf).expect("nil"),
            Some(RespValue::Bulk(None))
        );
        let err = decode_reply(&mut buf)
            .expect("error reply")
            .expect("value")
            .into_result()
            .expect_err("server error");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_replies_wait_for_more_bytes() {
        let mut buf = BytesMut::from(&b"*2\r\n$5\r\nhel"[..]);
        assert_eq!(decode_reply(&mut buf).expect("partial"), None);
        assert_eq!(buf.len(), 11);
        buf.extend_from_slice(b"lo\r\n:7\r\n");
        let value = decode_reply(&mut buf).expect("full").expect("value");
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::Bulk(Some(Bytes::from_static(b"hello"))),
                RespValue::Integer(7),
            ]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        let err = decode_reply(&mut buf).expect_err("bad prefix");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
