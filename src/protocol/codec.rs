use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;

use super::resp::{
    put_decimal, Resp, BYTE_CR, BYTE_LF, BYTE_SPACE, MAX_ARRAY_LEN, MAX_BULK_LEN, RESP_ARRAY,
    RESP_BULK, RESP_ERROR, RESP_INT, RESP_STRING,
};

/// Decoder/encoder for whole RESP values, used on backend reply streams
/// and on the session reply path.
///
/// Decoding is incremental over the accumulation buffer: an incomplete
/// frame yields `Ok(None)` and leaves the buffer untouched. Once a decode
/// has failed the codec refuses further work; recovery on a stream with a
/// half-consumed frame would be ambiguous.
#[derive(Debug, Default)]
pub struct RespCodec {
    failed: bool,
}

impl Decoder for RespCodec {
    type Item = Resp;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Resp>, ProxyError> {
        if self.failed {
            return Err(ProxyError::FailedDecoder);
        }
        let mut pos = 0usize;
        match parse_resp(&src[..], &mut pos) {
            Ok(Some(resp)) => {
                src.advance(pos);
                Ok(Some(resp))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }
}

impl Encoder<Resp> for RespCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Resp, dst: &mut BytesMut) -> Result<(), ProxyError> {
        if self.failed {
            return Err(ProxyError::FailedEncoder);
        }
        encode_resp(&item, dst);
        Ok(())
    }
}

/// Decoder for client commands: the multi-bulk entry point.
///
/// A leading `*` decodes as an array of bulk-bytes elements; anything else
/// is an inline command, split on ASCII spaces. `max_buffer` bounds the
/// bytes a client may leave undecodable before the session is dropped
/// (0 disables the check).
#[derive(Debug)]
pub struct CommandCodec {
    max_buffer: usize,
    failed: bool,
}

impl CommandCodec {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            max_buffer,
            failed: false,
        }
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for CommandCodec {
    type Item = Vec<Resp>;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<Resp>>, ProxyError> {
        if self.failed {
            return Err(ProxyError::FailedDecoder);
        }
        let mut pos = 0usize;
        match parse_multi_bulk(&src[..], &mut pos) {
            Ok(Some(multi)) => {
                src.advance(pos);
                Ok(Some(multi))
            }
            Ok(None) => {
                if self.max_buffer != 0 && src.len() > self.max_buffer {
                    self.failed = true;
                    return Err(ProxyError::TooMuchPendingData);
                }
                Ok(None)
            }
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }
}

impl Encoder<Resp> for CommandCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Resp, dst: &mut BytesMut) -> Result<(), ProxyError> {
        encode_resp(&item, dst);
        Ok(())
    }
}

/// Parse one RESP value starting at `*pos`. Returns `Ok(None)` and leaves
/// `*pos` unchanged when the buffer does not yet hold a complete frame.
pub(crate) fn parse_resp(src: &[u8], pos: &mut usize) -> Result<Option<Resp>, ProxyError> {
    let start = *pos;
    if start >= src.len() {
        return Ok(None);
    }
    let prefix = src[start];
    *pos += 1;

    let parsed = match prefix {
        RESP_STRING => read_line(src, pos)?.map(|line| Resp::Simple(Bytes::copy_from_slice(line))),
        RESP_ERROR => read_line(src, pos)?.map(|line| Resp::Error(Bytes::copy_from_slice(line))),
        RESP_INT => match read_line(src, pos)? {
            Some(line) => Some(Resp::Integer(parse_int(line)?)),
            None => None,
        },
        RESP_BULK => return parse_bulk(src, pos, start),
        RESP_ARRAY => return parse_array(src, pos, start),
        other => return Err(ProxyError::BadRespType(other)),
    };

    match parsed {
        Some(resp) => Ok(Some(resp)),
        None => {
            *pos = start;
            Ok(None)
        }
    }
}

fn parse_bulk(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<Resp>, ProxyError> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let n = parse_int(line)?;
    if n < -1 {
        return Err(ProxyError::BadBulkBytesLen);
    }
    if n > MAX_BULK_LEN {
        return Err(ProxyError::BadBulkBytesLenTooLong);
    }
    if n == -1 {
        return Ok(Some(Resp::NullBulk));
    }

    let body = *pos;
    let total = body + n as usize + 2;
    if src.len() < total {
        *pos = start;
        return Ok(None);
    }
    if src[total - 2] != BYTE_CR || src[total - 1] != BYTE_LF {
        return Err(ProxyError::BadCrlfEnd);
    }
    *pos = total;
    Ok(Some(Resp::BulkBytes(Bytes::copy_from_slice(
        &src[body..total - 2],
    ))))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<Resp>, ProxyError> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let n = parse_int(line)?;
    if n < -1 {
        return Err(ProxyError::BadArrayLen);
    }
    if n > MAX_ARRAY_LEN {
        return Err(ProxyError::BadArrayLenTooLong);
    }
    if n == -1 {
        return Ok(Some(Resp::NullArray));
    }

    let mut values = Vec::with_capacity((n as usize).min(1024));
    for _ in 0..n {
        match parse_resp(src, pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(Resp::Array(values)))
}

/// Parse one client command: a multi-bulk array, or an inline command when
/// the first byte is not `*`.
pub(crate) fn parse_multi_bulk(
    src: &[u8],
    pos: &mut usize,
) -> Result<Option<Vec<Resp>>, ProxyError> {
    let start = *pos;
    if start >= src.len() {
        return Ok(None);
    }
    if src[start] != RESP_ARRAY {
        return parse_inline(src, pos);
    }

    *pos += 1;
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let n = parse_int(line)?;
    if n <= 0 {
        return Err(ProxyError::BadArrayLen);
    }
    if n > MAX_ARRAY_LEN {
        return Err(ProxyError::BadArrayLenTooLong);
    }

    let mut multi = Vec::with_capacity((n as usize).min(1024));
    for _ in 0..n {
        match parse_resp(src, pos)? {
            Some(value @ (Resp::BulkBytes(_) | Resp::NullBulk)) => multi.push(value),
            Some(_) => return Err(ProxyError::BadMultiBulkContent),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(multi))
}

/// Inline commands are a single line of space-separated tokens. Unlike RESP
/// frames they may be terminated by a bare LF.
fn parse_inline(src: &[u8], pos: &mut usize) -> Result<Option<Vec<Resp>>, ProxyError> {
    let start = *pos;
    let lf = match src[start..].iter().position(|&b| b == BYTE_LF) {
        Some(offset) => start + offset,
        None => return Ok(None),
    };
    let mut end = lf;
    if end > start && src[end - 1] == BYTE_CR {
        end -= 1;
    }

    let multi: Vec<Resp> = src[start..end]
        .split(|&b| b == BYTE_SPACE)
        .filter(|token| !token.is_empty())
        .map(Resp::bulk)
        .collect();
    if multi.is_empty() {
        return Err(ProxyError::BadMultiBulkLen);
    }
    *pos = lf + 1;
    Ok(Some(multi))
}

/// Find the next LF and require the byte before it to be CR. `Ok(None)`
/// when no LF is buffered yet.
fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, ProxyError> {
    let start = *pos;
    let lf = match src[start..].iter().position(|&b| b == BYTE_LF) {
        Some(offset) => start + offset,
        None => return Ok(None),
    };
    if lf == start || src[lf - 1] != BYTE_CR {
        return Err(ProxyError::BadCrlfEnd);
    }
    *pos = lf + 1;
    Ok(Some(&src[start..lf - 1]))
}

fn parse_int(line: &[u8]) -> Result<i64, ProxyError> {
    btoi::btoi::<i64>(line).map_err(|_| ProxyError::BadInteger)
}

/// Append the wire form of `resp` to `dst`.
pub fn encode_resp(resp: &Resp, dst: &mut BytesMut) {
    match resp {
        Resp::Simple(data) => encode_text(RESP_STRING, data, dst),
        Resp::Error(data) => encode_text(RESP_ERROR, data, dst),
        Resp::Integer(value) => {
            dst.put_u8(RESP_INT);
            put_decimal(dst, *value);
            dst.put_slice(b"\r\n");
        }
        Resp::BulkBytes(data) => {
            dst.put_u8(RESP_BULK);
            put_decimal(dst, data.len() as i64);
            dst.put_slice(b"\r\n");
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        Resp::NullBulk => dst.put_slice(b"$-1\r\n"),
        Resp::Array(values) => {
            dst.put_u8(RESP_ARRAY);
            put_decimal(dst, values.len() as i64);
            dst.put_slice(b"\r\n");
            for value in values {
                encode_resp(value, dst);
            }
        }
        Resp::NullArray => dst.put_slice(b"*-1\r\n"),
    }
}

/// Append a command (array of bulk bytes) to `dst`.
pub fn encode_multi_bulk(multi: &[Resp], dst: &mut BytesMut) {
    dst.put_u8(RESP_ARRAY);
    put_decimal(dst, multi.len() as i64);
    dst.put_slice(b"\r\n");
    for value in multi {
        encode_resp(value, dst);
    }
}

fn encode_text(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.put_u8(prefix);
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}
