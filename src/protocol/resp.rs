use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;

/// Upper bound on a single bulk-bytes payload (512 MiB).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Upper bound on the number of elements in one array.
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

pub const RESP_STRING: u8 = b'+';
pub const RESP_ERROR: u8 = b'-';
pub const RESP_INT: u8 = b':';
pub const RESP_BULK: u8 = b'$';
pub const RESP_ARRAY: u8 = b'*';

pub const BYTE_CR: u8 = b'\r';
pub const BYTE_LF: u8 = b'\n';
pub const BYTE_SPACE: u8 = b' ';

/// One RESP value.
///
/// `BulkBytes` and `Array` are nullable on the wire (`$-1`, `*-1`); the
/// null forms are distinct variants so a round trip preserves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkBytes(Bytes),
    NullBulk,
    Array(Vec<Resp>),
    NullArray,
}

impl Resp {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        Resp::Simple(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        Resp::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        Resp::BulkBytes(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn array(values: Vec<Resp>) -> Self {
        Resp::Array(values)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Resp::Error(_))
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, Resp::Simple(_))
    }

    /// Payload of a bulk-bytes value, if that is what this is.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Resp::BulkBytes(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Resp]> {
        match self {
            Resp::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Canonical `+OK`.
    pub fn ok() -> Self {
        Resp::Simple(Bytes::from_static(b"OK"))
    }

    /// Canonical `+PONG`.
    pub fn pong() -> Self {
        Resp::Simple(Bytes::from_static(b"PONG"))
    }
}

const ITOA_OFFSET: i64 = 1024;
const ITOA_SPAN: usize = 1024 * 128 + 1024;

/// Precomputed decimal strings for integers in `[-1024, 131072)`.
/// Reply lengths and counters land in this window almost always, so the
/// encoder never formats them at runtime.
static ITOA_TABLE: Lazy<Vec<Bytes>> = Lazy::new(|| {
    (0..ITOA_SPAN as i64)
        .map(|n| Bytes::from((n - ITOA_OFFSET).to_string()))
        .collect()
});

/// Append the decimal form of `value` to `dst`, using the fast table when
/// the value is inside its window.
pub fn put_decimal(dst: &mut BytesMut, value: i64) {
    match value.checked_add(ITOA_OFFSET) {
        Some(index) if (0..ITOA_SPAN as i64).contains(&index) => {
            dst.put_slice(&ITOA_TABLE[index as usize]);
        }
        _ => dst.put_slice(value.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_table_window_matches_formatting() {
        let mut buf = BytesMut::new();
        for value in [-1024, -1, 0, 9, 1023, 131071, 131072, i64::MIN, i64::MAX] {
            buf.clear();
            put_decimal(&mut buf, value);
            assert_eq!(&buf[..], value.to_string().as_bytes());
        }
    }

    #[test]
    fn null_forms_are_distinct() {
        assert_ne!(Resp::NullBulk, Resp::bulk(b""));
        assert_ne!(Resp::NullArray, Resp::array(vec![]));
    }
}
