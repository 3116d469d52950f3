use bytes::{Buf, BufMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Strings on the wire are prefixed with their length as a u16
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BufError {
    #[error("buffer underflow: needed {needed} bytes, {available} remaining")]
    Underflow { needed: usize, available: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, BufError> {
            self.ensure_remaining(std::mem::size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads: all numbers in network byte order
pub trait CheckedBuf: Buf {
    fn ensure_remaining(&self, needed: usize) -> Result<(), BufError> {
        if self.remaining() < needed {
            return Err(BufError::Underflow { needed, available: self.remaining() });
        }
        Ok(())
    }

    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_u16, u16, get_u16);
    checked_get_impl!(checked_get_u32, u32, get_u32);
    checked_get_impl!(checked_get_i64, i64, get_i64);
    checked_get_impl!(checked_get_u128, u128, get_u128);

    fn checked_get_string(&mut self) -> Result<String, BufError> {
        let len: usize = self.checked_get_u16()?.safe_cast();
        self.ensure_remaining(len)?;
        let raw = self.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| BufError::InvalidUtf8)
    }
}

impl <T: Buf> CheckedBuf for T {
}

/// NB: callers must ensure that the string's length does not exceed [MAX_STRING_LEN]
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", b"\0\0")]
    #[case::ascii("abc", b"\0\x03abc")]
    #[case::utf8("ä", b"\0\x02\xc3\xa4")]
    fn test_put_string(#[case] s: &str, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(buf.as_ref(), expected);

        let mut b: &[u8] = &buf;
        assert_eq!(b.checked_get_string().unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::no_len(b"\0", BufError::Underflow { needed: 2, available: 1 })]
    #[case::short_string(b"\0\x03ab", BufError::Underflow { needed: 3, available: 2 })]
    #[case::bad_utf8(b"\0\x01\xff", BufError::InvalidUtf8)]
    fn test_checked_get_string_error(#[case] mut buf: &[u8], #[case] expected: BufError) {
        assert_eq!(buf.checked_get_string().unwrap_err(), expected);
    }

    #[test]
    fn test_checked_get_remainder() {
        let mut buf: &[u8] = b"\0\0\0\x05\x07";
        assert_eq!(buf.checked_get_u32().unwrap(), 5);
        assert_eq!(buf, b"\x07");
        assert!(buf.checked_get_u16().is_err());
    }
}
