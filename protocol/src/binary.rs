//! Byte-oriented codec. Header fields are read at fixed offsets straight out
//! of the unit, no intermediate string conversion.

use crate::{
    CodecError, ID_LEN, MAX_NAME_LEN, Msg, MsgType, NAME_LEN_DIGITS, Protocol, SIZE_DIGITS, VERSION_DIGITS,
    max_for_digits, parse_hex,
};

/// Codec producing `Vec<u8>` units.
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn push_hex(buf: &mut Vec<u8>, n: u32, digits: usize) {
    let n = n.min(max_for_digits(digits));
    for i in (0..digits).rev() {
        let nibble = if i >= 8 { 0 } else { (n >> (4 * i)) & 0xF };
        buf.push(HEX_DIGITS[nibble as usize]);
    }
}

/// Forward-only reader over a header unit.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let field = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(field)
    }

    fn hex(&mut self, digits: usize) -> Option<u32> {
        parse_hex(self.take(digits)?)
    }

    fn utf8(&mut self, n: usize) -> Option<String> {
        std::str::from_utf8(self.take(n)?).ok().map(str::to_owned)
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

impl Protocol for Binary {
    type Unit = Vec<u8>;

    fn make_fixnum(n: u32, digits: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(digits);
        push_hex(&mut buf, n, digits);
        buf
    }

    fn parse_version(unit: &Vec<u8>) -> Result<u32, CodecError> {
        if unit.len() != VERSION_DIGITS {
            return Err(CodecError::InvalidVersion);
        }
        parse_hex(unit).ok_or(CodecError::InvalidVersion)
    }

    fn parse_msg(unit: &Vec<u8>) -> Option<Msg> {
        let (&tag, _) = unit.split_first()?;
        let t = MsgType::from_byte(tag)?;
        let layout = t.layout();
        let mut cur = Cursor { buf: unit, pos: 1 };

        let id = if layout.id { Some(cur.utf8(ID_LEN)?) } else { None };
        let name = if layout.name {
            let len = cur.hex(NAME_LEN_DIGITS)? as usize;
            Some(cur.utf8(len)?)
        } else {
            None
        };
        let wait = if layout.wait_digits > 0 { cur.hex(layout.wait_digits)? } else { 0 };
        let size = cur.hex(SIZE_DIGITS)?;

        if !cur.at_end() {
            return None;
        }
        Some(Msg { t, id, name, wait, size })
    }

    fn make_msg(t: MsgType, id: Option<&str>, name: Option<&str>, wait: u32, size: u32) -> Result<Vec<u8>, CodecError> {
        let layout = t.layout();
        let name = name.unwrap_or("");
        let mut buf = Vec::with_capacity(1 + ID_LEN + NAME_LEN_DIGITS + name.len() + layout.wait_digits + SIZE_DIGITS);
        buf.push(t.as_byte());

        if layout.id {
            let id = id.filter(|id| id.len() == ID_LEN).ok_or(CodecError::InvalidId)?;
            buf.extend_from_slice(id.as_bytes());
        }
        if layout.name {
            if name.len() > MAX_NAME_LEN {
                return Err(CodecError::NameTooLong(name.len()));
            }
            // Bounded by MAX_NAME_LEN above.
            #[allow(clippy::cast_possible_truncation)]
            push_hex(&mut buf, name.len() as u32, NAME_LEN_DIGITS);
            buf.extend_from_slice(name.as_bytes());
        }
        if layout.wait_digits > 0 {
            push_hex(&mut buf, wait, layout.wait_digits);
        }
        push_hex(&mut buf, size, SIZE_DIGITS);
        Ok(buf)
    }

    fn make_heartbeat_msg(load: u16, time: u32) -> Vec<u8> {
        // Heartbeats carry no id or name, so encoding cannot fail.
        Self::make_msg(MsgType::Heartbeat, None, None, u32::from(load), time).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "binary_test.rs"]
mod tests;
