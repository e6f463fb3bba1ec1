//! String-oriented codec, for transports that only carry text units.

use std::fmt::Write;

use crate::{
    CodecError, ID_LEN, MAX_NAME_LEN, Msg, MsgType, NAME_LEN_DIGITS, Protocol, SIZE_DIGITS, VERSION_DIGITS,
    max_for_digits, parse_hex,
};

/// Codec producing `String` units.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

fn write_hex(out: &mut String, n: u32, digits: usize) {
    let n = n.min(max_for_digits(digits));
    let _ = write!(out, "{n:0digits$x}");
}

/// Forward-only reader over a header string. Offsets are byte offsets and
/// must land on char boundaries.
struct Fields<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize) -> Option<&'a str> {
        let end = self.pos.checked_add(n)?;
        let field = self.s.get(self.pos..end)?;
        self.pos = end;
        Some(field)
    }

    fn hex(&mut self, digits: usize) -> Option<u32> {
        parse_hex(self.take(digits)?.as_bytes())
    }

    fn finished(&self) -> bool {
        self.pos == self.s.len()
    }
}

impl Protocol for Text {
    type Unit = String;

    fn make_fixnum(n: u32, digits: usize) -> String {
        let mut out = String::with_capacity(digits);
        write_hex(&mut out, n, digits);
        out
    }

    fn parse_version(unit: &String) -> Result<u32, CodecError> {
        if unit.len() != VERSION_DIGITS {
            return Err(CodecError::InvalidVersion);
        }
        parse_hex(unit.as_bytes()).ok_or(CodecError::InvalidVersion)
    }

    fn parse_msg(unit: &String) -> Option<Msg> {
        let t = MsgType::from_byte(*unit.as_bytes().first()?)?;
        let layout = t.layout();
        let mut fields = Fields { s: unit, pos: 1 };

        let id = if layout.id { Some(fields.take(ID_LEN)?.to_owned()) } else { None };
        let name = if layout.name {
            let len = fields.hex(NAME_LEN_DIGITS)? as usize;
            Some(fields.take(len)?.to_owned())
        } else {
            None
        };
        let wait = if layout.wait_digits > 0 { fields.hex(layout.wait_digits)? } else { 0 };
        let size = fields.hex(SIZE_DIGITS)?;

        fields.finished().then_some(Msg { t, id, name, wait, size })
    }

    fn make_msg(t: MsgType, id: Option<&str>, name: Option<&str>, wait: u32, size: u32) -> Result<String, CodecError> {
        let layout = t.layout();
        let name = name.unwrap_or("");
        let mut out = String::with_capacity(1 + ID_LEN + NAME_LEN_DIGITS + name.len() + layout.wait_digits + SIZE_DIGITS);
        out.push(char::from(t.as_byte()));

        if layout.id {
            let id = id.filter(|id| id.len() == ID_LEN).ok_or(CodecError::InvalidId)?;
            out.push_str(id);
        }
        if layout.name {
            if name.len() > MAX_NAME_LEN {
                return Err(CodecError::NameTooLong(name.len()));
            }
            #[allow(clippy::cast_possible_truncation)]
            write_hex(&mut out, name.len() as u32, NAME_LEN_DIGITS);
            out.push_str(name);
        }
        if layout.wait_digits > 0 {
            write_hex(&mut out, wait, layout.wait_digits);
        }
        write_hex(&mut out, size, SIZE_DIGITS);
        Ok(out)
    }

    fn make_heartbeat_msg(load: u16, time: u32) -> String {
        Self::make_msg(MsgType::Heartbeat, None, None, u32::from(load), time).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "text_test.rs"]
mod tests;
