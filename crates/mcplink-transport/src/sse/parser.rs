//! Line-level SSE parsing.

use bytes::{Buf, BytesMut};

pub(crate) const LF: u8 = b'\n';
pub(crate) const CR: u8 = b'\r';
pub(crate) const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Field names recognised by the event-stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldName {
    Event,
    Data,
    Id,
    Retry,
    Ignored,
}

/// One line of an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    /// Blank line: dispatches the record.
    Empty,
    /// Line starting with `:`.
    Comment,
    /// `name: value` or a bare `name`.
    Field { name: FieldName, value: &'a [u8] },
}

/// Finds the next end-of-line in `bytes`.
///
/// Returns `(line_end, remainder_start)`, or `None` if more data is needed.
/// A trailing CR needs one more byte to tell CR from CRLF.
pub(crate) fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = memchr::memchr2(CR, LF, bytes)?;
    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }
    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}

/// Classify a line (without its terminator).
pub(crate) fn classify(line: &[u8]) -> Line<'_> {
    if line.is_empty() {
        return Line::Empty;
    }
    let (name, value) = match memchr::memchr(b':', line) {
        Some(0) => return Line::Comment,
        Some(colon) => {
            let value = &line[colon + 1..];
            // A single leading space is not part of the value.
            let value = value.strip_prefix(b" ").unwrap_or(value);
            (&line[..colon], value)
        }
        None => (line, &line[line.len()..]),
    };
    let name = match name {
        b"event" => FieldName::Event,
        b"data" => FieldName::Data,
        b"id" => FieldName::Id,
        b"retry" => FieldName::Retry,
        _ => FieldName::Ignored,
    };
    Line::Field { name, value }
}

/// Split the next complete line off the front of `buffer`.
pub(crate) fn next_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let (end, rest) = find_eol(buffer)?;
    let line = buffer.split_to(end);
    buffer.advance(rest - end);
    Some(line)
}

/// Whether `buf` starts with a BOM. `None` while too short to tell.
pub(crate) fn starts_with_bom(buf: &[u8]) -> Option<bool> {
    let n = buf.len().min(BOM.len());
    if buf[..n] != BOM[..n] {
        return Some(false);
    }
    if n < BOM.len() { None } else { Some(true) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_eol_variants() {
        assert_eq!(find_eol(b"abc\ndef"), Some((3, 4)));
        assert_eq!(find_eol(b"abc\r\ndef"), Some((3, 5)));
        assert_eq!(find_eol(b"abc\rdef"), Some((3, 4)));
        assert_eq!(find_eol(b"abc\r"), None);
        assert_eq!(find_eol(b"abc"), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(b""), Line::Empty);
        assert_eq!(classify(b": keep-alive"), Line::Comment);
        assert_eq!(
            classify(b"data: hello"),
            Line::Field {
                name: FieldName::Data,
                value: b"hello"
            }
        );
        assert_eq!(
            classify(b"data:  two spaces"),
            Line::Field {
                name: FieldName::Data,
                value: b" two spaces"
            }
        );
        assert_eq!(
            classify(b"data"),
            Line::Field {
                name: FieldName::Data,
                value: b""
            }
        );
        assert!(matches!(
            classify(b"x-custom: 1"),
            Line::Field {
                name: FieldName::Ignored,
                ..
            }
        ));
    }

    #[test]
    fn test_next_line_consumes_terminator() {
        let mut buf = BytesMut::from(&b"id: 1\r\ndata: x\n"[..]);
        assert_eq!(&next_line(&mut buf).unwrap()[..], b"id: 1");
        assert_eq!(&next_line(&mut buf).unwrap()[..], b"data: x");
        assert!(next_line(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bom_detection() {
        assert_eq!(starts_with_bom(&[]), None);
        assert_eq!(starts_with_bom(&[0xEF]), None);
        assert_eq!(starts_with_bom(&[0xEF, 0xBB, 0xBF, b'd']), Some(true));
        assert_eq!(starts_with_bom(b"data"), Some(false));
    }
}
