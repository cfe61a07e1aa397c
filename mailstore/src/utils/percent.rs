/*
 * mailstore - percent encoding of query URI components
 *
 * Copyright 2023 Manos Pitsidianakis
 *
 * This file is part of meli.
 *
 * meli is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * meli is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with meli. If not, see <http://www.gnu.org/licenses/>.
 */

//! Percent-encoding for the values of index query URIs.
//!
//! Only the bytes that would confuse the URI splitter are encoded: `/`, `:`,
//! `&` and `%` in query values, `?` and `%` in paths. Everything else,
//! including spaces, is kept verbatim so that serialized URIs stay readable
//! and compare equal byte-for-byte.

use crate::error::{Error, ErrorKind, Result};

const ENCODE_SET: &[u8] = b"/:&%";
const PATH_ENCODE_SET: &[u8] = b"?%";
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// must be a hex digit
const fn parse_hex_char(ch: u8) -> u8 {
    if ch.is_ascii_digit() {
        ch - b'0'
    } else if ch.is_ascii_lowercase() {
        ch - b'a' + 0xA
    } else {
        ch - b'A' + 0xA
    }
}

/// Encode a query value.
pub fn encode(s: &str) -> String {
    encode_set(s, ENCODE_SET)
}

/// Encode the path part of a URI, which ends at the first `?`.
pub fn encode_path(s: &str) -> String {
    encode_set(s, PATH_ENCODE_SET)
}

fn encode_set(s: &str, set: &[u8]) -> String {
    let mut ret = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii() && set.contains(&(ch as u8)) {
            let b = ch as u8;
            ret.push('%');
            ret.push(HEX_DIGITS[usize::from(b >> 4)] as char);
            ret.push(HEX_DIGITS[usize::from(b & 0xF)] as char);
        } else {
            ret.push(ch);
        }
    }
    ret
}

/// Decode every `%XX` escape. A `%` that is not followed by two hex digits is
/// an error, as is a result that is not valid UTF-8.
pub fn decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut ret = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match bytes.get(i + 1..i + 3) {
                Some(&[hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    ret.push((parse_hex_char(hi) << 4) | parse_hex_char(lo));
                    i += 3;
                    continue;
                }
                _ => {
                    return Err(Error::new(format!("Invalid percent-encoding in {:?}", s))
                        .set_kind(ErrorKind::ValueError));
                }
            }
        }
        ret.push(bytes[i]);
        i += 1;
    }
    Ok(String::from_utf8(ret)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode_set() {
        assert_eq!(encode("tag:inbox"), "tag%3Ainbox");
        assert_eq!(
            encode("folder:a/b & tag:x%"),
            "folder%3Aa%2Fb %26 tag%3Ax%25"
        );
        assert_eq!(encode("tag:ελληνικά"), "tag%3Aελληνικά");
        assert_eq!(
            encode_path("/home/u/mail?db/100%"),
            "/home/u/mail%3Fdb/100%25"
        );
        assert_eq!(decode(&encode_path("/a?b%c:d")).unwrap(), "/a?b%c:d");
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(decode("tag%3Ainbox").unwrap(), "tag:inbox");
        assert_eq!(decode("tag%3ainbox").unwrap(), "tag:inbox");
        assert_eq!(decode("a%20b").unwrap(), "a b");
        assert_eq!(decode("plain").unwrap(), "plain");
        decode("bad%4").unwrap_err();
        decode("bad%zz").unwrap_err();
    }
}
