// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Word-oriented line codec spoken with the server helper.
//!
//! A line is a sequence of words separated by single spaces and terminated by
//! `\n`. Binary words are written as `\x` followed by lowercase hex. Plain
//! words escape backslash and every non-printable byte as `\ooo` octal.

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::errors::GssError;

#[derive(Debug, Default)]
pub struct QwordWriter {
    buf: String,
}

impl QwordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hex(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.push_str("\\x");
        self.buf.push_str(&hex::encode(bytes));
        self.buf.push(' ');
        self
    }

    pub fn add_string(&mut self, word: &str) -> &mut Self {
        for byte in word.bytes() {
            match byte {
                b'\\' => self.buf.push_str("\\134"),
                b if b.is_ascii_graphic() => self.buf.push(b as char),
                _ => self.buf.push_str(&format!("\\{:03o}", byte)),
            }
        }
        self.buf.push(' ');
        self
    }

    pub fn add_int(&mut self, value: i64) -> &mut Self {
        self.buf.push_str(&value.to_string());
        self.buf.push(' ');
        self
    }

    /// Terminates the line.
    pub fn finish(mut self) -> String {
        if self.buf.ends_with(' ') {
            self.buf.pop();
        }
        self.buf.push('\n');
        self.buf
    }
}

#[derive(Debug)]
pub struct QwordReader<'a> {
    rest: &'a [u8],
}

impl<'a> QwordReader<'a> {
    pub fn new(line: &'a str) -> Self {
        Self {
            rest: line.as_bytes(),
        }
    }

    /// Next word, or `None` at the end of the line.
    pub fn next_word(&mut self) -> Result<Option<Vec<u8>>, GssError> {
        while let Some((b' ', tail)) = self.rest.split_first() {
            self.rest = tail;
        }
        if self.rest.is_empty() || self.rest[0] == b'\n' {
            return Ok(None);
        }

        let end = self
            .rest
            .iter()
            .position(|b| *b == b' ' || *b == b'\n')
            .unwrap_or(self.rest.len());
        let (word, tail) = self.rest.split_at(end);
        self.rest = tail;

        if let Some(hex_digits) = word.strip_prefix(b"\\x") {
            return hex::decode(hex_digits)
                .map(Some)
                .map_err(|e| GssError::protocol(format!("bad hex word: {}", e)));
        }

        let mut out = Vec::with_capacity(word.len());
        let mut i = 0;
        while i < word.len() {
            if word[i] == b'\\' && is_octal_escape(&word[i + 1..]) {
                let value = (word[i + 1] - b'0') as u16 * 64
                    + (word[i + 2] - b'0') as u16 * 8
                    + (word[i + 3] - b'0') as u16;
                let byte = u8::try_from(value)
                    .map_err(|_| GssError::protocol("octal escape out of range"))?;
                out.push(byte);
                i += 4;
            } else {
                out.push(word[i]);
                i += 1;
            }
        }
        Ok(Some(out))
    }

    pub fn word(&mut self, field: &str) -> Result<Vec<u8>, GssError> {
        self.next_word()?
            .ok_or_else(|| GssError::protocol(format!("missing {}", field)))
    }

    pub fn string(&mut self, field: &str) -> Result<String, GssError> {
        String::from_utf8(self.word(field)?)
            .map_err(|_| GssError::protocol(format!("{} is not valid utf-8", field)))
    }

    /// Decimal integer, or `None` at the end of the line.
    pub fn int(&mut self, field: &str) -> Result<Option<i64>, GssError> {
        let Some(word) = self.next_word()? else {
            return Ok(None);
        };
        std::str::from_utf8(&word)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .map(Some)
            .ok_or_else(|| GssError::protocol(format!("{} is not an integer", field)))
    }

    pub fn expect_int(&mut self, field: &str) -> Result<i64, GssError> {
        self.int(field)?
            .ok_or_else(|| GssError::protocol(format!("missing {}", field)))
    }

    /// Absolute expiry in seconds since the epoch. Zero is not a valid expiry.
    pub fn expiry(&mut self) -> Result<DateTime<Utc>, GssError> {
        let secs = self.expect_int("expiry")?;
        if secs <= 0 {
            return Err(GssError::protocol("expiry must be positive"));
        }
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| GssError::protocol("expiry out of range"))
    }
}

fn is_octal_escape(rest: &[u8]) -> bool {
    rest.len() >= 3 && rest[..3].iter().all(|b| (b'0'..=b'7').contains(b))
}

pub fn u32_from_le(bytes: &[u8]) -> Result<u32, GssError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| GssError::protocol("expected 4-byte word"))?;
    Ok(u32::from_le_bytes(arr))
}

pub fn u64_from_le(bytes: &[u8]) -> Result<u64, GssError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| GssError::protocol("expected 8-byte word"))?;
    Ok(u64::from_le_bytes(arr))
}
