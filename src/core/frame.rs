// Record framing inside pipe files: newline-delimited or big-endian length-prefixed.
use std::io::{self, BufRead, Read, Write};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Delimited,
    LengthPrefixed,
}

impl Framing {
    pub fn encoded_len(self, payload_len: usize) -> usize {
        match self {
            Framing::Delimited => payload_len + 1,
            Framing::LengthPrefixed => LENGTH_PREFIX_LEN + payload_len,
        }
    }

    pub fn validate(self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(Error::new(ErrorKind::Usage).with_message("record exceeds max length"));
        }
        if self == Framing::Delimited && payload.contains(&b'\n') {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("delimited records must not contain newlines")
                .with_hint("Use length-prefixed framing for binary or multi-line payloads."));
        }
        Ok(())
    }

    /// Writes one framed record; returns the number of bytes written.
    pub fn write_record(self, out: &mut dyn Write, payload: &[u8]) -> io::Result<usize> {
        match self {
            Framing::Delimited => {
                out.write_all(payload)?;
                out.write_all(b"\n")?;
            }
            Framing::LengthPrefixed => {
                let len = payload.len() as u32;
                out.write_all(&len.to_be_bytes())?;
                out.write_all(payload)?;
            }
        }
        Ok(self.encoded_len(payload.len()))
    }

    /// Reads one record. `Ok(None)` is a clean end of file at a record boundary.
    pub fn read_record(self, input: &mut dyn BufRead) -> Result<Option<(Vec<u8>, usize)>, Error> {
        match self {
            Framing::Delimited => read_delimited(input),
            Framing::LengthPrefixed => read_length_prefixed(input),
        }
    }
}

fn read_delimited(input: &mut dyn BufRead) -> Result<Option<(Vec<u8>, usize)>, Error> {
    let mut buf = Vec::new();
    let read = input
        .read_until(b'\n', &mut buf)
        .map_err(|err| Error::new(ErrorKind::Io).with_message("read failed").with_source(err))?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(Error::new(ErrorKind::Corrupt).with_message("truncated delimited record"));
    }
    buf.pop();
    Ok(Some((buf, read)))
}

fn read_length_prefixed(input: &mut dyn BufRead) -> Result<Option<(Vec<u8>, usize)>, Error> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    if !read_exact_or_eof(input, &mut prefix)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_RECORD_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record length exceeds max"));
    }
    let mut payload = vec![0u8; len];
    if len > 0 && !read_exact_or_eof(input, &mut payload)? {
        return Err(Error::new(ErrorKind::Corrupt).with_message("truncated length-prefixed record"));
    }
    Ok(Some((payload, LENGTH_PREFIX_LEN + len)))
}

// Ok(false) only when nothing at all was read.
fn read_exact_or_eof(reader: &mut dyn BufRead, buf: &mut [u8]) -> Result<bool, Error> {
    let mut offset = 0;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => {
                if offset == 0 {
                    return Ok(false);
                }
                return Err(Error::new(ErrorKind::Corrupt).with_message("unexpected eof in record"));
            }
            Ok(read) => offset += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("read failed")
                    .with_source(err));
            }
        }
    }
    Ok(true)
}
