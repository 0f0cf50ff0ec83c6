// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Single choke point for the binary codec. Everything that hits the wire or
//! a persisted stream goes through the configs defined here.

use std::io::{Read, Write};

/// Upper bound for objects received over the wire. Persisted streams are not
/// subject to it: whatever `save` wrote, `load` must take back.
pub const CODEC_BYTES_LIMIT: usize = 1_000_000;

/// Stream magic written in front of every persisted structure.
pub const STREAM_MAGIC: [u8; 4] = *b"DUSK";

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_limit::<CODEC_BYTES_LIMIT>()
}

fn stream_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_no_limit()
}

pub fn encode_to_vec<T: bincode::Encode>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(val, config())
}

pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::decode_from_slice(bytes, config()).map(|r| r.0)
}

pub fn encode_into<W: Write, T: bincode::Encode>(
    writer: &mut W,
    val: &T,
) -> Result<(), bincode::error::EncodeError> {
    bincode::encode_into_std_write(val, writer, stream_config()).map(|_| ())
}

pub fn decode_from<R: Read, T: bincode::Decode<()>>(
    reader: &mut R,
) -> Result<T, bincode::error::DecodeError> {
    bincode::decode_from_std_read(reader, stream_config())
}

/// Errors produced by the versioned stream header check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    BadMagic,
    UnknownVersion(u8),
    Truncated,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::BadMagic => write!(f, "stream magic mismatch"),
            StreamError::UnknownVersion(v) => write!(f, "unknown stream version {v}"),
            StreamError::Truncated => write!(f, "stream truncated"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Writes the shared stream header: magic followed by a one byte version.
pub fn write_header<W: Write>(writer: &mut W, version: u8) -> std::io::Result<()> {
    writer.write_all(&STREAM_MAGIC)?;
    writer.write_all(&[version])
}

/// Reads and checks the stream header. The version must match `expected`
/// exactly; partial interpretation of unknown layouts is refused.
pub fn read_header<R: Read>(reader: &mut R, expected: u8) -> Result<(), StreamError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(|_| StreamError::Truncated)?;
    if magic != STREAM_MAGIC {
        return Err(StreamError::BadMagic);
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version).map_err(|_| StreamError::Truncated)?;
    if version[0] != expected {
        return Err(StreamError::UnknownVersion(version[0]));
    }

    Ok(())
}
