// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A pickle protocol 5 writer for the value shapes that take part in block hashing.
//!
//! Inference engines derive prefix-cache block hashes from `pickle.dumps(...)` of a small
//! tuple, so the byte stream must match CPython's pickler exactly, framing included.
//! Only the opcodes CPython emits for `None`, `int`, `bytes`, `str` and `tuple` are covered.
//!
//! Memoization is write-only: every memoizable object is followed by `MEMOIZE`, but an object
//! that appears twice is written twice. CPython only reuses memo entries for the *same*
//! object, and none of the hashed shapes alias.

const PROTO: u8 = 0x80;
const PROTOCOL_VERSION: u8 = 5;
const FRAME: u8 = 0x95;
const STOP: u8 = b'.';
const NONE: u8 = b'N';
const MARK: u8 = b'(';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const SHORT_BINBYTES: u8 = b'C';
const BINBYTES: u8 = b'B';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE: u8 = b'X';
const EMPTY_TUPLE: u8 = b')';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const MEMOIZE: u8 = 0x94;

const FRAME_SIZE_MIN: usize = 4;
const FRAME_SIZE_TARGET: usize = 64 * 1024;

/// A value that can be pickled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickleValue<'a> {
    /// Python `None`.
    None,
    /// Python `int`, limited to the `i64` range.
    Int(i64),
    /// Python `bytes`.
    Bytes(&'a [u8]),
    /// Python `str`.
    Str(&'a str),
    /// A tuple of unsigned ints; the common case of a block of token ids.
    Ints(&'a [u32]),
    /// A tuple of arbitrary values.
    Tuple(Vec<PickleValue<'a>>),
}

/// Serializes `value` exactly as `pickle.dumps(value, protocol=5)` would.
pub fn dumps(value: &PickleValue<'_>) -> Vec<u8> {
    let mut pickler = Pickler::new();
    pickler.save(value);
    pickler.frame.push(STOP);
    pickler.commit_frame(true);
    pickler.out
}

struct Pickler {
    out: Vec<u8>,
    frame: Vec<u8>,
}

impl Pickler {
    fn new() -> Self {
        Pickler {
            out: vec![PROTO, PROTOCOL_VERSION],
            frame: Vec::with_capacity(128),
        }
    }

    fn commit_frame(&mut self, force: bool) {
        if self.frame.len() < FRAME_SIZE_TARGET && !force {
            return;
        }
        if self.frame.len() >= FRAME_SIZE_MIN {
            self.out.push(FRAME);
            self.out
                .extend_from_slice(&(self.frame.len() as u64).to_le_bytes());
        }
        self.out.append(&mut self.frame);
    }

    fn save(&mut self, value: &PickleValue<'_>) {
        self.commit_frame(false);
        match value {
            PickleValue::None => self.frame.push(NONE),
            PickleValue::Int(v) => self.save_int(*v),
            PickleValue::Bytes(data) => {
                if data.len() < 256 {
                    self.write_sized(&[SHORT_BINBYTES, data.len() as u8], data);
                } else {
                    let mut header = vec![BINBYTES];
                    header.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    self.write_sized(&header, data);
                }
                self.frame.push(MEMOIZE);
            }
            PickleValue::Str(s) => {
                let data = s.as_bytes();
                if data.len() < 256 {
                    self.write_sized(&[SHORT_BINUNICODE, data.len() as u8], data);
                } else {
                    let mut header = vec![BINUNICODE];
                    header.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    self.write_sized(&header, data);
                }
                self.frame.push(MEMOIZE);
            }
            PickleValue::Ints(values) => {
                self.save_tuple(values.len(), |p, i| {
                    p.commit_frame(false);
                    p.save_int(values[i] as i64);
                });
            }
            PickleValue::Tuple(items) => {
                self.save_tuple(items.len(), |p, i| p.save(&items[i]));
            }
        }
    }

    fn save_tuple(&mut self, len: usize, mut save_item: impl FnMut(&mut Self, usize)) {
        if len == 0 {
            self.frame.push(EMPTY_TUPLE);
            return;
        }
        if len <= 3 {
            for i in 0..len {
                save_item(self, i);
            }
            self.frame.push([TUPLE1, TUPLE2, TUPLE3][len - 1]);
        } else {
            self.frame.push(MARK);
            for i in 0..len {
                save_item(self, i);
            }
            self.frame.push(TUPLE);
        }
        self.frame.push(MEMOIZE);
    }

    fn save_int(&mut self, v: i64) {
        if (0..=0xff).contains(&v) {
            self.frame.extend_from_slice(&[BININT1, v as u8]);
        } else if (0..=0xffff).contains(&v) {
            self.frame.push(BININT2);
            self.frame.extend_from_slice(&(v as u16).to_le_bytes());
        } else if (-0x8000_0000..=0x7fff_ffff).contains(&v) {
            self.frame.push(BININT);
            self.frame.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            let encoded = encode_long(v);
            if encoded.len() < 256 {
                self.frame.extend_from_slice(&[LONG1, encoded.len() as u8]);
            } else {
                self.frame.push(LONG4);
                self.frame
                    .extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            }
            self.frame.extend_from_slice(&encoded);
        }
    }

    /// Payloads at or above the frame target bypass framing entirely.
    fn write_sized(&mut self, header: &[u8], payload: &[u8]) {
        if payload.len() >= FRAME_SIZE_TARGET {
            if !self.frame.is_empty() {
                self.commit_frame(true);
            }
            self.out.extend_from_slice(header);
            self.out.extend_from_slice(payload);
        } else {
            self.frame.extend_from_slice(header);
            self.frame.extend_from_slice(payload);
        }
    }
}

/// Minimal little-endian two's-complement encoding, as `pickle.encode_long`.
fn encode_long(v: i64) -> Vec<u8> {
    if v == 0 {
        return Vec::new();
    }
    let wide = v as i128;
    let bit_length = 128 - wide.unsigned_abs().leading_zeros() as usize;
    let nbytes = (bit_length >> 3) + 1;
    let mut encoded = wide.to_le_bytes()[..nbytes].to_vec();
    if v < 0 && nbytes > 1 && encoded[nbytes - 1] == 0xff && encoded[nbytes - 2] & 0x80 != 0 {
        encoded.pop();
    }
    encoded
}
