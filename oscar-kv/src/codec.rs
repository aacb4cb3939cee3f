//! Lexicographically-order-preserving tuple encoding (spec §4.2).
//!
//! Byte-lex order on the encoded form equals element-wise lex order on the
//! decoded tuple, under the fixed type ordering `reverse(x) < numbers <
//! strings < bytes < +∞`. Prefixes of a tuple encode as byte-prefixes of any
//! extension, because every element encoding is self-delimiting (either a
//! fixed length derived from its tag, or a null-escaped terminator).

use std::cmp::Ordering;

/// One element of an ordered tuple key.
#[derive(Debug, Clone, PartialEq)]
pub enum Elem {
    Str(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Bytes(Vec<u8>),
    PosInfinity,
    Reverse(Box<Elem>),
}

impl Elem {
    pub fn str(s: impl Into<String>) -> Elem {
        Elem::Str(s.into())
    }
    pub fn bytes(b: impl Into<Vec<u8>>) -> Elem {
        Elem::Bytes(b.into())
    }
    pub fn reverse(e: Elem) -> Elem {
        Elem::Reverse(Box::new(e))
    }
}

// Tag bytes, in ascending order so that tag-byte comparison alone
// reproduces the required type ordering.
const TAG_REVERSE: u8 = 0x01;
const TAG_NEG_INT_MAX: u8 = 0x13; // TAG_INT_ZERO - 1 (n=1 negative byte)
const TAG_INT_ZERO: u8 = 0x14;
const TAG_FLOAT: u8 = 0x20;
const TAG_STRING: u8 = 0x28;
const TAG_BYTES: u8 = 0x30;
const TAG_POS_INFINITY: u8 = 0xff;

const NUL: u8 = 0x00;
const ESCAPE: u8 = 0xff;

fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if b == NUL {
            out.push(NUL);
            out.push(ESCAPE);
        } else {
            out.push(b);
        }
    }
    out.push(NUL);
    out.push(NUL);
}

/// Reads one null-escaped segment starting at `buf[0]`, returning the
/// unescaped payload and the number of consumed bytes (including the
/// terminator). `term`/`escape_marker` select which two bytes mean
/// "terminator" vs "escaped literal NUL", so the same scanner works both
/// in plain space (`0x00,0x00` / `0x00,0xff`) and in bit-complemented
/// `reverse(..)` space (`0xff,0xff` / `0xff,0x00`).
fn read_escaped(buf: &[u8], marker: u8) -> Result<(Vec<u8>, usize), CodecError> {
    let other = !marker;
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let b = *buf.get(i).ok_or(CodecError::Truncated)?;
        if b == marker {
            let next = *buf.get(i + 1).ok_or(CodecError::Truncated)?;
            if next == marker {
                return Ok((out, i + 2));
            } else if next == other {
                out.push(marker);
                i += 2;
            } else {
                return Err(CodecError::BadEscape);
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
}

fn int_magnitude_bytes(mag: u64) -> Vec<u8> {
    if mag == 0 {
        return Vec::new();
    }
    let full = mag.to_be_bytes();
    let first_nonzero = full.iter().position(|&b| b != 0).unwrap();
    full[first_nonzero..].to_vec()
}

fn encode_one(elem: &Elem, out: &mut Vec<u8>) {
    match elem {
        Elem::PosInfinity => out.push(TAG_POS_INFINITY),
        Elem::Str(s) => {
            out.push(TAG_STRING);
            push_escaped(out, s.as_bytes());
        }
        Elem::Bytes(b) => {
            out.push(TAG_BYTES);
            push_escaped(out, b);
        }
        Elem::F64(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f64_to_ordered_u64(*f).to_be_bytes());
        }
        Elem::U64(v) => encode_int(*v as i128, out),
        Elem::I64(v) => encode_int(*v as i128, out),
        Elem::Reverse(inner) => {
            let mut tmp = Vec::new();
            encode_one(inner, &mut tmp);
            out.push(TAG_REVERSE);
            out.extend(tmp.into_iter().map(|b| !b));
        }
    }
}

fn encode_int(v: i128, out: &mut Vec<u8>) {
    if v == 0 {
        out.push(TAG_INT_ZERO);
        return;
    }
    if v > 0 {
        let mag = int_magnitude_bytes(v as u64);
        out.push(TAG_INT_ZERO + mag.len() as u8);
        out.extend_from_slice(&mag);
    } else {
        let mag = int_magnitude_bytes((-v) as u64);
        out.push(TAG_INT_ZERO - mag.len() as u8);
        out.extend(mag.into_iter().map(|b| !b));
    }
}

fn f64_to_ordered_u64(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn ordered_u64_to_f64(u: u64) -> f64 {
    if u & (1 << 63) != 0 {
        f64::from_bits(!u)
    } else {
        f64::from_bits(u & !(1 << 63))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated ordered-key encoding")]
    Truncated,
    #[error("bad escape sequence in ordered-key encoding")]
    BadEscape,
    #[error("unknown tag byte {0:#04x}")]
    UnknownTag(u8),
}

/// Decode exactly one element from the front of `buf`, returning the
/// element and the number of bytes consumed.
fn decode_one(buf: &[u8]) -> Result<(Elem, usize), CodecError> {
    let tag = *buf.first().ok_or(CodecError::Truncated)?;
    let rest = &buf[1..];
    match tag {
        TAG_POS_INFINITY => Ok((Elem::PosInfinity, 1)),
        TAG_INT_ZERO => Ok((Elem::I64(0), 1)),
        TAG_STRING => {
            let (raw, n) = read_escaped(rest, NUL)?;
            let s = String::from_utf8(raw).map_err(|_| CodecError::BadEscape)?;
            Ok((Elem::Str(s), 1 + n))
        }
        TAG_BYTES => {
            let (raw, n) = read_escaped(rest, NUL)?;
            Ok((Elem::Bytes(raw), 1 + n))
        }
        TAG_FLOAT => {
            let arr: [u8; 8] = rest.get(..8).ok_or(CodecError::Truncated)?.try_into().unwrap();
            let bits = u64::from_be_bytes(arr);
            Ok((Elem::F64(ordered_u64_to_f64(bits)), 9))
        }
        TAG_REVERSE => {
            // Peek the un-complemented tag to learn the inner element's
            // self-delimited length without decoding it yet.
            let inner_tag = !*rest.first().ok_or(CodecError::Truncated)?;
            let total = match inner_tag {
                TAG_POS_INFINITY | TAG_INT_ZERO => 1,
                TAG_FLOAT => 9,
                t if (TAG_NEG_INT_MAX - 7..=TAG_NEG_INT_MAX).contains(&t) => {
                    1 + (TAG_INT_ZERO - t) as usize
                }
                t if t > TAG_INT_ZERO && t <= TAG_INT_ZERO + 8 => 1 + (t - TAG_INT_ZERO) as usize,
                TAG_STRING | TAG_BYTES => {
                    // Terminator in complemented space is 0xff,0xff;
                    // escaped literal is 0xff,0x00.
                    let (_, n) = read_escaped(&rest[1..], ESCAPE)?;
                    1 + n
                }
                other => return Err(CodecError::UnknownTag(other)),
            };
            let complemented = rest.get(..total).ok_or(CodecError::Truncated)?;
            let plain: Vec<u8> = complemented.iter().map(|b| !b).collect();
            let (inner, consumed) = decode_one(&plain)?;
            debug_assert_eq!(consumed, total);
            Ok((Elem::Reverse(Box::new(inner)), 1 + total))
        }
        t if t < TAG_INT_ZERO => {
            let n = (TAG_INT_ZERO - t) as usize;
            let raw = rest.get(..n).ok_or(CodecError::Truncated)?;
            let complemented: Vec<u8> = raw.iter().map(|b| !b).collect();
            let mut mag: u64 = 0;
            for b in &complemented {
                mag = (mag << 8) | (*b as u64);
            }
            Ok((Elem::I64(-(mag as i128) as i64), 1 + n))
        }
        t if t > TAG_INT_ZERO && t <= TAG_INT_ZERO + 8 => {
            let n = (t - TAG_INT_ZERO) as usize;
            let raw = rest.get(..n).ok_or(CodecError::Truncated)?;
            let mut mag: u64 = 0;
            for &b in raw {
                mag = (mag << 8) | (b as u64);
            }
            Ok((Elem::I64(mag as i64), 1 + n))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Encode a full tuple.
pub fn encode(tuple: &[Elem]) -> Vec<u8> {
    let mut out = Vec::new();
    for elem in tuple {
        encode_one(elem, &mut out);
    }
    out
}

/// Decode a full tuple, requiring every byte of `buf` to be consumed.
pub fn decode(buf: &[u8]) -> Result<Vec<Elem>, CodecError> {
    let mut out = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (elem, n) = decode_one(rest)?;
        out.push(elem);
        rest = &rest[n..];
    }
    Ok(out)
}

/// Decode a single leading element, returning it plus the unconsumed
/// remainder of `buf` (spec §4.2: "decoding a leading prefix and returning
/// the rest").
pub fn decode_prefix(buf: &[u8]) -> Result<(Elem, &[u8]), CodecError> {
    let (elem, n) = decode_one(buf)?;
    Ok((elem, &buf[n..]))
}

/// Element-wise lexicographic comparison of two tuples, used by property
/// tests to check that byte order agrees with this order.
pub fn tuple_cmp(a: &[Elem], b: &[Elem]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = elem_cmp(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn type_rank(e: &Elem) -> u8 {
    match e {
        Elem::Reverse(_) => 0,
        Elem::I64(_) | Elem::U64(_) | Elem::F64(_) => 1,
        Elem::Str(_) => 2,
        Elem::Bytes(_) => 3,
        Elem::PosInfinity => 4,
    }
}

fn num_value(e: &Elem) -> f64 {
    match e {
        Elem::I64(v) => *v as f64,
        Elem::U64(v) => *v as f64,
        Elem::F64(v) => *v,
        _ => unreachable!(),
    }
}

fn elem_cmp(a: &Elem, b: &Elem) -> Ordering {
    match (a, b) {
        (Elem::Reverse(x), Elem::Reverse(y)) => elem_cmp(y, x),
        _ => {
            let ra = type_rank(a);
            let rb = type_rank(b);
            if ra != rb {
                return ra.cmp(&rb);
            }
            match (a, b) {
                (Elem::Str(x), Elem::Str(y)) => x.cmp(y),
                (Elem::Bytes(x), Elem::Bytes(y)) => x.cmp(y),
                (Elem::PosInfinity, Elem::PosInfinity) => Ordering::Equal,
                _ => num_value(a).partial_cmp(&num_value(b)).unwrap(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(tuple: Vec<Elem>) {
        let enc = encode(&tuple);
        let dec = decode(&enc).expect("decode");
        assert_eq!(dec, tuple);
    }

    #[test]
    fn roundtrip_basic_types() {
        roundtrip(vec![Elem::str("hello"), Elem::I64(-5), Elem::U64(42)]);
        roundtrip(vec![Elem::bytes(vec![1, 0, 2, 0, 0, 255])]);
        roundtrip(vec![Elem::F64(-3.5), Elem::F64(0.0), Elem::F64(f64::MAX)]);
        roundtrip(vec![Elem::PosInfinity]);
        roundtrip(vec![Elem::reverse(Elem::I64(7))]);
        roundtrip(vec![Elem::reverse(Elem::str("abc"))]);
        roundtrip(vec![Elem::I64(0), Elem::I64(i64::MIN), Elem::I64(i64::MAX)]);
    }

    fn order_matches(a: Vec<Elem>, b: Vec<Elem>) {
        let ea = encode(&a);
        let eb = encode(&b);
        assert_eq!(tuple_cmp(&a, &b), ea.cmp(&eb), "{a:?} vs {b:?}");
    }

    #[test]
    fn byte_order_matches_tuple_order_for_integers() {
        let vals = [-1000i64, -1, 0, 1, 255, 256, 70000, i64::MAX, i64::MIN, -255, -256];
        for &x in &vals {
            for &y in &vals {
                order_matches(vec![Elem::I64(x)], vec![Elem::I64(y)]);
            }
        }
    }

    #[test]
    fn byte_order_matches_tuple_order_for_floats() {
        let vals = [-3.5f64, -0.0, 0.0, 1.5, f64::MIN, f64::MAX, 1e300, -1e300];
        for &x in &vals {
            for &y in &vals {
                order_matches(vec![Elem::F64(x)], vec![Elem::F64(y)]);
            }
        }
    }

    #[test]
    fn byte_order_matches_tuple_order_for_strings() {
        let vals = ["", "a", "ab", "abc", "b", "\u{0}x"];
        for x in vals {
            for y in vals {
                order_matches(vec![Elem::str(x)], vec![Elem::str(y)]);
            }
        }
    }

    #[test]
    fn reverse_inverts_order() {
        order_matches(
            vec![Elem::reverse(Elem::I64(1))],
            vec![Elem::reverse(Elem::I64(2))],
        );
        order_matches(
            vec![Elem::reverse(Elem::str("a"))],
            vec![Elem::reverse(Elem::str("b"))],
        );
    }

    #[test]
    fn type_ordering_across_kinds() {
        order_matches(vec![Elem::reverse(Elem::I64(1_000_000))], vec![Elem::I64(-1_000_000)]);
        order_matches(vec![Elem::I64(999)], vec![Elem::str("")]);
        order_matches(vec![Elem::str("zzzz")], vec![Elem::bytes(vec![0])]);
        order_matches(vec![Elem::bytes(vec![255, 255])], vec![Elem::PosInfinity]);
    }

    #[test]
    fn prefix_of_tuple_is_prefix_of_encoding() {
        let full = vec![Elem::str("repo"), Elem::I64(18), Elem::str("x")];
        let prefix = vec![Elem::str("repo"), Elem::I64(18)];
        let enc_full = encode(&full);
        let enc_prefix = encode(&prefix);
        assert!(enc_full.starts_with(&enc_prefix));
    }

    #[test]
    fn decode_prefix_returns_rest() {
        let full = encode(&[Elem::str("a"), Elem::I64(7)]);
        let (first, rest) = decode_prefix(&full).unwrap();
        assert_eq!(first, Elem::str("a"));
        let (second, rest) = decode_prefix(rest).unwrap();
        assert_eq!(second, Elem::I64(7));
        assert!(rest.is_empty());
    }
}
