//! The token compression codec
//!
//! Converts key-sorted token sequences to compact byte streams and back.
//! Runs of consecutive keys with equal value sizes compress under one of
//! two repeat prefixes: a binary repeat carries one common non-zero value
//! and an LSB-first bitmap selecting which keys take it, and an analog
//! repeat carries one value payload per key. Tokens outside a run are
//! emitted as key plus value bytes, and zero-size keys as the bare key.

use snafu::Snafu;

use crate::token::{KeyPrefix, Token, TokenFlags, TokenKey};

/// The maximum run length of the repeat prefixes
pub const MAX_TOKEN_REPEATS: usize = 32;

/// Decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum CodecError {
    /// The stream ended inside a token
    #[snafu(display("byte stream ended inside a token"))]
    Underrun,
}

fn sink_key(key: TokenKey, sink: &mut impl FnMut(u8)) {
    sink((key.raw() >> 8) as u8);
    sink(key.raw() as u8);
}

fn sink_value(value: i32, value_size: usize, sink: &mut impl FnMut(u8)) {
    for shift in (0..value_size).rev() {
        sink((value >> (8 * shift)) as u8);
    }
}

fn sink_token(token: &Token, sink: &mut impl FnMut(u8)) {
    sink_key(token.key, sink);
    sink_value(token.value, token.key.value_size(), sink);
}

/// Index of the next broadcast-flagged token at or past `from + 1`, or
/// `tokens.len()` if there is none.
fn next_broadcast(tokens: &[Token], from: usize) -> usize {
    let mut i = from + 1;
    while i < tokens.len() && !tokens[i].flags.contains(TokenFlags::SHOULD_BROADCAST) {
        i += 1;
    }
    i
}

/// Compress a key-sorted token sequence into a byte stream.
///
/// Only tokens flagged [`TokenFlags::SHOULD_BROADCAST`] are emitted; the
/// rest are skipped, including inside run detection.
pub fn compress(tokens: &[Token], mut sink: impl FnMut(u8)) {
    let mut i = 0;
    while i < tokens.len() {
        if !tokens[i].flags.contains(TokenFlags::SHOULD_BROADCAST) {
            i += 1;
            continue;
        }

        // tokens without a value are sent as the bare key
        let value_size = tokens[i].key.value_size();
        if value_size == 0 {
            sink_token(&tokens[i], &mut sink);
            i += 1;
            continue;
        }

        // check for a compressible series starting with the current token
        let mut num_analog = 0usize;
        let mut num_binary = 0usize;
        let mut common = tokens[i].value;
        let mut expected_key = tokens[i].key.raw().wrapping_add(1);
        let mut scan = i;
        while num_analog < MAX_TOKEN_REPEATS - 1 {
            scan = next_broadcast(tokens, scan);
            if scan >= tokens.len()
                || tokens[scan].key.raw() != expected_key
                || tokens[scan].key.value_size() != value_size
            {
                break;
            }

            // first non-zero value becomes the binary-repeat common value
            if common == 0 && tokens[scan].value != 0 {
                common = tokens[scan].value;
            }
            if tokens[scan].value == 0 || tokens[scan].value == common {
                num_binary += 1;
            } else {
                num_binary = MAX_TOKEN_REPEATS;
            }

            expected_key = expected_key.wrapping_add(1);
            num_analog += 1;
        }

        if num_binary >= 1 && num_binary < MAX_TOKEN_REPEATS {
            // binary repeat: prefix, base key, common value, bitmap
            sink(KeyPrefix::BinaryRepeat as u8 | num_binary as u8);
            sink_key(tokens[i].key, &mut sink);
            sink_value(common, value_size, &mut sink);

            let mut bit = 0u32;
            let mut byte = 0u8;
            let mut remaining = num_binary + 1;
            while remaining > 0 {
                if tokens[i].value != 0 {
                    byte |= 1 << bit;
                }
                bit += 1;
                if bit >= 8 {
                    sink(byte);
                    bit = 0;
                    byte = 0;
                }
                i = next_broadcast(tokens, i);
                remaining -= 1;
            }
            if bit != 0 {
                sink(byte);
            }
        } else if num_analog >= 1 {
            // analog repeat: prefix, base token, then value payloads only
            sink(KeyPrefix::AnalogRepeat as u8 | num_analog as u8);
            sink_token(&tokens[i], &mut sink);
            i = next_broadcast(tokens, i);
            for _ in 0..num_analog {
                sink_value(tokens[i].value, value_size, &mut sink);
                i = next_broadcast(tokens, i);
            }
        } else {
            sink_token(&tokens[i], &mut sink);
            i += 1;
        }
    }
}

/// Decompress a byte stream into tokens delivered to `sink` with
/// `address` as the sender.
///
/// Decoding stops cleanly at the first byte whose prefix lies beyond the
/// repeat prefixes; the pattern table interleaves token payloads with its
/// own entries this way. Returns the number of bytes consumed. A token
/// that would read past the end of the stream fails with
/// [`CodecError::Underrun`]; tokens already delivered stand.
pub fn decompress(
    bytes: &[u8],
    address: u8,
    mut sink: impl FnMut(&Token),
) -> Result<usize, CodecError> {
    let mut pos = 0usize;

    let next = |pos: &mut usize| -> Result<u8, CodecError> {
        let byte = *bytes.get(*pos).ok_or(CodecError::Underrun)?;
        *pos += 1;
        Ok(byte)
    };

    while pos < bytes.len() {
        let prefix = bytes[pos] & KeyPrefix::MASK;
        if prefix > KeyPrefix::AnalogRepeat as u8 {
            return Ok(pos);
        }

        let mut num_repeats = 1usize;
        if prefix == KeyPrefix::BinaryRepeat as u8 || prefix == KeyPrefix::AnalogRepeat as u8 {
            num_repeats = (bytes[pos] as usize & (MAX_TOKEN_REPEATS - 1)) + 1;
            pos += 1;
        }

        let key_hi = next(&mut pos)?;
        let key_lo = next(&mut pos)?;
        let mut key = TokenKey::new(((key_hi as u16) << 8) | key_lo as u16);
        let value_size = key.value_size();

        if prefix == KeyPrefix::AnalogRepeat as u8 {
            for _ in 0..num_repeats {
                let mut value = 0i32;
                for _ in 0..value_size {
                    value = (value << 8) | next(&mut pos)? as i32;
                }
                sink(&Token::new(address, key, value));
                key = TokenKey::new(key.raw().wrapping_add(1));
            }
        } else if prefix == KeyPrefix::BinaryRepeat as u8 {
            let mut common = 0i32;
            for _ in 0..value_size {
                common = (common << 8) | next(&mut pos)? as i32;
            }

            // bitmap bits are consumed LSB first
            let mut bit_index = 8u32;
            let mut bits = 0u8;
            for _ in 0..num_repeats {
                bits >>= 1;
                bit_index += 1;
                if bit_index >= 8 {
                    bits = next(&mut pos)?;
                    bit_index = 0;
                }
                let value = if bits & 1 != 0 { common } else { 0 };
                sink(&Token::new(address, key, value));
                key = TokenKey::new(key.raw().wrapping_add(1));
            }
        } else {
            let mut value = 0i32;
            for _ in 0..value_size {
                value = (value << 8) | next(&mut pos)? as i32;
            }
            sink(&Token::new(address, key, value));
        }
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::keys;

    fn broadcast(key: u16, value: i32) -> Token {
        let mut token = Token::new(0, TokenKey::new(key), value);
        token.flags = TokenFlags::SHOULD_BROADCAST;
        token
    }

    fn compress_to_vec(tokens: &[Token]) -> Vec<u8> {
        let mut bytes = Vec::new();
        compress(tokens, |b| bytes.push(b));
        bytes
    }

    fn decompress_to_vec(bytes: &[u8], address: u8) -> Vec<Token> {
        let mut tokens = Vec::new();
        let consumed = decompress(bytes, address, |t| tokens.push(*t)).unwrap();
        assert_eq!(bytes.len(), consumed);
        tokens
    }

    #[test]
    fn binary_run_encoding() {
        // run of five one-byte keys: two values, zero or 50
        let tokens = [
            broadcast(1000, 0),
            broadcast(1001, 0),
            broadcast(1002, 50),
            broadcast(1003, 0),
            broadcast(1004, 50),
        ];
        let bytes = compress_to_vec(&tokens);
        assert_eq!(vec![0x64, 0x03, 0xE8, 0x32, 0b0001_0100], bytes);

        let decoded = decompress_to_vec(&bytes, 9);
        assert_eq!(5, decoded.len());
        for (i, token) in decoded.iter().enumerate() {
            assert_eq!(1000 + i as u16, token.key.raw());
            assert_eq!(tokens[i].value, token.value);
            assert_eq!(9, token.address);
        }
    }

    #[test]
    fn binary_run_beats_uncompressed() {
        // N consecutive equal non-zero one-byte values compress to
        // 1 + 2 + 1 + ceil(N/8) bytes against 3N uncompressed
        for n in [2usize, 8, 9, 31] {
            let tokens: Vec<Token> = (0..n).map(|i| broadcast(1000 + i as u16, 7)).collect();
            let bytes = compress_to_vec(&tokens);
            assert_eq!(1 + 2 + 1 + n.div_ceil(8), bytes.len(), "run of {n}");
            assert!(bytes.len() < 3 * n);
            assert_eq!(tokens, decompress_to_vec(&bytes, 0));
        }
    }

    #[test]
    fn analog_run_encoding() {
        let tokens = [
            broadcast(1000, 10),
            broadcast(1001, 20),
            broadcast(1002, 30),
        ];
        let bytes = compress_to_vec(&tokens);
        // prefix | followers, base token, then bare values
        assert_eq!(vec![0x82, 0x03, 0xE8, 10, 20, 30], bytes);
        assert_eq!(tokens.to_vec(), decompress_to_vec(&bytes, 0));
    }

    #[test]
    fn non_broadcast_tokens_are_skipped() {
        let mut quiet = Token::new(0, TokenKey::new(1001), 99);
        quiet.flags = TokenFlags::NONE;
        let tokens = [broadcast(1000, 5), quiet, broadcast(1002, 5)];
        let bytes = compress_to_vec(&tokens);
        let decoded = decompress_to_vec(&bytes, 0);
        // 1000 and 1002 are not consecutive once 1001 is skipped
        assert_eq!(2, decoded.len());
        assert_eq!(1000, decoded[0].key.raw());
        assert_eq!(1002, decoded[1].key.raw());
    }

    #[test]
    fn zero_size_keys_emit_bare() {
        let tokens = [broadcast(8000, 0)];
        let bytes = compress_to_vec(&tokens);
        assert_eq!(vec![0x1F, 0x40], bytes);
        let decoded = decompress_to_vec(&bytes, 0);
        assert_eq!(1, decoded.len());
        assert_eq!(8000, decoded[0].key.raw());
        assert_eq!(0, decoded[0].value);
    }

    #[test]
    fn mixed_value_sizes_round_trip() {
        let tokens = [
            broadcast(150, 0x1234),        // two-byte local
            broadcast(4999, 1),            // one-byte, no run possible
            broadcast(5000, -1 & 0xFFFF),  // two-byte named
            broadcast(7000, 0x0102_0304),  // four-byte named
        ];
        let bytes = compress_to_vec(&tokens);
        assert_eq!(tokens.to_vec(), decompress_to_vec(&bytes, 3));
    }

    #[test]
    fn long_runs_split_at_the_repeat_limit() {
        let tokens: Vec<Token> = (0..40).map(|i| broadcast(1000 + i as u16, 60)).collect();
        let bytes = compress_to_vec(&tokens);
        assert_eq!(tokens, decompress_to_vec(&bytes, 0));
    }

    #[test]
    fn decode_stops_at_foreign_prefix() {
        let mut bytes = compress_to_vec(&[broadcast(1000, 3)]);
        let token_len = bytes.len();
        bytes.push(0xB0); // pattern-table entry prefix
        bytes.push(0x55);
        let mut tokens = Vec::new();
        let consumed = decompress(&bytes, 0, |t| tokens.push(*t)).unwrap();
        assert_eq!(token_len, consumed);
        assert_eq!(1, tokens.len());
    }

    #[test]
    fn truncated_stream_underruns() {
        let bytes = compress_to_vec(&[broadcast(7000, 0x01020304)]);
        for cut in 1..bytes.len() {
            let mut tokens = Vec::new();
            let result = decompress(&bytes[..cut], 0, |t| tokens.push(*t));
            assert_eq!(Err(CodecError::Underrun), result, "cut at {cut}");
        }
    }

    #[test]
    fn sequencer_key_round_trip() {
        let tokens = [broadcast(keys::INDEXED_SEQUENCER.raw(), 0x64_0005)];
        let bytes = compress_to_vec(&tokens);
        // three-byte value region
        assert_eq!(2 + 3, bytes.len());
        assert_eq!(tokens.to_vec(), decompress_to_vec(&bytes, 0));
    }
}
