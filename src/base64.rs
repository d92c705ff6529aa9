//! Base64 encoding and decoding as specified in RFC 2045.
//!
//! The decoder is permissive: it assumes well formed input and maps any byte
//! outside of the alphabet to zero instead of failing.

const ENCODE_MAP: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

lazy_static! {
    static ref DECODE_MAP: [u8; 256] = {
        let mut map = [0u8; 256];
        for (value, &symbol) in ENCODE_MAP.iter().enumerate() {
            map[symbol as usize] = value as u8;
        }
        map
    };
}

/// Encode `data`, padding the final group with '=' so that the output is
/// always `ceil(n / 3) * 4` bytes long.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);

        out.push(ENCODE_MAP[(b0 >> 2) as usize]);
        out.push(ENCODE_MAP[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize]);
        match chunk.len() {
            1 => out.extend_from_slice(b"=="),
            2 => {
                out.push(ENCODE_MAP[((b1 & 0x0f) << 2) as usize]);
                out.push(b'=');
            }
            _ => {
                out.push(ENCODE_MAP[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize]);
                out.push(ENCODE_MAP[(b2 & 0x3f) as usize]);
            }
        }
    }
    out
}

/// Encode `data` into a `String`. Base64 output is always ASCII.
pub fn encode_to_string(data: &[u8]) -> String {
    encode(data).into_iter().map(char::from).collect()
}

/// Decode `data`. Trailing whitespace and '=' padding are stripped, embedded
/// CR, LF, TAB and SPACE are skipped, and a trailing partial group of two or
/// three symbols yields one or two bytes respectively.
pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut end = data.len();
    while end > 0 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    while end > 0 && data[end - 1] == b'=' {
        end -= 1;
    }

    let symbols: Vec<u8> = data[..end]
        .iter()
        .filter(|&&c| !matches!(c, b'\n' | b'\r' | b'\t' | b' '))
        .map(|&c| DECODE_MAP[c as usize])
        .collect();

    let mut out = Vec::with_capacity(symbols.len() * 3 / 4);
    for group in symbols.chunks(4) {
        let s0 = group[0];
        let s1 = group.get(1).copied().unwrap_or(0);
        let s2 = group.get(2).copied().unwrap_or(0);
        let s3 = group.get(3).copied().unwrap_or(0);

        if group.len() >= 2 {
            out.push((s0 << 2) | (s1 >> 4));
        }
        if group.len() >= 3 {
            out.push((s1 << 4) | (s2 >> 2));
        }
        if group.len() == 4 {
            out.push((s2 << 6) | s3);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rfc4648_vectors() {
        let vectors: &[(&[u8], &[u8])] = &[
            (b"", b""),
            (b"f", b"Zg=="),
            (b"fo", b"Zm8="),
            (b"foo", b"Zm9v"),
            (b"foob", b"Zm9vYg=="),
            (b"fooba", b"Zm9vYmE="),
            (b"foobar", b"Zm9vYmFy"),
        ];
        for (plain, encoded) in vectors {
            assert_eq!(&encode(plain)[..], *encoded);
            assert_eq!(&decode(encoded)[..], *plain);
        }
    }

    #[test]
    fn output_length_and_padding_follow_remainder() {
        for n in 0..64usize {
            let data: Vec<u8> = (0..n).map(|i| (i * 37 % 256) as u8).collect();
            let encoded = encode(&data);
            assert_eq!(encoded.len(), (n + 2) / 3 * 4);
            let padding = encoded.iter().rev().take_while(|&&c| c == b'=').count();
            let expected = match n % 3 {
                0 => 0,
                1 => 2,
                _ => 1,
            };
            assert_eq!(padding, expected, "length {}", n);
        }
    }

    #[test]
    fn round_trips_every_byte_value() {
        let data: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        for len in 0..data.len() {
            assert_eq!(decode(&encode(&data[..len])), &data[..len]);
        }
    }

    #[test]
    fn decode_skips_embedded_whitespace() {
        assert_eq!(decode(b"Zm9v\r\nYmFy\n"), b"foobar");
        assert_eq!(decode(b"Zm 9v\tYg==  \r\n"), b"foob");
    }

    #[test]
    fn decode_length_is_three_quarters_of_symbols() {
        assert_eq!(decode(b"QUJD").len(), 3);
        assert_eq!(decode(b"QUI").len(), 2);
        assert_eq!(decode(b"QQ").len(), 1);
        assert_eq!(decode(b"Q").len(), 0);
    }

    #[test]
    fn decode_tolerates_garbage() {
        assert_eq!(decode(b"").len(), 0);
        assert_eq!(decode(b"====").len(), 0);
        assert_eq!(decode(b"  \r\n").len(), 0);
        assert_eq!(decode(b"!!!!").len(), 3);
        assert_eq!(decode(&[0xff, 0xfe, 0x80, 0x81]), vec![0, 0, 0]);
    }

    #[test]
    fn encode_to_string_matches_encode() {
        assert_eq!(encode_to_string(b"\0user\0secret"), "AHVzZXIAc2VjcmV0");
    }
}
