//! Intel HEX decoding.

use super::flatten;

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const START_SEGMENT_ADDRESS: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const START_LINEAR_ADDRESS: u8 = 0x05;

struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

fn parse_hex_byte(s: &str) -> Option<u8> {
    u8::from_str_radix(s, 16).ok()
}

fn parse_line(line: &str, number: usize) -> Result<Record, String> {
    let body = line
        .strip_prefix(':')
        .ok_or_else(|| format!("line {number}: missing ':' start code"))?;
    if body.len() % 2 != 0 || body.len() < 10 || !body.is_ascii() {
        return Err(format!("line {number}: bad record length"));
    }

    let raw = (0..body.len())
        .step_by(2)
        .map(|i| parse_hex_byte(&body[i..i + 2]))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| format!("line {number}: invalid hex digit"))?;

    let count = raw[0] as usize;
    if raw.len() != count + 5 {
        return Err(format!(
            "line {number}: byte count {count} does not match record length"
        ));
    }
    let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(format!("line {number}: checksum mismatch"));
    }

    Ok(Record {
        kind: raw[3],
        offset: u16::from_be_bytes([raw[1], raw[2]]),
        data: raw[4..4 + count].to_vec(),
    })
}

/// Decode Intel HEX text into `(base_address, flat_payload)`.
pub fn decode(bytes: &[u8]) -> Result<(u32, Vec<u8>), String> {
    let text = std::str::from_utf8(bytes).map_err(|_| "not a text file".to_string())?;

    let mut upper: u32 = 0;
    let mut regions: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut saw_eof = false;

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let number = idx + 1;
        if saw_eof {
            return Err(format!("line {number}: data after end-of-file record"));
        }
        let record = parse_line(line, number)?;

        match record.kind {
            DATA => {
                let addr = upper
                    .checked_add(u32::from(record.offset))
                    .ok_or_else(|| format!("line {number}: address overflow"))?;
                // Merge with the previous region when contiguous.
                match regions.last_mut() {
                    Some((start, data)) if u64::from(*start) + data.len() as u64 == u64::from(addr) => {
                        data.extend_from_slice(&record.data);
                    },
                    _ => regions.push((addr, record.data)),
                }
            },
            END_OF_FILE => saw_eof = true,
            EXTENDED_SEGMENT_ADDRESS | EXTENDED_LINEAR_ADDRESS => {
                if record.data.len() != 2 {
                    return Err(format!("line {number}: address record needs 2 data bytes"));
                }
                let value = u32::from(u16::from_be_bytes([record.data[0], record.data[1]]));
                upper = if record.kind == EXTENDED_SEGMENT_ADDRESS {
                    value << 4
                } else {
                    value << 16
                };
            },
            START_SEGMENT_ADDRESS | START_LINEAR_ADDRESS => {},
            other => return Err(format!("line {number}: unknown record type {other:02X}")),
        }
    }

    if !saw_eof {
        return Err("missing end-of-file record".to_string());
    }
    flatten(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple() {
        let text = b":0400000001020304F2\n:00000001FF\n";
        let (base, data) = decode(text).unwrap();
        assert_eq!(base, 0);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_extended_linear_address_and_gap() {
        // 0x08000000: AA BB, then 0x08000004: CC
        let text = ":020000040800F2\n:02000000AABB99\n:01000400CC2F\n:0400000508000000EF\n:00000001FF\n";
        let (base, data) = decode(text.as_bytes()).unwrap();
        assert_eq!(base, 0x0800_0000);
        assert_eq!(data, vec![0xAA, 0xBB, 0xFF, 0xFF, 0xCC]);
    }

    #[test]
    fn test_extended_segment_address() {
        // Segment 0x1000 -> base 0x10000
        let text = ":020000021000EC\n:0100000042BD\n:00000001FF\n";
        let (base, data) = decode(text.as_bytes()).unwrap();
        assert_eq!(base, 0x10000);
        assert_eq!(data, vec![0x42]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = b":0400000001020304F2\r\n:00000001FF\r\n";
        assert!(decode(text).is_ok());
    }

    #[test]
    fn test_bad_checksum() {
        let err = decode(b":0400000001020304F3\n:00000001FF\n").unwrap_err();
        assert!(err.contains("checksum"));
    }

    #[test]
    fn test_missing_eof() {
        let err = decode(b":0400000001020304F2\n").unwrap_err();
        assert!(err.contains("end-of-file"));
    }

    #[test]
    fn test_only_eof_has_no_data() {
        assert!(decode(b":00000001FF\n").is_err());
    }

    #[test]
    fn test_missing_start_code() {
        let err = decode(b"0400000001020304F2\n").unwrap_err();
        assert!(err.contains("start code"));
    }
}
