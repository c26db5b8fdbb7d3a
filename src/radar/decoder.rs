//! Decoder for the sensor's tokenized ASCII telemetry telegram.
//!
//! The reply is treated as a whitespace-separated token stream after every
//! byte outside printable ASCII is mapped to a space. Two blocks matter:
//! `P3DX1` (positions) and `V3DX1` (velocities). Each block is laid out as
//!
//! ```text
//! <marker> <scale:hex-f32> <unused> <count> <value:hex> ...
//! ```
//!
//! where the scale is an IEEE-754 single encoded as 8 hex digits. Position
//! values are unsigned, scaled and divided by 1000 to land in meters; the
//! scale token of the velocity block is applied as-is, with raw values read
//! as signed 16-bit two's complement.
//!
//! The decoder never fails: a malformed or truncated block leaves its
//! channels at zero and logs a warning. Whether an all-zero frame means an
//! obstructed sensor is the acquisition loop's call, not ours.

use crate::error::Error;
use crate::models::{RadarFrame, CHANNELS};
use tracing::warn;

const POSITION_MARKER: &str = "P3DX1";
const VELOCITY_MARKER: &str = "V3DX1";

/// Decodes a raw sensor reply into a frame stamped "now".
pub fn decode(reply: &[u8]) -> RadarFrame {
    let mut frame = RadarFrame::new();

    if reply.is_empty() {
        warn!("empty reply from sensor");
        return frame;
    }

    let cleaned: String = reply
        .iter()
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { ' ' })
        .collect();
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    if let Err(e) = decode_block(&tokens, POSITION_MARKER, &mut frame.positions, Block::Position) {
        warn!("{e}");
    }
    if let Err(e) = decode_block(&tokens, VELOCITY_MARKER, &mut frame.velocities, Block::Velocity) {
        warn!("{e}");
    }

    frame
}

#[derive(Clone, Copy)]
enum Block {
    Position,
    Velocity,
}

fn decode_block(
    tokens: &[&str],
    marker: &str,
    out: &mut [f64; CHANNELS],
    block: Block,
) -> Result<(), Error> {
    let start = tokens
        .iter()
        .position(|&t| t == marker)
        .ok_or_else(|| Error::DecodePartial(format!("marker {marker} not found")))?;

    if start + 3 >= tokens.len() {
        return Err(Error::DecodePartial(format!(
            "truncated {marker} block header"
        )));
    }

    let scale = hex_to_f32(tokens[start + 1]) as f64;

    // The declared value count follows one reserved token after the scale.
    let count = tokens[start + 3]
        .parse::<usize>()
        .unwrap_or(CHANNELS)
        .min(CHANNELS);

    for i in 0..count {
        let Some(&token) = tokens.get(start + 4 + i) else {
            break; // remaining channels keep their zero init
        };
        let raw = hex_to_i64(token);
        out[i] = match block {
            Block::Position => raw as f64 * scale / 1000.0,
            Block::Velocity => {
                // two's complement on 16 bits
                let signed = if raw > 32767 { raw - 65536 } else { raw };
                signed as f64 * scale
            }
        };
    }

    Ok(())
}

/// 8-hex-digit big-endian IEEE-754 single. Unparsable tokens decode to 0.0.
fn hex_to_f32(token: &str) -> f32 {
    match u32::from_str_radix(token, 16) {
        Ok(bits) => f32::from_bits(bits),
        Err(_) => {
            warn!("invalid hex float scale '{token}'");
            0.0
        }
    }
}

fn hex_to_i64(token: &str) -> i64 {
    i64::from_str_radix(token, 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION_SCALE_BITS: u32 = 0x3A83126F; // ~0.001
    const VELOCITY_SCALE_BITS: u32 = 0x3C23D70A; // ~0.01

    fn happy_path_reply() -> Vec<u8> {
        let mut reply = vec![0x02];
        reply.extend_from_slice(
            b"sRA LMDradardata 1 P3DX1 3A83126F 0 7 0000 01F4 03E8 05DC 07D0 09C4 0BB8 \
              V3DX1 3C23D70A 0 7 0000 FFF6 000A 0000 0014 FFEC 0000",
        );
        reply.push(0x03);
        reply
    }

    #[test]
    fn decodes_the_documented_telegram() {
        let frame = decode(&happy_path_reply());
        let scale_p = f32::from_bits(POSITION_SCALE_BITS) as f64;
        let scale_v = f32::from_bits(VELOCITY_SCALE_BITS) as f64;

        let raw_positions = [0x0000, 0x01F4, 0x03E8, 0x05DC, 0x07D0, 0x09C4, 0x0BB8];
        for (i, raw) in raw_positions.iter().enumerate() {
            let expected = *raw as f64 * scale_p / 1000.0;
            assert!(
                (frame.positions[i] - expected).abs() < 1e-12,
                "position {i}: {} != {expected}",
                frame.positions[i]
            );
        }

        // 0xFFF6 is -10 two's complement, 0x0014 is 20
        assert!((frame.velocities[1] - (-10.0 * scale_v)).abs() < 1e-12);
        assert!((frame.velocities[4] - (20.0 * scale_v)).abs() < 1e-12);
        assert!((frame.velocities[5] - (-20.0 * scale_v)).abs() < 1e-12);
        assert_eq!(frame.velocities[0], 0.0);
        assert_eq!(frame.status, crate::models::StatusKind::Ok);
    }

    #[test]
    fn synthesized_blocks_round_trip_through_the_scaling() {
        // (scale bits, raw channel values) pairs exercising sign handling
        let cases: &[(u32, [i32; 7])] = &[
            (0x3F800000, [1, 2, 3, 4, 5, 6, 7]),          // scale 1.0
            (0x3DCCCCCD, [0, 100, 2000, 30000, 7, 0, 1]), // scale 0.1
            (0x40490FDB, [0, 0, 0, 0, 0, 0, 0]),          // pi, all zero
            (0x3C23D70A, [-1, -32768, 32767, 0, 500, -500, 12]),
        ];

        for &(bits, raws) in cases {
            let scale = f32::from_bits(bits) as f64;
            let mut telegram = format!("P3DX1 {bits:08X} 0 7");
            for raw in raws {
                telegram.push_str(&format!(" {:04X}", (raw as i64 & 0xFFFF)));
            }
            telegram.push_str(&format!(" V3DX1 {bits:08X} 0 7"));
            for raw in raws {
                telegram.push_str(&format!(" {:04X}", (raw as i64 & 0xFFFF)));
            }

            let frame = decode(telegram.as_bytes());
            for i in 0..7 {
                let unsigned = (raws[i] as i64) & 0xFFFF;
                let expected_pos = unsigned as f64 * scale / 1000.0;
                let signed = if unsigned > 32767 { unsigned - 65536 } else { unsigned };
                let expected_vel = signed as f64 * scale;
                assert!(
                    (frame.positions[i] - expected_pos).abs() < 1e-9,
                    "scale {scale} channel {i} position"
                );
                assert!(
                    (frame.velocities[i] - expected_vel).abs() < 1e-9,
                    "scale {scale} channel {i} velocity"
                );
            }
        }
    }

    #[test]
    fn never_panics_on_arbitrary_bytes() {
        let inputs: &[&[u8]] = &[
            b"",
            b"\x00\xff\xfe\x02\x03",
            b"garbage tokens only",
            b"P3DX1",
            b"P3DX1 3A83126F 0",
            b"P3DX1 NOTHEX 0 7 01F4",
            b"V3DX1 3C23D70A 0 7",
            &[0x80; 4096],
        ];
        for input in inputs {
            let frame = decode(input);
            // channels with no parsed token stay exactly zero
            assert!(frame.positions.iter().chain(frame.velocities.iter()).all(|v| v.is_finite()));
        }
    }

    #[test]
    fn missing_blocks_leave_channels_zeroed() {
        let frame = decode(b"V3DX1 3F800000 0 2 0001 0002");
        assert!(frame.all_positions_zero());
        assert_eq!(frame.velocities[0], 1.0);
        assert_eq!(frame.velocities[1], 2.0);
        assert_eq!(frame.velocities[2], 0.0);
    }

    #[test]
    fn declared_count_is_clamped_to_seven() {
        let frame = decode(b"P3DX1 3F800000 0 12 0001 0002 0003 0004 0005 0006 0007 0008 0009");
        assert!((frame.positions[6] - 7.0 / 1000.0).abs() < 1e-12);
        // token 0008 belongs past the channel array and is ignored
    }

    #[test]
    fn truncated_value_list_fills_what_it_can() {
        let frame = decode(b"P3DX1 3F800000 0 7 0001 0002 0003");
        assert!((frame.positions[2] - 3.0 / 1000.0).abs() < 1e-12);
        assert_eq!(frame.positions[3], 0.0);
    }
}
