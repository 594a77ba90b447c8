//! Transwarp fast-loader encoder: redundant, self-verifying GCR blocks
//! that let a Transwarp-equipped 1541/1571 read a file many times
//! faster than stock DOS by skipping the usual handshake.
//!
//! Grounded in the reference tool's GCR/diff-accumulator encoding
//! machinery (`encode_transwarp_block` and its helpers) and
//! `write_transwarp_file`. Unlike every other file type this crate
//! writes, a Transwarp file ignores the placement cursor entirely: the
//! reference tool always restarts its own track search from the
//! directory track, or from `-r`'s minimum track, independent of
//! whatever track the previous file ended on.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::bam;
use crate::config::EngineConfig;
use crate::directory::{self, EntryLocation};
use crate::error::{Error, ErrorKind};
use crate::image::Image;
use crate::model::FileJob;

const TRANSWARP_BASE_BLOCK_SIZE: usize = 0xc0;
const TRANSWARP_BUFFER_BLOCK_SIZE: usize = 0x1f;
const TRANSWARP_BLOCK_SIZE: usize = TRANSWARP_BASE_BLOCK_SIZE + TRANSWARP_BUFFER_BLOCK_SIZE;
const TRANSWARP_KEY_SIZE: usize = 29;
const TRANSWARP_KEY_HASH_ROUNDS: u32 = 33;

const FILE_TRACK_OFFSET: usize = 3;
const FILE_SECTOR_OFFSET: usize = 4;
const TRANSWARP_SIG_LO_OFFSET: usize = 21;
const TRANSWARP_SIG_HI_OFFSET: usize = 22;
const DIRDATA_CHECKSUM_OFFSET: usize = 23;
const TRANSWARP_TRACK_OFFSET: usize = 24;
const FILE_CHECKSUM_OFFSET: usize = 25;
const LOAD_ADDRESS_LO_OFFSET: usize = 26;
const LOAD_ADDRESS_HI_OFFSET: usize = 27;
const END_ADDRESS_LO_OFFSET: usize = 28;
const END_ADDRESS_HI_OFFSET: usize = 29;
const FILE_BLOCKS_LO_OFFSET: usize = 30;
const FILE_BLOCKS_HI_OFFSET: usize = 31;
const TRANSWARP_SIGNATURE_LO: u8 = b'T';
const TRANSWARP_SIGNATURE_HI: u8 = b'W';

const NIBBLE_TO_GCR: [u8; 16] = [
    0x0a, 0x0b, 0x12, 0x13, 0x0e, 0x0f, 0x16, 0x17, 0x09, 0x19, 0x1a, 0x1b, 0x0d, 0x1d, 0x1e, 0x15,
];

const ENCODE_0: [i32; 64] = [
    0xf6, 0xee, 0xf5, 0xed, 0x9a, 0xde, 0x96, 0xda, 0xf3, 0xea, 0xf2, 0x9e, 0x93, 0xd6, 0x92, 0xd3,
    0xd2, 0xca, 0xce, 0xbe, 0xb3, 0x7e, 0xb2, 0x7d, 0xcd, 0xba, 0xcb, 0xb6, 0xae, 0x7b, 0xaa, 0x7a,
    0x76, 0x6e, 0x75, 0x6d, 0x5e, 0x5b, 0x5d, 0x5a, 0x73, 0x6b, 0x72, 0x6a, 0xdb, 0x9d, 0xeb, 0xd5,
    0x56, 0x4e, 0x55, 0x4d, 0xbd, 0xb5, 0xbb, 0xad, 0x53, 0x4b, 0x52, 0xdd, 0xab, 0x4a, 0x9b, 0x95,
];
const ENCODE_1: [i32; 64] = [
    0xf6, 0xee, 0xf5, 0xed, 0x9a, 0xde, 0x96, 0xda, 0xf3, 0xea, 0xf2, 0x9e, 0x93, 0xd6, 0x92, 0xef,
    0xe7, 0x7c, 0x9f, 0x74, 0xe6, 0x6c, 0xdf, 0xa6, 0x9c, 0xba, 0x94, 0xb6, 0xae, 0x7b, 0xaa, 0x7a,
    0x76, 0x6e, 0x75, 0x6d, 0x5e, 0x5b, 0x5d, 0x5a, 0x73, 0x6b, 0x72, 0x6a, 0xdb, 0xd7, 0xeb, 0xe5,
    0x56, 0x64, 0x55, 0x5c, 0xbd, 0xb5, 0xbb, 0xad, 0x65, 0x54, 0x5f, 0xdd, 0xab, 0xa7, 0x9b, 0xa5,
];
const ENCODE_2: [i32; 16] = [
    0xa5, 0xa7, 0xa9, 0xab, 0xd5, 0xd7, 0xd9, 0xdb, 0x95, 0x99, 0x9b, 0x97, 0xe5, 0x9d, 0xeb, 0xe9,
];
const ENCODE_3: [i32; 64] = [
    0xf6, 0xee, 0xf5, 0xed, 0x69, 0xde, 0x59, 0xda, 0xb9, 0xea, 0xb7, 0x6f, 0x57, 0xd6, 0x4f, 0xef,
    0xe7, 0xca, 0xce, 0xbe, 0xe6, 0xbf, 0xdf, 0xa6, 0xcd, 0xba, 0xcb, 0xb6, 0xae, 0x7b, 0xaa, 0x7a,
    0x76, 0x6e, 0x75, 0x6d, 0x5e, 0x5b, 0x5d, 0x5a, 0x67, 0x6b, 0x66, 0x6a, 0xe9, 0xd7, 0xeb, 0xe5,
    0x56, 0x4e, 0x55, 0x4d, 0xbd, 0xb5, 0xbb, 0xad, 0x65, 0x4b, 0x5f, 0xdd, 0xab, 0xa7, 0xa9, 0xa5,
];
const ENCODE_4: [i32; 64] = [
    0xcf, 0xaf, 0xc9, 0x79, 0x69, 0xde, 0x59, 0xda, 0xb9, 0x77, 0xb7, 0x6f, 0x57, 0xd6, 0x4f, 0xd3,
    0xd2, 0xca, 0xce, 0xbe, 0xb3, 0x7e, 0xb2, 0x7d, 0xcd, 0xba, 0xcb, 0xb6, 0xae, 0x7b, 0xaa, 0x7a,
    0x76, 0x6e, 0x75, 0x6d, 0x5e, 0x5b, 0x5d, 0x5a, 0x73, 0x6b, 0x72, 0x6a, 0xdb, 0xd7, 0xd9, 0xd5,
    0x56, 0x4e, 0x55, 0x4d, 0xbd, 0xb5, 0xbb, 0xad, 0x53, 0x4b, 0x52, 0xdd, 0xab, 0x4a, 0xa9, 0x49,
];

#[rustfmt::skip]
const DECODE: [i32; 256] = [
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, 0x00, 0x02, 0x12, -1, 0x14, 0x16, 0x68,
    -1, -1, 0x18, 0x1a, 0x12, 0x1c, 0x1e, 0x6a, -1, 0x6c, 0x24, 0x26, 0x14, 0x2c, 0x2e, 0x18,
    -1, -1, -1, -1, 0x16, 0x1a, 0x38, 0x3a, -1, 0x6e, 0x30, 0x32, 0x46, 0x34, 0x36, 0x70,
    -1, -1, 0x38, 0x3a, 0x54, 0x3c, 0x3e, 0x72, -1, 0x74, 0x40, 0x42, 0x56, 0x44, 0x46, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, 0x68, 0x6a, 0x58, 0x80, 0x6c, 0x8a, -1, 0x82, 0x6e, 0x88, 0x5a, 0xa2, 0x70, 0x5c,
    -1, -1, -1, -1, -1, 0x00, 0x44, 0x02, -1, 0x08, 0x48, 0x0a, -1, 0x04, 0x4a, 0x76,
    -1, -1, 0x4c, 0x4e, -1, 0x06, 0x50, 0x78, -1, 0x7a, 0x52, 0x0c, -1, 0x0e, 0x54, 0x46,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, 0x7c, 0x56, 0x58, -1, 0x5a, 0x5c, 0x7e,
    -1, -1, 0x5e, 0x60, -1, 0x20, 0x62, 0x22, -1, 0x28, 0x64, 0x2a, -1, 0x10, 0x66, 0x4c,
    -1, -1, -1, -1, -1, 0xa0, 0x4e, 0x5e, -1, 0xaa, 0x72, 0xa8, -1, 0x74, 0x76, 0x60,
    -1, -1, 0x78, 0x7a, -1, 0x7c, 0x7e, -1, -1, -1, -1, -1, -1, -1, -1, -1,
];

/// Encoder state threaded across consecutive blocks on a track, with a
/// saved copy restored at the start of the last block so the next
/// track resumes cleanly.
#[derive(Default, Clone, Copy)]
struct Ctx {
    previous: u8,
    previous1: u8,
    previous2: u8,
    accu: u8,
    carry: u8,
    recvcarry: u8,
    carry2: u8,
    sendaccu: u8,
    sendcarry: u8,
}

fn generate_gcr_decoding_table() -> [i8; 32] {
    let mut table = [0i8; 32];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = -((i as i32) + 1) as i8;
    }
    for (i, &gcr) in NIBBLE_TO_GCR.iter().enumerate() {
        table[gcr as usize] = i as i8;
    }
    table
}

fn even_bits(value: u8) -> u8 {
    (((value >> 6) & 1) << 3) | (((value >> 4) & 1) << 2) | (((value >> 2) & 1) << 1) | (value & 1)
}

fn odd_bits(value: u8) -> u8 {
    (((value >> 7) & 1) << 3) | (((value >> 5) & 1) << 2) | (((value >> 3) & 1) << 1) | ((value >> 1) & 1)
}

pub(crate) fn encode_4_bytes_gcr(inp: [u8; 4]) -> [u8; 5] {
    let n = |x: u8| NIBBLE_TO_GCR[x as usize];
    [
        (n((inp[0] >> 4) & 0xf) << 3) | (n(inp[0] & 0xf) >> 2),
        (n(inp[0] & 0xf) << 6) | (n((inp[1] >> 4) & 0xf) << 1) | (n(inp[1] & 0xf) >> 4),
        (n(inp[1] & 0xf) << 4) | (n((inp[2] >> 4) & 0xf) >> 1),
        (n((inp[2] >> 4) & 0xf) << 7) | (n(inp[2] & 0xf) << 2) | (n((inp[3] >> 4) & 0xf) >> 3),
        (n((inp[3] >> 4) & 0xf) << 5) | n(inp[3] & 0xf),
    ]
}

fn decode_5_bytes_gcr(map: &[i8; 32], inp: &[u8; 5]) -> (bool, [u8; 4]) {
    let g = |x: u8| map[x as usize] as i32;

    let gcr_hi = inp[0] >> 3;
    let gcr_lo = ((inp[0] & 0x7) << 2) | (inp[1] >> 6);
    let out0 = (g(gcr_hi) << 4) | g(gcr_lo);

    let gcr_hi = (inp[1] & 0x3e) >> 1;
    let gcr_lo = ((inp[1] & 0x1) << 4) | (inp[2] >> 4);
    let out1 = (g(gcr_hi) << 4) | g(gcr_lo);

    let gcr_hi = ((inp[2] & 0xf) << 1) | (inp[3] >> 7);
    let gcr_lo = (inp[3] & 0x7c) >> 2;
    let out2 = (g(gcr_hi) << 4) | g(gcr_lo);

    let gcr_hi = ((inp[3] & 0x3) << 3) | (inp[4] >> 5);
    let gcr_lo = inp[4] & 0x1f;
    let out3 = (g(gcr_hi) << 4) | g(gcr_lo);

    let ok = (out0 | out1 | out2 | out3) >= 0;
    (ok, [out0 as u8, out1 as u8, out2 as u8, out3 as u8])
}

fn decode_gcr_block(map: &[i8; 32], encoded: &[u8]) -> (bool, i32, [u8; 256]) {
    let mut decoded = [0u8; 256];

    let (mut ok, head) = decode_5_bytes_gcr(map, encoded[0..5].try_into().unwrap());
    decoded[0] = head[1];
    decoded[1] = head[2];
    decoded[2] = head[3];
    let mut checksum = (decoded[0] ^ decoded[1] ^ decoded[2]) as i32;

    let mut i = 5usize;
    let mut j = 3usize;
    while i < 320 {
        let (group_ok, group) = decode_5_bytes_gcr(map, encoded[i..i + 5].try_into().unwrap());
        ok &= group_ok;
        decoded[j] = group[0];
        decoded[j + 1] = group[1];
        decoded[j + 2] = group[2];
        decoded[j + 3] = group[3];
        checksum ^= (decoded[j] ^ decoded[j + 1] ^ decoded[j + 2] ^ decoded[j + 3]) as i32;
        i += 5;
        j += 4;
    }

    let (tail_ok, tail) = decode_5_bytes_gcr(map, encoded[i..i + 5].try_into().unwrap());
    ok &= tail_ok;
    decoded[255] = tail[0];
    checksum ^= tail[0] as i32;

    let computed = if ok { checksum } else { -1 };
    (ok, computed, decoded)
}

fn encode_read_diff(encode: &[i32], accu: &mut u8, carry: &mut u8, value: u8) -> Result<u8, Error> {
    let target = (DECODE[encode[value as usize] as usize] & 0x7e) as u8;

    let mut value_to_encode = encode.len();
    for v in 0..encode.len() {
        let val = (DECODE[encode[v] as usize] + *accu as i32 + *carry as i32) as u8;
        if (val & 0x7e) == target {
            value_to_encode = v;
            break;
        }
    }
    if value_to_encode >= encode.len() {
        return Err(ErrorKind::TranswarpEncodeError(-2).into());
    }

    let sum = DECODE[encode[value_to_encode] as usize] + *accu as i32 + *carry as i32;
    *accu = sum as u8;
    *carry = (sum >= 256) as u8;

    let check = DECODE[encode[value as usize] as usize] as u8;
    if (*accu & 0x7e) != (check & 0x7e) {
        return Err(ErrorKind::TranswarpEncodeError(-3).into());
    }

    let temp = (*carry << 7) | (*accu >> 1);
    *carry = *accu & 1;
    *accu = (*carry << 7) | ((temp & 0xfb) >> 1);
    *carry = (*accu >> 6) & 1;

    Ok(encode[value_to_encode] as u8)
}

fn encode_send_diff(value: u8, accu: &mut u8, carry: &mut u8) -> u8 {
    let mut value = (value & !0b1001) | (((value >> 3) & 1) << 0) | ((value & 1) << 3);
    value ^= 0xff;

    let diff = value as i32 - *accu as i32 - *carry as i32;
    *carry = (diff < 0) as u8;
    *accu = value;

    *accu = (((*accu >> 7) & 1) << 7)
        | (((*accu >> 1) & 1) << 6)
        | (((*accu >> 7) & 1) << 5)
        | (*carry << 4)
        | (((*accu >> 6) & 1) << 2)
        | (((*accu >> 5) & 1) << 1);
    *carry = (*accu >> 6) & 1;

    diff as u8
}

fn encode_receive_diff(inp: u8, previous: &mut u8, carry: &mut u8) -> u8 {
    let out = inp as i32 - *carry as i32;
    let diff = out - (((*previous as i32) & 0xc0) | (out & 0x3f));
    *carry = (diff < 0) as u8;
    let out = ((out ^ *previous as i32) & 0x3f) | diff;
    *previous = inp;
    out as u8
}

fn encode_buffer_byte(previous: u8, carry: &mut u8, inp: u8, encoded: &mut [u8], base: usize) -> u8 {
    let even = (previous >> 1) ^ inp;
    let odd = ((*carry << 7) | (previous >> 1)) ^ inp;
    *carry = previous & 1;
    encoded[base + (31 * 5) + 4] = ENCODE_2[even_bits(even) as usize] as u8;
    encoded[base + 4] = ENCODE_2[odd_bits(odd) as usize] as u8;
    inp
}

fn encode_base_bytes(scramble: &[[u8; 256]; 4], ctx: &mut Ctx, inp: &[u8; 3], encoded: &mut [u8], base: usize) -> Result<(), Error> {
    let in0 = encode_receive_diff(inp[0], &mut ctx.previous, &mut ctx.recvcarry);
    let in1 = encode_receive_diff(inp[1], &mut ctx.previous, &mut ctx.recvcarry);
    let in2 = encode_receive_diff(inp[2], &mut ctx.previous, &mut ctx.recvcarry);

    let in0 = scramble[0][in0 as usize];
    let in1 = scramble[1][in1 as usize];
    let in2 = scramble[2][in2 as usize];

    let val3 = in0 & 0x3f;
    encoded[base] = encode_read_diff(&ENCODE_3, &mut ctx.accu, &mut ctx.carry, val3)?;

    let val4 = ((in0 >> 6) | (in1 << 2)) & 0x3f;
    encoded[base + 1] = encode_read_diff(&ENCODE_4, &mut ctx.accu, &mut ctx.carry, val4)?;

    let val0 = ((in1 >> 4) | (in2 << 4)) & 0x3f;
    encoded[base + 2] = encode_read_diff(&ENCODE_0, &mut ctx.accu, &mut ctx.carry, val0)?;

    let val1 = in2 >> 2;
    encoded[base + 3] = encode_read_diff(&ENCODE_1, &mut ctx.accu, &mut ctx.carry, val1)?;

    Ok(())
}

fn crc8(mut value: u8) -> u8 {
    for _ in 0..8 {
        value = if value & 0x80 != 0 { (value << 1) ^ 0x31 } else { value << 1 };
    }
    value
}

/// Permute the first `set.len()` entries of `set` by repeatedly
/// dividing the big number held across `key`'s bytes down to a
/// Fisher-Yates swap index. `key` is mutated in place.
fn permute(key: &mut [u8; TRANSWARP_KEY_SIZE], set: &mut [i32]) {
    let len = set.len();
    for i in 0..(len - 1) {
        let divisor = (len - i) as i32;
        let mut remainder: i32 = 0;
        for idx in (0..=(TRANSWARP_KEY_SIZE - 12)).rev() {
            let dividend = (remainder << 8) | key[idx] as i32;
            remainder = dividend % divisor;
            key[idx] = (dividend / divisor) as u8;
        }
        set.swap(remainder as usize, (divisor - 1) as usize);
    }
}

const ENCODE_TOP: [u8; 4] = [0x05, 0x07, 0x0d, 0x0b];

#[allow(clippy::too_many_arguments)]
fn encode_transwarp_block(
    scramble: &[[u8; 256]; 4],
    gcr_to_nibble: &[i8; 32],
    ctx: &mut Ctx,
    indata: &[u8],
    filepos: usize,
    encoded: &mut [u8; 325],
) -> Result<(), Error> {
    let unencoded = &indata[filepos..];

    let mut semiencoded = [0u8; TRANSWARP_BUFFER_BLOCK_SIZE];
    for i in (0..TRANSWARP_BUFFER_BLOCK_SIZE).rev() {
        let mut value = encode_receive_diff(unencoded[TRANSWARP_BASE_BLOCK_SIZE + i], &mut ctx.previous2, &mut ctx.carry2);
        value = scramble[3][value as usize];
        semiencoded[i] = encode_send_diff(value, &mut ctx.sendaccu, &mut ctx.sendcarry);
    }

    let mut buffer_previous = ctx.previous1;
    let mut buffer_carry = 0u8;
    for i in 0..TRANSWARP_BUFFER_BLOCK_SIZE {
        let shuffle = (TRANSWARP_BUFFER_BLOCK_SIZE - 1) - (i / 2) - if i & 1 != 0 { (TRANSWARP_BUFFER_BLOCK_SIZE / 2) + 1 } else { 0 };
        let value = semiencoded[shuffle];
        let base = 3 + 5 * (TRANSWARP_BUFFER_BLOCK_SIZE - 1 - shuffle);
        buffer_previous = encode_buffer_byte(buffer_previous, &mut buffer_carry, value, encoded, base);
    }

    let mut previous = unencoded[TRANSWARP_BASE_BLOCK_SIZE - 1];
    const CRC_STEP: usize = 8;
    let mut i = 0;
    while i < TRANSWARP_BASE_BLOCK_SIZE {
        previous = crc8(previous);
        previous ^= unencoded[i];
        i += CRC_STEP;
    }
    previous = crc8(previous);

    if filepos > (21 * TRANSWARP_BLOCK_SIZE) + 2 {
        const BACK_CHECK_OFFS: usize = 21 * TRANSWARP_BLOCK_SIZE + TRANSWARP_BUFFER_BLOCK_SIZE;
        previous ^= indata[filepos - BACK_CHECK_OFFS];
        previous = crc8(previous);
        previous ^= indata[filepos - BACK_CHECK_OFFS + TRANSWARP_BUFFER_BLOCK_SIZE - 1];
        previous = crc8(previous);
    }

    let head_gcr = encode_4_bytes_gcr([7, 0, 0, 0]);
    encoded[0..5].copy_from_slice(&head_gcr);
    let tail_gcr = encode_4_bytes_gcr([0, 0, 0, 0]);
    encoded[320..325].copy_from_slice(&tail_gcr);

    let mut accu = ctx.previous;
    let mut carry = 0u8;
    for &byte in &unencoded[0..TRANSWARP_BASE_BLOCK_SIZE] {
        encode_receive_diff(byte, &mut accu, &mut carry);
    }

    let receive_checksum = 0u8.wrapping_sub(previous).wrapping_sub(carry);
    let checksum = receive_checksum ^ (buffer_previous >> 1);
    let mut odd = odd_bits(checksum);
    odd ^= buffer_carry << 3;

    encoded[2] = (encoded[2] & 0xf0) | ENCODE_TOP[(odd & 0x3) as usize];
    encoded[317] = ENCODE_2[even_bits(checksum) as usize] as u8;
    encoded[322] = ENCODE_2[(odd & 0xc) as usize] as u8;

    let top_2_bits = encoded[2];
    let middle_4_bits = encoded[317];
    let bottom_2_bits = encoded[322];

    ctx.recvcarry = 0;
    ctx.accu = 0;
    ctx.carry = 0;
    let mut i = 0usize;
    let mut j = 0usize;
    while i < TRANSWARP_BASE_BLOCK_SIZE {
        let triple = [unencoded[i], unencoded[i + 1], unencoded[i + 2]];
        encode_base_bytes(scramble, ctx, &triple, encoded, 3 + j)?;

        ctx.accu = 8;
        ctx.carry = 0;

        let target = encoded[3 + j + 4];
        let target_accu = DECODE[target as usize] as u8;
        let target_check = ENCODE_2[odd_bits(target_accu) as usize] as u8;
        if target != target_check {
            return Err(ErrorKind::TranswarpEncodeError(-4).into());
        }

        let store = ctx.accu ^ target_accu;
        encoded[3 + j + 4] = ENCODE_2[odd_bits(store) as usize] as u8;

        let stored = DECODE[encoded[3 + j + 4] as usize] as u8;
        ctx.accu ^= stored;
        if ctx.accu != target_accu {
            return Err(ErrorKind::TranswarpEncodeError(-5).into());
        }

        i += 3;
        j += 5;
    }
    if carry != ctx.recvcarry {
        return Err(ErrorKind::TranswarpEncodeError(-6).into());
    }

    let top_fix_raw = encoded[2] ^ (DECODE[encoded[322] as usize] as u8 & 0xf);
    let top_fix = ((top_fix_raw >> 2) & 2) | ((top_fix_raw >> 1) & 1);
    encoded[2] = (encoded[2] & 0xf0) | ENCODE_TOP[top_fix as usize];
    encoded[322] = (encoded[322] & 0xf0) | 0x5;

    let mut block_checksum = DECODE[middle_4_bits as usize] as u8;
    block_checksum = (block_checksum >> 1) | (buffer_carry << 7);
    block_checksum ^= DECODE[bottom_2_bits as usize] as u8;
    block_checksum ^= top_2_bits & 0xa;
    if block_checksum != checksum {
        return Err(ErrorKind::TranswarpEncodeError(-1).into());
    }

    let (head_ok, mut gcr_decoded_head) = decode_5_bytes_gcr(gcr_to_nibble, encoded[0..5].try_into().unwrap());
    let (tail_ok, gcr_decoded_tail) = decode_5_bytes_gcr(gcr_to_nibble, encoded[320..325].try_into().unwrap());
    let gcr_checksum = if tail_ok { gcr_decoded_tail[1] as i32 } else { -1 };
    let (block_ok, computed_checksum, _decoded) = decode_gcr_block(gcr_to_nibble, encoded);

    gcr_decoded_head[1] ^= (gcr_checksum ^ computed_checksum) as u8;
    let new_head = encode_4_bytes_gcr(gcr_decoded_head);
    encoded[0..5].copy_from_slice(&new_head);

    if !(head_ok && tail_ok && block_ok) {
        return Err(ErrorKind::TranswarpEncodeError(-6).into());
    }

    Ok(())
}

fn transwarp_dirdata_checksum(image: &Image, entry_offset: usize) -> u8 {
    let mut checksum: i32 = 0;
    let mut carry: i32 = 1;
    for offset in DIRDATA_CHECKSUM_OFFSET..=FILE_BLOCKS_LO_OFFSET {
        checksum += image.byte(entry_offset + offset) as i32 + carry;
        carry = (checksum >= 0x100) as i32;
        checksum &= 0xff;
    }
    checksum as u8
}

/// A tiny xorshift stream seeded from the scramble key, standing in
/// for the reference tool's wall-clock-seeded `rand()`. Byte choices
/// here only pad an autostart BASIC stub so its line pointer and
/// shadow bytes aren't predictable; determinism (same key, same
/// output) is preferred over matching the reference tool's
/// non-reproducible seed.
fn key_stream(key: &[u8; TRANSWARP_KEY_SIZE]) -> impl FnMut() -> u8 {
    let mut state = key.iter().fold(0x2545_f491u32, |acc, &b| acc.wrapping_mul(16_777_619).wrapping_add(b as u32));
    if state == 0 {
        state = 1;
    }
    move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state & 0xff) as u8
    }
}

/// Encode `data` (with its 2-byte PRG load address header) as a
/// Transwarp fast-loader file and write it to `image`, starting the
/// track search from the directory track (or `job.min_track`,
/// verbatim). The caller's placement cursor is not consulted: a
/// Transwarp file always restarts its own search, matching the
/// reference tool passing no track/sector into this step at all.
pub fn write_transwarp_file(
    image: &mut Image,
    job: &mut FileJob,
    data: &[u8],
    config: &EngineConfig,
    _start_track: u32,
    _start_sector: u32,
) -> Result<(), Error> {
    let variant = image.variant();
    let mut filedata = data.to_vec();
    let mut file_size: i64 = filedata.len() as i64 - 2;

    let mut track = match job.min_track {
        Some(t) => t,
        None => {
            let mut free_tracks = [false; 40];
            for t in 1..=40u32 {
                free_tracks[(t - 1) as usize] = (0..variant.sectors(t)).all(|s| bam::is_free(image, t, s, 0, 0));
            }

            let mut track = variant.dir_track() - 1;
            let mut found = false;
            while track > 0 {
                if free_tracks[(track - 1) as usize] {
                    let mut size = file_size;
                    let mut t = track;
                    while size > 0 && t > 0 {
                        size -= TRANSWARP_BLOCK_SIZE as i64 * variant.sectors(t) as i64;
                        if size >= 0 {
                            if !free_tracks[(t - 1) as usize] {
                                break;
                            }
                            t -= 1;
                        }
                    }
                    if size <= 0 {
                        found = true;
                        break;
                    }
                }
                track -= 1;
            }

            if !found {
                track = variant.dir_track() + 2;
                while track < 40 {
                    if free_tracks[(track - 1) as usize] {
                        let mut size = file_size;
                        let mut t = track;
                        while size > 0 {
                            size -= TRANSWARP_BLOCK_SIZE as i64 * variant.sectors(t) as i64;
                            if size >= 0 {
                                if !free_tracks[(t - 1) as usize] {
                                    break;
                                }
                                t += 1;
                            }
                        }
                        if size <= 0 {
                            break;
                        }
                    }
                    track += 1;
                }
            }
            track
        }
    };

    job.track = track;
    job.sector = 0;

    let gcr_to_nibble = generate_gcr_decoding_table();
    let mut key = [0u8; TRANSWARP_KEY_SIZE];
    let have_key = job.transwarp_key.is_some();

    if let Some(job_key) = job.transwarp_key {
        if filedata.len() >= 4 && filedata[0] == 0x01 && filedata[1] == 0x08 {
            let mut rng = key_stream(&job_key);
            let linelink = (((filedata[3] as i32) << 8) | filedata[2] as i32) - 0x0801 + 2;
            if linelink > 0
                && ((linelink - 2) as i64) < file_size
                && (filedata[(linelink - 1) as usize] | filedata[linelink as usize] | filedata[(linelink + 1) as usize]) == 0
            {
                while filedata[linelink as usize] == 0 {
                    filedata[linelink as usize] = rng();
                }
            }

            filedata[2] = rng();
            while filedata[3] == 0 || filedata[3] == 8 {
                filedata[3] = rng();
            }

            let mut remaining = file_size;
            let mut filetrack = track;
            while remaining > 0 {
                remaining -= TRANSWARP_BLOCK_SIZE as i64 * variant.sectors(filetrack) as i64;
                if remaining > 0 {
                    filetrack = if filetrack < variant.dir_track() { filetrack - 1 } else { filetrack + 1 };
                }
            }
            let spare_blocks = (-remaining) / TRANSWARP_BLOCK_SIZE as i64;
            let leftover = TRANSWARP_BLOCK_SIZE as i64 - (file_size % TRANSWARP_BLOCK_SIZE as i64);
            let mut spare_bytes = spare_blocks * TRANSWARP_BLOCK_SIZE as i64 + if leftover != TRANSWARP_BLOCK_SIZE as i64 { leftover } else { 0 };
            while spare_bytes > (0x0801 - 0x0400) {
                spare_bytes -= TRANSWARP_BLOCK_SIZE as i64;
            }

            if spare_bytes > 0 {
                let spare_bytes = spare_bytes as usize;
                let load_address = ((filedata[1] as i32) << 8 | filedata[0] as i32) - spare_bytes as i32;
                filedata[0] = load_address as u8;
                filedata[1] = (load_address >> 8) as u8;

                let old_len = filedata.len();
                filedata.resize(old_len + spare_bytes, 0);
                filedata.copy_within(2..2 + file_size as usize, 2 + spare_bytes);
                filedata[spare_bytes + 1] = 0;
                for b in filedata.iter_mut().take(spare_bytes + 1).skip(2) {
                    *b = rng();
                }
                file_size += spare_bytes as i64;
            }
        }

        key = job_key;
        for round in (1..=TRANSWARP_KEY_HASH_ROUNDS).rev() {
            for i in 0..(TRANSWARP_KEY_SIZE - 1) {
                key[i] ^= key[i + 1];
            }
            for i in (0..TRANSWARP_KEY_SIZE).rev() {
                let product = key[i] as i32 * 0x6b;
                key[i] = product as u8;
                let mut msb = product >> 8;
                for j in (i + 1)..TRANSWARP_KEY_SIZE {
                    msb += key[j] as i32;
                    key[j] = msb as u8;
                    msb >>= 8;
                }
            }
            let mut sum = round as i32;
            for k in key.iter_mut() {
                sum += *k as i32;
                *k = sum as u8;
                sum >>= 8;
            }
        }
    }

    let dirdata_key: u64 = (key[TRANSWARP_KEY_SIZE - 1] as u64) << 56
        | (key[TRANSWARP_KEY_SIZE - 2] as u64) << 48
        | (key[TRANSWARP_KEY_SIZE - 3] as u64) << 40
        | (key[TRANSWARP_KEY_SIZE - 4] as u64) << 32
        | (key[TRANSWARP_KEY_SIZE - 5] as u64) << 24
        | (key[TRANSWARP_KEY_SIZE - 6] as u64) << 16
        | (key[TRANSWARP_KEY_SIZE - 7] as u64) << 8
        | (key[TRANSWARP_KEY_SIZE - 8] as u64);

    let initial_buffer_store_value = key[TRANSWARP_KEY_SIZE - 9];
    let initial_buffer_recvaccu_value = key[TRANSWARP_KEY_SIZE - 10];
    let initial_block_recvaccu_value = key[TRANSWARP_KEY_SIZE - 11];

    let mut scramble = [[0u8; 256]; 4];
    for i in 0..4 {
        let mut set = [0i32, 2, 4, 1, 3, 5];
        if have_key {
            permute(&mut key, &mut set);
        }

        let mut set2 = [[0i32; 4]; 3];
        for row in set2.iter_mut() {
            let mut set3 = [0i32, 1, 2, 3];
            if have_key {
                permute(&mut key, &mut set3);
            }
            for k in 0..4 {
                for (l, &v) in set3.iter().enumerate() {
                    if k as i32 == v {
                        row[k] = l as i32;
                        break;
                    }
                }
            }
        }

        for j in 0u32..256 {
            let jb = j as u8;
            let idx0 = (((jb >> (set[0] as u32)) & 1) | (((jb >> (set[3] as u32)) & 1) << 1)) as usize;
            let idx1 = (((jb >> (set[1] as u32)) & 1) | (((jb >> (set[4] as u32)) & 1) << 1)) as usize;
            let idx2 = (((jb >> (set[2] as u32)) & 1) | (((jb >> (set[5] as u32)) & 1) << 1)) as usize;
            let scrambled = (set2[0][idx0] as u8) | ((set2[1][idx1] as u8) << 2) | ((set2[2][idx2] as u8) << 4) | (jb & 0xc0);
            scramble[i][j as usize] = scrambled;
        }
    }

    let mut sectors: [i32; 21] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
    if have_key {
        permute(&mut key, &mut sectors[0..17]);
    }

    let mut ctx = Ctx {
        previous1: initial_buffer_store_value,
        ..Default::default()
    };

    let total_size = file_size + 2;
    let mut done = false;
    let mut block_index: i64 = 0;
    let mut total_blocks: u32 = 0;
    let mut filepos: i64 = 2;
    let mut last_track_written = track;

    while !done {
        if track < 1 || track > variant.total_tracks() {
            return Err(ErrorKind::DiskFull.into());
        }

        let sectors_on_track = variant.sectors(track);
        let next_track_pos = filepos + sectors_on_track as i64 * TRANSWARP_BLOCK_SIZE as i64;
        if next_track_pos >= total_size {
            let mut sector = 0i64;
            for s in 0..sectors_on_track as usize {
                sectors[s] = sector as i32;
                if filepos + (sector + 1) * TRANSWARP_BLOCK_SIZE as i64 >= total_size {
                    sector = 0;
                } else {
                    sector += 1;
                }
            }
        }

        let next_track_block_index = block_index + sectors_on_track as i64;
        let trackpos = filepos;
        let trackctx = ctx;

        for sector in 0..sectors_on_track {
            if !bam::is_free(image, track, sector, 0, 0) {
                return Err(ErrorKind::TranswarpEncodeError(-5).into());
            }

            let mut last_block = false;
            let mut pos = trackpos + sectors[sector as usize] as i64 * TRANSWARP_BLOCK_SIZE as i64;
            if pos + TRANSWARP_BLOCK_SIZE as i64 >= total_size {
                pos = total_size - TRANSWARP_BLOCK_SIZE as i64;
                last_block = true;
            }

            let mut encoded = [0u8; 325];
            let mut previous_byte = ((block_index + sectors[sector as usize] as i64) & 0xff) as u8;
            previous_byte ^= initial_block_recvaccu_value;
            ctx.previous = previous_byte;
            ctx.previous2 = initial_buffer_recvaccu_value;

            encode_transwarp_block(&scramble, &gcr_to_nibble, &mut ctx, &filedata, pos as usize, &mut encoded)?;

            let (block_ok, _checksum, decoded) = decode_gcr_block(&gcr_to_nibble, &encoded);
            if !block_ok {
                return Err(ErrorKind::TranswarpEncodeError(-7).into());
            }

            image.block_mut(track, sector).copy_from_slice(&decoded);
            total_blocks += 1;

            if last_block {
                ctx = trackctx;
                done = true;
            }

            bam::mark(image, track, sector, false);
        }

        filepos = next_track_pos;
        block_index = next_track_block_index;
        last_track_written = track;

        if track >= variant.dir_track() {
            track += 1;
        } else {
            track -= 1;
        }
    }

    job.last_track = last_track_written;

    let loc = job.dir_location;
    let off = directory::entry_offset(variant, loc);

    image.set_byte(off + FILE_TRACK_OFFSET, 0);
    image.set_byte(off + FILE_SECTOR_OFFSET, 0);
    image.set_byte(off + TRANSWARP_SIG_LO_OFFSET, TRANSWARP_SIGNATURE_LO);
    image.set_byte(off + TRANSWARP_SIG_HI_OFFSET, TRANSWARP_SIGNATURE_HI);
    image.set_byte(off + TRANSWARP_TRACK_OFFSET, job.track as u8);
    image.set_byte(off + FILE_BLOCKS_LO_OFFSET, total_blocks as u8);

    let load_address = (filedata[1] as u32) << 8 | filedata[0] as u32;
    image.set_byte(off + LOAD_ADDRESS_LO_OFFSET, load_address as u8);
    image.set_byte(off + LOAD_ADDRESS_HI_OFFSET, (load_address >> 8) as u8);
    let end_address = load_address as i64 + total_size - 2;
    image.set_byte(off + END_ADDRESS_LO_OFFSET, end_address as u8);
    image.set_byte(off + END_ADDRESS_HI_OFFSET, (end_address >> 8) as u8);

    let mut file_checksum = 0xffu8;
    for &b in &filedata[2..total_size as usize] {
        file_checksum ^= b;
        file_checksum = crc8(file_checksum);
    }
    image.set_byte(off + FILE_CHECKSUM_OFFSET, file_checksum);

    image.set_byte(off + DIRDATA_CHECKSUM_OFFSET, 0);
    image.set_byte(off + DIRDATA_CHECKSUM_OFFSET, (0x100 - transwarp_dirdata_checksum(image, off) as i32) as u8);
    let mut dirdata_checksum = transwarp_dirdata_checksum(image, off);
    if dirdata_checksum != 0 {
        if dirdata_checksum == 1 {
            let cur = image.byte(off + DIRDATA_CHECKSUM_OFFSET);
            image.set_byte(off + DIRDATA_CHECKSUM_OFFSET, cur.wrapping_sub(1));
        }
        dirdata_checksum = transwarp_dirdata_checksum(image, off);
        if dirdata_checksum != 0 {
            return Err(ErrorKind::TranswarpEncodeError(-8).into());
        }
    }

    let mut key0 = dirdata_key;
    if have_key {
        for offset in DIRDATA_CHECKSUM_OFFSET..=FILE_BLOCKS_LO_OFFSET {
            let cur = image.byte(off + offset);
            image.set_byte(off + offset, cur ^ (key0 as u8));
            key0 >>= 8;
        }
        job.nr_sectors = image.byte(off + FILE_BLOCKS_LO_OFFSET) as u16;
    } else {
        job.nr_sectors = total_blocks as u16;
    }

    let shown = job.blocks_shown.unwrap_or(job.nr_sectors);
    image.set_byte(off + FILE_BLOCKS_LO_OFFSET, (shown & 0xff) as u8);
    image.set_byte(off + FILE_BLOCKS_HI_OFFSET, (shown >> 8) as u8);

    if config.shadow_dir_track > 0 {
        let shadow_loc = EntryLocation {
            track: config.shadow_dir_track as u32,
            sector: loc.sector,
            offset: loc.offset,
        };
        let shadow_off = directory::entry_offset(variant, shadow_loc);
        image.set_byte(shadow_off + FILE_TRACK_OFFSET, 0);
        image.set_byte(shadow_off + FILE_SECTOR_OFFSET, 0);
        image.set_byte(shadow_off + TRANSWARP_SIG_LO_OFFSET, TRANSWARP_SIGNATURE_LO);
        image.set_byte(shadow_off + TRANSWARP_SIG_HI_OFFSET, TRANSWARP_SIGNATURE_HI);
        image.set_byte(shadow_off + TRANSWARP_TRACK_OFFSET, job.track as u8);
        image.set_byte(shadow_off + LOAD_ADDRESS_LO_OFFSET, load_address as u8);
        image.set_byte(shadow_off + LOAD_ADDRESS_HI_OFFSET, (load_address >> 8) as u8);
        image.set_byte(shadow_off + END_ADDRESS_LO_OFFSET, end_address as u8);
        image.set_byte(shadow_off + END_ADDRESS_HI_OFFSET, (end_address >> 8) as u8);
        image.set_byte(shadow_off + FILE_CHECKSUM_OFFSET, file_checksum);
        image.set_byte(shadow_off + FILE_BLOCKS_LO_OFFSET, (job.nr_sectors & 0xff) as u8);
        image.set_byte(shadow_off + FILE_BLOCKS_HI_OFFSET, (job.nr_sectors >> 8) as u8);
    }

    job.track = 0;
    job.sector = 0;

    Ok(())
}

fn is_transwarp_entry(image: &Image, off: usize) -> bool {
    image.byte(off + TRANSWARP_SIG_LO_OFFSET) == TRANSWARP_SIGNATURE_LO
        && image.byte(off + TRANSWARP_SIG_HI_OFFSET) == TRANSWARP_SIGNATURE_HI
        && transwarp_dirdata_checksum(image, off) == 0
}

const TRANSWARP_BOOTFILE_NAME: &[u8] = b"TRANSWARP";

/// Point every Transwarp job's directory entry at the Transwarp
/// bootfile's real track/sector, which `write_transwarp_file` left
/// zeroed. The bootfile is the first in-use, non-Transwarp-encoded
/// entry in the directory whose name starts with `TRANSWARP`. Must run
/// after every file (including the bootfile itself) has been written.
pub fn resolve_bootfile_pointers(image: &mut Image, jobs: &mut [FileJob]) -> Result<(), Error> {
    if !jobs.iter().any(|j| j.file_type == crate::model::FileType::Transwarp) {
        return Ok(());
    }

    let variant = image.variant();
    let mut boot_track = 0u32;
    let mut boot_sector = 0u32;
    for loc in directory::walk(image) {
        let off = directory::entry_offset(variant, loc);
        let file_type = image.byte(off + 2) & 0xf;
        if file_type == 0 {
            continue;
        }
        if is_transwarp_entry(image, off) {
            continue;
        }
        let name = image.slice(off + 5, 16);
        if !name.starts_with(TRANSWARP_BOOTFILE_NAME) {
            continue;
        }
        let file_track = image.byte(off + FILE_TRACK_OFFSET) as u32;
        let file_sector = image.byte(off + FILE_SECTOR_OFFSET) as u32;
        if file_track == 0 {
            continue;
        }
        boot_track = file_track;
        boot_sector = file_sector;
        break;
    }

    if boot_track == 0 {
        return Err(ErrorKind::Message("no Transwarp bootfile provided".to_string()).into());
    }

    for job in jobs.iter() {
        if job.file_type != crate::model::FileType::Transwarp {
            continue;
        }
        let off = directory::entry_offset(variant, job.dir_location);
        image.set_byte(off + FILE_TRACK_OFFSET, boot_track as u8);
        image.set_byte(off + FILE_SECTOR_OFFSET, boot_sector as u8);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset;
    use crate::config::EngineConfig;
    use crate::geometry::Variant;
    use crate::model::{FileJob, FileType};
    use pretty_assertions::assert_eq;

    fn fresh_image(variant: Variant) -> Image {
        let mut img = Image::new(variant);
        for t in 1..=variant.total_tracks() {
            for s in 0..variant.sectors(t) {
                bam::mark(&mut img, t, s, true);
            }
        }
        img
    }

    #[test]
    fn gcr_round_trips_through_nibble_table() {
        let map = generate_gcr_decoding_table();
        let encoded = encode_4_bytes_gcr([0x12, 0x34, 0x56, 0x78]);
        let (ok, decoded) = decode_5_bytes_gcr(&map, &encoded);
        assert!(ok);
        assert_eq!(decoded, [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn crc8_is_deterministic() {
        assert_eq!(crc8(0), crc8(0));
        assert_ne!(crc8(1), crc8(2));
    }

    #[test]
    fn writes_transwarp_file_without_key() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();

        let name: [u8; 16] = charset::ascii_to_petscii_padded(b"TRANSWARP", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = FileJob::new(name, FileType::Transwarp);
        job.dir_index = index;
        job.dir_location = loc;
        job.is_transwarp_bootfile = true;

        let mut data = vec![0x01u8, 0x08];
        data.extend(std::iter::repeat(0xAAu8).take(400));

        write_transwarp_file(&mut img, &mut job, &data, &config, 18, 0).unwrap();

        assert!(job.nr_sectors > 0);
        let off = directory::entry_offset(Variant::D64, loc);
        assert_eq!(img.byte(off + TRANSWARP_SIG_LO_OFFSET), b'T');
        assert_eq!(img.byte(off + TRANSWARP_SIG_HI_OFFSET), b'W');
    }

    #[test]
    fn writes_transwarp_file_with_key() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();

        let name: [u8; 16] = charset::ascii_to_petscii_padded(b"KEYED", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = FileJob::new(name, FileType::Transwarp);
        job.dir_index = index;
        job.dir_location = loc;
        job.transwarp_key = Some([0x42; TRANSWARP_KEY_SIZE]);

        let mut data = vec![0x00u8, 0x10];
        data.extend(std::iter::repeat(0x55u8).take(300));

        write_transwarp_file(&mut img, &mut job, &data, &config, 18, 0).unwrap();
        assert!(job.nr_sectors > 0);
    }

    #[test]
    fn resolves_pointers_to_plain_bootfile() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();

        let boot_name: [u8; 16] = charset::ascii_to_petscii_padded(b"TRANSWARP", 16).try_into().unwrap();
        let placed = directory::place_entry(&mut img, &boot_name, directory::FILE_TYPE_PRG, false, false, config.dir_sector_interleave, 0).unwrap();
        bam::mark(&mut img, 1, 0, false);
        directory::set_file_location(&mut img, placed.location, 1, 0, 1);

        let payload_name: [u8; 16] = charset::ascii_to_petscii_padded(b"PAYLOAD", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = FileJob::new(payload_name, FileType::Transwarp);
        job.dir_index = index;
        job.dir_location = loc;
        let mut data = vec![0x01u8, 0x08];
        data.extend(std::iter::repeat(0xAAu8).take(200));
        write_transwarp_file(&mut img, &mut job, &data, &config, 18, 0).unwrap();

        let mut jobs = vec![job];
        resolve_bootfile_pointers(&mut img, &mut jobs).unwrap();

        let off = directory::entry_offset(Variant::D64, loc);
        assert_eq!(img.byte(off + FILE_TRACK_OFFSET), 1);
        assert_eq!(img.byte(off + FILE_SECTOR_OFFSET), 0);
    }

    #[test]
    fn missing_bootfile_is_an_error() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();
        let payload_name: [u8; 16] = charset::ascii_to_petscii_padded(b"PAYLOAD", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = FileJob::new(payload_name, FileType::Transwarp);
        job.dir_index = index;
        job.dir_location = loc;
        let mut data = vec![0x01u8, 0x08];
        data.extend(std::iter::repeat(0xAAu8).take(200));
        write_transwarp_file(&mut img, &mut job, &data, &config, 18, 0).unwrap();

        let mut jobs = vec![job];
        assert!(resolve_bootfile_pointers(&mut img, &mut jobs).is_err());
    }
}
