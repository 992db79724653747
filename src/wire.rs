//! Register-level wire codec for the charger's Modbus map
//!
//! Pure encode/decode helpers over raw 16-bit register slices: big-endian
//! 32- and 64-bit floats split across consecutive registers, and ASCII
//! strings packed two characters per register. Every function here is
//! total — malformed input becomes zero or an empty string, never an
//! error, since the codec has no I/O of its own.

/// Decode a big-endian 32-bit float from two registers (high word first).
/// NaN collapses to 0.0, matching how the charger represents "no value".
pub fn decode_f32(regs: &[u16]) -> f32 {
    if regs.len() < 2 {
        return 0.0;
    }
    let bytes = [
        (regs[0] >> 8) as u8,
        (regs[0] & 0xFF) as u8,
        (regs[1] >> 8) as u8,
        (regs[1] & 0xFF) as u8,
    ];
    let value = f32::from_be_bytes(bytes);
    if value.is_nan() { 0.0 } else { value }
}

/// Decode a big-endian 64-bit float from four registers (high word first).
pub fn decode_f64(regs: &[u16]) -> f64 {
    if regs.len() < 4 {
        return 0.0;
    }
    let bytes = [
        (regs[0] >> 8) as u8,
        (regs[0] & 0xFF) as u8,
        (regs[1] >> 8) as u8,
        (regs[1] & 0xFF) as u8,
        (regs[2] >> 8) as u8,
        (regs[2] & 0xFF) as u8,
        (regs[3] >> 8) as u8,
        (regs[3] & 0xFF) as u8,
    ];
    let value = f64::from_be_bytes(bytes);
    if value.is_nan() { 0.0 } else { value }
}

/// Decode `n` consecutive big-endian 32-bit floats.
pub fn decode_f32_array(regs: &[u16], n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let start = i * 2;
            if start + 2 <= regs.len() {
                decode_f32(&regs[start..start + 2])
            } else {
                0.0
            }
        })
        .collect()
}

/// Encode a 32-bit float as two big-endian registers (high word first).
pub fn encode_f32(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        ((bytes[0] as u16) << 8) | (bytes[1] as u16),
        ((bytes[2] as u16) << 8) | (bytes[3] as u16),
    ]
}

/// Decode an ASCII string packed two characters per register (high byte
/// first). Trailing NUL bytes and whitespace are trimmed; any byte outside
/// printable ASCII is dropped rather than surfaced as an error.
pub fn decode_ascii(regs: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    for &reg in regs {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0xFF) as u8);
    }
    bytes
        .into_iter()
        .filter(|b| b.is_ascii_graphic() || *b == b' ')
        .collect::<Vec<u8>>()
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}
