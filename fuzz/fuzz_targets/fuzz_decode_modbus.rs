#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let mut regs = Vec::new();
    let mut it = data.chunks_exact(2);
    for b in &mut it {
        regs.push(u16::from_be_bytes([b[0], b[1]]));
    }

    // Exercise the decoders under varying lengths
    let _ = evgate::wire::decode_f32(&regs);
    let _ = evgate::wire::decode_f64(&regs);
    let _ = evgate::wire::decode_f32_array(&regs, 4);
    let _ = evgate::wire::decode_ascii(&regs);
});