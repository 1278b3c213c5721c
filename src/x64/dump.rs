// This module renders freshly emitted machine code into the trace log using
// the iced-x86 decoder with the Intel formatter. It is only exercised when
// trace logging is enabled, and by the tests that cross-check the hand-
// written encoder against an independent disassembler.

//! Disassembly of emitted code for trace logging.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

/// Disassemble a byte slice as x86-64 code at the given address, one
/// formatted instruction per line.
pub fn disassemble(bytes: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let mut text = String::new();
        formatter.format(&instruction, &mut text);
        lines.push(format!("{:#x}  {}", instruction.ip(), text));
    }
    lines
}

/// Trace-log the instructions in `[start, end)`.
///
/// The range must be emitted code owned by the calling generator; the
/// builder only calls this for a block it just finished.
pub(crate) fn trace_range(start: usize, end: usize) {
    let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, end - start) };
    for line in disassemble(bytes, start as u64) {
        log::trace!("{}", line);
    }
}
