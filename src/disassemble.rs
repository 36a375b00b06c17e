//! Disassembly of tracee code.
//!
//! Reads code through [`Process::read_memory_without_traps`], so listings
//! show the program as written even where software breakpoints have patched
//! `int 3` over the first byte of an instruction.

use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};
use serde::Serialize;

use crate::addr::VirtAddr;
use crate::errors::Result;
use crate::process::Process;

const CODE_BITNESS: u32 = 64;

/// The longest x86 instruction encoding; reading this much per requested
/// instruction always suffices.
const MAX_INSTRUCTION_BYTES: usize = 15;

/// One decoded instruction.
#[derive(Debug, Clone, Serialize)]
pub struct Instruction {
    pub address: VirtAddr,
    pub text: String,
}

/// Decodes and formats tracee instructions.
pub struct Disassembler<'proc> {
    process: &'proc Process,
}

impl<'proc> Disassembler<'proc> {
    pub fn new(process: &'proc Process) -> Self {
        Disassembler { process }
    }

    /// Disassembles `n_instructions` starting at `address`, defaulting to
    /// the current program counter.
    pub fn disassemble(
        &self,
        n_instructions: usize,
        address: Option<VirtAddr>,
    ) -> Result<Vec<Instruction>> {
        let address = match address {
            Some(address) => address,
            None => self.process.get_pc()?,
        };

        let code = self
            .process
            .read_memory_without_traps(address, n_instructions * MAX_INSTRUCTION_BYTES)?;

        let mut decoder = Decoder::with_ip(CODE_BITNESS, &code, address.addr(), DecoderOptions::NONE);
        let mut formatter = NasmFormatter::new();
        formatter.options_mut().set_first_operand_char_index(8);
        formatter.options_mut().set_hex_prefix("0x");
        formatter.options_mut().set_hex_suffix("");

        let mut instructions = Vec::with_capacity(n_instructions);
        for _ in 0..n_instructions {
            if !decoder.can_decode() {
                break;
            }
            let instruction = decoder.decode();
            let mut text = String::new();
            formatter.format(&instruction, &mut text);
            instructions.push(Instruction {
                address: VirtAddr::new(instruction.ip()),
                text,
            });
        }

        Ok(instructions)
    }
}
