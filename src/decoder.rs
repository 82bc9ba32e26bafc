use crate::opcodes::{Opcode, get_opcode};

#[derive(Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub offset: usize,
    pub argument: Option<Vec<u8>>,
}

/// Decoded instruction stream plus the jump table. Only offsets present in
/// the jump table are legal JUMP/JUMPI targets, which keeps PUSH data
/// regions unreachable.
#[derive(Debug, Default)]
pub struct Bytecode {
    pub bytes: Vec<u8>,
    pub instructions: Vec<Instruction>,
    jumptable: Vec<(usize, usize)>,
}

impl Bytecode {
    /// Map a byte offset to an instruction index, `None` unless the offset
    /// holds a JUMPDEST.
    pub fn resolve_jump(&self, offset: usize) -> Option<usize> {
        let index = self
            .jumptable
            .binary_search_by_key(&offset, |(key, _)| *key)
            .ok()?;
        Some(self.jumptable[index].1)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub struct Decoder;

impl Decoder {
    pub fn decode(code: Vec<u8>) -> Bytecode {
        let mut instructions = Vec::new();
        let mut jumptable = Vec::new();

        let mut pos = 0;
        while pos < code.len() {
            let opcode = get_opcode(code[pos]);
            let mut instruction = Instruction {
                opcode,
                offset: pos,
                argument: None,
            };

            // JUMPDEST
            if opcode.code == 0x5b {
                jumptable.push((pos, instructions.len()));
            }

            pos += 1;

            let push_bytes = opcode.push_width();
            if push_bytes > 0 {
                let end = pos + push_bytes;
                // bytes past the end of code read as zero
                let mut argument = vec![0u8; push_bytes];
                let available = code.len().min(end) - pos;
                argument[..available].copy_from_slice(&code[pos..pos + available]);
                instruction.argument = Some(argument);
                pos = end;
            }

            instructions.push(instruction);
        }

        Bytecode {
            bytes: code,
            instructions,
            jumptable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_push() {
        // PUSH2 0xbeef PUSH1 0x01 ADD
        let code = Decoder::decode(vec![0x61, 0xbe, 0xef, 0x60, 0x01, 0x01]);
        assert_eq!(code.instructions.len(), 3);
        assert_eq!(
            code.instructions[0].argument.as_deref(),
            Some(&[0xbe, 0xef][..])
        );
        assert_eq!(code.instructions[1].offset, 3);
        assert_eq!(code.instructions[2].offset, 5);
    }

    #[test]
    fn test_truncated_push_pads_with_zeros() {
        let code = Decoder::decode(vec![0x61, 0xbe]);
        assert_eq!(
            code.instructions[0].argument.as_deref(),
            Some(&[0xbe, 0x00][..])
        );
    }

    #[test]
    fn test_jumpdest_inside_push_is_not_a_target() {
        // PUSH2 0x5b5b JUMPDEST
        let code = Decoder::decode(vec![0x61, 0x5b, 0x5b, 0x5b]);
        assert_eq!(code.resolve_jump(1), None);
        assert_eq!(code.resolve_jump(2), None);
        // instruction index 1 is the real JUMPDEST at byte offset 3
        assert_eq!(code.resolve_jump(3), Some(1));
    }
}
