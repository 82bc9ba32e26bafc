use i256::I256;
use thiserror::Error;

use crate::{
    common::{
        address::Address,
        call::Call,
        hash::{Hash, keccak256},
        tx::Log,
        word::Word,
    },
    decoder::{Bytecode, Decoder},
    gas::{self, Gas},
    state::{Overlay, StateError},
};

const STACK_LIMIT: usize = 1024;

const CALL_DEPTH_LIMIT: usize = 1024;

/// Infrastructure failure: aborts the whole execution, not just a frame.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{0}")]
    State(#[from] StateError),
}

/// Frame-local failure: the frame halts, its remaining gas burns, and the
/// caller observes a zero push with empty return data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Out of gas")]
    OutOfGas,
    #[error("Stack overflow")]
    StackOverflow,
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("Invalid jump")]
    InvalidJump,
    #[error("Write protection")]
    WriteProtection,
    #[error("Call depth exceeded")]
    CallDepthExceeded,
    #[error("Missing data")]
    MissingData,
}

enum StepError {
    Fault(Fault),
    Fatal(StateError),
}

impl From<Fault> for StepError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl From<StateError> for StepError {
    fn from(e: StateError) -> Self {
        Self::Fatal(e)
    }
}

/// Block-level context for the env/block opcode families.
#[derive(Clone, Debug, Default)]
pub struct BlockEnv {
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub chain_id: u64,
    pub coinbase: Address,
    pub parent_hash: Hash,
    pub gas_price: Word,
}

/// Per-frame machine state.
#[derive(Debug, Default)]
pub struct Evm {
    pub stack: Vec<Word>,
    pub memory: Vec<u8>,
    pub pc: usize,
    pub gas: Gas,
    /// Return-data buffer from the most recent completed sub-call.
    pub ret: Vec<u8>,
}

impl Evm {
    fn push(&mut self, value: Word) -> Result<(), Fault> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(Fault::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Word, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    /// Charge for and perform memory growth covering `[offset, offset+len)`.
    /// A zero-length range touches nothing and costs nothing.
    fn mem_range(&mut self, offset: Word, len: Word) -> Result<(usize, usize), Fault> {
        if len.is_zero() {
            return Ok((0, 0));
        }
        if !offset.fits_usize() || !len.fits_usize() {
            return Err(Fault::OutOfGas);
        }
        let (offset, len) = (offset.as_usize(), len.as_usize());
        let end = offset as u128 + len as u128;
        if end > u64::MAX as u128 {
            return Err(Fault::OutOfGas);
        }
        let charge = gas::memory_expansion(self.memory.len(), end as u64);
        if !self.gas.try_consume(charge) {
            return Err(Fault::OutOfGas);
        }
        let aligned = (end as u64).div_ceil(32) * 32;
        if aligned as usize > self.memory.len() {
            self.memory.resize(aligned as usize, 0);
        }
        Ok((offset, len))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameKind {
    Call { ret_offset: usize, ret_len: usize },
    Create,
}

struct Frame {
    evm: Evm,
    code: Bytecode,
    input: Vec<u8>,
    /// Account whose storage, balance and logs this frame touches.
    address: Address,
    caller: Address,
    value: Word,
    is_static: bool,
    kind: FrameKind,
    /// Target account of a create frame.
    created: Option<Address>,
}

enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    Create { salt: Option<Word> },
}

struct Enter {
    kind: CallKind,
    to: Address,
    value: Word,
    gas: u64,
    input: Vec<u8>,
    ret_offset: usize,
    ret_len: usize,
}

enum Step {
    Continue,
    Enter(Box<Enter>),
    Exit(Halt),
}

enum Halt {
    Stop,
    Return(Vec<u8>),
    Revert(Vec<u8>),
}

/// Result of one top-level call or create.
#[derive(Debug, Default)]
pub struct Outcome {
    pub success: bool,
    /// The frame executed REVERT (as opposed to a fault); `ret` carries its
    /// payload and unused gas was returned.
    pub reverted: bool,
    pub ret: Vec<u8>,
    pub gas_used: u64,
    pub gas_left: u64,
    pub created: Option<Address>,
    pub fault: Option<Fault>,
}

/// Executes decoded bytecode against an overlay. Sub-calls are an explicit
/// frame stack driven by one loop, so depth limits are a bounds check and
/// the host stack stays flat.
pub struct Executor<'e> {
    env: &'e BlockEnv,
    origin: Address,
    frames: Vec<Frame>,
}

impl<'e> Executor<'e> {
    pub fn new(env: &'e BlockEnv, origin: Address) -> Self {
        Self {
            env,
            origin,
            frames: Vec::new(),
        }
    }

    /// Run a message call against `call.to`. The value transfer and all
    /// state effects land in a dedicated overlay checkpoint, committed on
    /// success and reverted otherwise.
    pub fn call(mut self, overlay: &mut Overlay, call: &Call) -> Result<Outcome, ExecutorError> {
        overlay.checkpoint();
        if !overlay.transfer(&call.from, &call.to, call.value)? {
            overlay.revert();
            return Ok(Outcome {
                gas_left: call.gas,
                ..Default::default()
            });
        }
        let code = Decoder::decode(overlay.code(&call.to)?);
        if code.is_empty() {
            overlay.commit();
            return Ok(Outcome {
                success: true,
                gas_left: call.gas,
                ..Default::default()
            });
        }
        self.frames.push(Frame {
            evm: Evm {
                gas: Gas::new(call.gas),
                ..Default::default()
            },
            code,
            input: call.data.clone(),
            address: call.to,
            caller: call.from,
            value: call.value,
            is_static: false,
            kind: FrameKind::Call {
                ret_offset: 0,
                ret_len: 0,
            },
            created: None,
        });
        self.run(overlay)
    }

    /// Run initcode for a contract created at `address` (derived by the
    /// caller from sender and nonce, or salt). The deployed code is the
    /// frame's return buffer, charged per byte.
    pub fn create(
        mut self,
        overlay: &mut Overlay,
        call: &Call,
        address: Address,
    ) -> Result<Outcome, ExecutorError> {
        let target = overlay.account(&address)?;
        if target.has_code() || target.nonce > 0 {
            // address collision burns the provided gas
            return Ok(Outcome {
                created: Some(address),
                gas_used: call.gas,
                ..Default::default()
            });
        }
        overlay.checkpoint();
        overlay.set_nonce(&address, 1)?;
        if !overlay.transfer(&call.from, &address, call.value)? {
            overlay.revert();
            return Ok(Outcome {
                created: Some(address),
                gas_left: call.gas,
                ..Default::default()
            });
        }
        self.frames.push(Frame {
            evm: Evm {
                gas: Gas::new(call.gas),
                ..Default::default()
            },
            code: Decoder::decode(call.data.clone()),
            input: Vec::new(),
            address,
            caller: call.from,
            value: call.value,
            is_static: false,
            kind: FrameKind::Create,
            created: Some(address),
        });
        self.run(overlay)
    }

    fn run(&mut self, overlay: &mut Overlay) -> Result<Outcome, ExecutorError> {
        loop {
            match self.step(overlay) {
                Ok(Step::Continue) => {}
                Ok(Step::Enter(enter)) => self.enter(overlay, *enter)?,
                Ok(Step::Exit(halt)) => {
                    if let Some(outcome) = self.exit(overlay, halt)? {
                        return Ok(outcome);
                    }
                }
                Err(StepError::Fatal(e)) => return Err(e.into()),
                Err(StepError::Fault(fault)) => {
                    if let Some(outcome) = self.fail(overlay, fault)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Execute one instruction of the innermost frame.
    fn step(&mut self, overlay: &mut Overlay) -> Result<Step, StepError> {
        let origin = self.origin;
        let frame = self.frames.last_mut().expect("an active frame");

        let Some(instruction) = frame.code.instructions.get(frame.evm.pc) else {
            // running off the end of code is an implicit STOP
            return Ok(Step::Exit(Halt::Stop));
        };
        let opcode = instruction.opcode;
        if !opcode.is_defined() {
            return Err(Fault::InvalidOpcode(frame.code.bytes[instruction.offset]).into());
        }
        if !frame.evm.gas.try_consume(opcode.gas) {
            return Err(Fault::OutOfGas.into());
        }

        let mut pc_increment = true;
        let mut action = Step::Continue;

        match opcode.code {
            // 0x00: STOP
            0x00 => {
                return Ok(Step::Exit(Halt::Stop));
            }

            // 0x01..0x0b: Arithmetic Operations
            0x01 => {
                // ADD
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let (res, _) = a.overflowing_add(b);
                frame.evm.push(res)?;
            }
            0x02 => {
                // MUL
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let (res, _) = a.overflowing_mul(b);
                frame.evm.push(res)?;
            }
            0x03 => {
                // SUB
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let (res, _) = a.overflowing_sub(b);
                frame.evm.push(res)?;
            }
            0x04 => {
                // DIV
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                if b.is_zero() {
                    frame.evm.push(Word::zero())?;
                } else {
                    frame.evm.push(a / b)?;
                }
            }
            0x05 => {
                // SDIV
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let a_signed = I256::from_be_bytes(a.into_bytes());
                let b_signed = I256::from_be_bytes(b.into_bytes());
                let res = if b.is_zero() {
                    I256::from(0)
                } else if a_signed == I256::MIN && b_signed == I256::from(-1) {
                    I256::MIN
                } else {
                    a_signed / b_signed
                };
                frame.evm.push(Word::from_bytes(&res.to_be_bytes()))?;
            }
            0x06 => {
                // MOD
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                if b.is_zero() {
                    frame.evm.push(Word::zero())?;
                } else {
                    frame.evm.push(a % b)?;
                }
            }
            0x07 => {
                // SMOD
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let a_signed = I256::from_be_bytes(a.into_bytes());
                let b_signed = I256::from_be_bytes(b.into_bytes());
                let res = if b.is_zero() {
                    I256::from(0)
                } else {
                    a_signed % b_signed
                };
                frame.evm.push(Word::from_bytes(&res.to_be_bytes()))?;
            }
            0x08 => {
                // ADDMOD
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let modulo = frame.evm.pop()?;
                frame.evm.push(a.add_modulo(&b, &modulo))?;
            }
            0x09 => {
                // MULMOD
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let modulo = frame.evm.pop()?;
                frame.evm.push(a.mul_modulo(&b, &modulo))?;
            }
            0x0a => {
                // EXP
                let base = frame.evm.pop()?;
                let exponent = frame.evm.pop()?;
                if !frame.evm.gas.try_consume(gas::exp_gas(exponent.bits())) {
                    return Err(Fault::OutOfGas.into());
                }
                frame.evm.push(base.pow(exponent))?;
            }
            0x0b => {
                // SIGNEXTEND
                let b = frame.evm.pop()?;
                let x = frame.evm.pop()?;
                let res = if b < Word::from(31u64) {
                    let sign_bit = b.as_usize() * 8 + 7;
                    let mask = (Word::one() << (sign_bit + 1)) - Word::one();
                    if x.bit(sign_bit) { x | !mask } else { x & mask }
                } else {
                    x
                };
                frame.evm.push(res)?;
            }

            // 0x10s: Comparison & Bitwise Logic
            0x10 => {
                // LT
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame
                    .evm
                    .push(if a < b { Word::one() } else { Word::zero() })?;
            }
            0x11 => {
                // GT
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame
                    .evm
                    .push(if a > b { Word::one() } else { Word::zero() })?;
            }
            0x12 => {
                // SLT
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let a_signed = I256::from_be_bytes(a.into_bytes());
                let b_signed = I256::from_be_bytes(b.into_bytes());
                frame.evm.push(if a_signed < b_signed {
                    Word::one()
                } else {
                    Word::zero()
                })?;
            }
            0x13 => {
                // SGT
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                let a_signed = I256::from_be_bytes(a.into_bytes());
                let b_signed = I256::from_be_bytes(b.into_bytes());
                frame.evm.push(if a_signed > b_signed {
                    Word::one()
                } else {
                    Word::zero()
                })?;
            }
            0x14 => {
                // EQ
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame
                    .evm
                    .push(if a == b { Word::one() } else { Word::zero() })?;
            }
            0x15 => {
                // ISZERO
                let a = frame.evm.pop()?;
                frame.evm.push(if a.is_zero() {
                    Word::one()
                } else {
                    Word::zero()
                })?;
            }
            0x16 => {
                // AND
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame.evm.push(a & b)?;
            }
            0x17 => {
                // OR
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame.evm.push(a | b)?;
            }
            0x18 => {
                // XOR
                let a = frame.evm.pop()?;
                let b = frame.evm.pop()?;
                frame.evm.push(a ^ b)?;
            }
            0x19 => {
                // NOT
                let a = frame.evm.pop()?;
                frame.evm.push(!a)?;
            }
            0x1a => {
                // BYTE
                let index = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                if index < Word::from(32u64) {
                    frame.evm.push(Word::from(value.byte(index.as_usize())))?;
                } else {
                    frame.evm.push(Word::zero())?;
                }
            }
            0x1b => {
                // SHL
                let shift = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let res = if shift >= Word::from(256u64) {
                    Word::zero()
                } else {
                    value << shift.as_usize()
                };
                frame.evm.push(res)?;
            }
            0x1c => {
                // SHR
                let shift = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let res = if shift >= Word::from(256u64) {
                    Word::zero()
                } else {
                    value >> shift.as_usize()
                };
                frame.evm.push(res)?;
            }
            0x1d => {
                // SAR
                let shift = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let negative = value.bit(255);
                let res = if shift >= Word::from(256u64) {
                    if negative { Word::max() } else { Word::zero() }
                } else {
                    let shift = shift.as_usize();
                    let logical = value >> shift;
                    if negative && shift > 0 {
                        logical | !(Word::max() >> shift)
                    } else {
                        logical
                    }
                };
                frame.evm.push(res)?;
            }

            0x20 => {
                // SHA3
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                let (offset, len) = frame.evm.mem_range(offset, len)?;
                if !frame.evm.gas.try_consume(gas::sha3_gas(len)) {
                    return Err(Fault::OutOfGas.into());
                }
                let hash = keccak256(&frame.evm.memory[offset..offset + len]);
                frame.evm.push(Word::from_bytes(&hash.0))?;
            }

            // 0x30s: Environmental Information
            0x30 => {
                // ADDRESS
                let address = frame.address;
                frame.evm.push(address.as_word())?;
            }
            0x31 => {
                // BALANCE
                let address = Address::from(&frame.evm.pop()?);
                let balance = overlay.balance(&address)?;
                frame.evm.push(balance)?;
            }
            0x32 => {
                // ORIGIN
                frame.evm.push(origin.as_word())?;
            }
            0x33 => {
                // CALLER
                let caller = frame.caller;
                frame.evm.push(caller.as_word())?;
            }
            0x34 => {
                // CALLVALUE
                let value = frame.value;
                frame.evm.push(value)?;
            }
            0x35 => {
                // CALLDATALOAD
                let offset = frame.evm.pop()?;
                frame.evm.push(load_word(&frame.input, offset))?;
            }
            0x36 => {
                // CALLDATASIZE
                let len = frame.input.len();
                frame.evm.push(Word::from(len))?;
            }
            0x37 => {
                // CALLDATACOPY
                let dest = frame.evm.pop()?;
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                copy_padded(&mut frame.evm, &frame.input, dest, offset, len)?;
            }
            0x38 => {
                // CODESIZE
                let len = frame.code.len();
                frame.evm.push(Word::from(len))?;
            }
            0x39 => {
                // CODECOPY
                let dest = frame.evm.pop()?;
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                copy_padded(&mut frame.evm, &frame.code.bytes, dest, offset, len)?;
            }
            0x3a => {
                // GASPRICE
                frame.evm.push(self.env.gas_price)?;
            }
            0x3b => {
                // EXTCODESIZE
                let address = Address::from(&frame.evm.pop()?);
                let code = overlay.code(&address)?;
                frame.evm.push(Word::from(code.len()))?;
            }
            0x3c => {
                // EXTCODECOPY
                let address = Address::from(&frame.evm.pop()?);
                let dest = frame.evm.pop()?;
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                let code = overlay.code(&address)?;
                copy_padded(&mut frame.evm, &code, dest, offset, len)?;
            }
            0x3d => {
                // RETURNDATASIZE
                let len = frame.evm.ret.len();
                frame.evm.push(Word::from(len))?;
            }
            0x3e => {
                // RETURNDATACOPY
                let dest = frame.evm.pop()?;
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                // unlike the other copies, reading past the buffer faults
                if !offset.fits_usize() || !len.fits_usize() {
                    return Err(Fault::MissingData.into());
                }
                let end = offset.as_usize().checked_add(len.as_usize());
                match end {
                    Some(end) if end <= frame.evm.ret.len() => {}
                    _ => return Err(Fault::MissingData.into()),
                }
                let ret = std::mem::take(&mut frame.evm.ret);
                let res = copy_padded(&mut frame.evm, &ret, dest, offset, len);
                frame.evm.ret = ret;
                res?;
            }
            0x3f => {
                // EXTCODEHASH
                let address = Address::from(&frame.evm.pop()?);
                let account = overlay.account(&address)?;
                if account.is_empty() {
                    frame.evm.push(Word::zero())?;
                } else {
                    frame.evm.push(Word::from_bytes(&account.code_hash.0))?;
                }
            }

            // 0x40s: Block Information
            0x40 => {
                // BLOCKHASH: only the parent hash is answerable here
                let number = frame.evm.pop()?;
                let parent = self.env.number.wrapping_sub(1);
                if self.env.number > 0 && number == Word::from(parent) {
                    frame.evm.push(Word::from_bytes(&self.env.parent_hash.0))?;
                } else {
                    frame.evm.push(Word::zero())?;
                }
            }
            0x41 => {
                // COINBASE
                frame.evm.push(self.env.coinbase.as_word())?;
            }
            0x42 => {
                // TIMESTAMP
                frame.evm.push(Word::from(self.env.timestamp))?;
            }
            0x43 => {
                // NUMBER
                frame.evm.push(Word::from(self.env.number))?;
            }
            0x44 => {
                // DIFFICULTY
                frame.evm.push(Word::zero())?;
            }
            0x45 => {
                // GASLIMIT
                frame.evm.push(Word::from(self.env.gas_limit))?;
            }
            0x46 => {
                // CHAINID
                frame.evm.push(Word::from(self.env.chain_id))?;
            }
            0x47 => {
                // SELFBALANCE
                let address = frame.address;
                let balance = overlay.balance(&address)?;
                frame.evm.push(balance)?;
            }

            // 0x50s: Stack, Memory, Storage and Flow Operations
            0x50 => {
                // POP
                frame.evm.pop()?;
            }
            0x51 => {
                // MLOAD
                let offset = frame.evm.pop()?;
                let (offset, _) = frame.evm.mem_range(offset, Word::from(32u64))?;
                let value = Word::from_bytes(&frame.evm.memory[offset..offset + 32]);
                frame.evm.push(value)?;
            }
            0x52 => {
                // MSTORE
                let offset = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let (offset, _) = frame.evm.mem_range(offset, Word::from(32u64))?;
                frame.evm.memory[offset..offset + 32].copy_from_slice(&value.into_bytes());
            }
            0x53 => {
                // MSTORE8
                let offset = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let (offset, _) = frame.evm.mem_range(offset, Word::one())?;
                frame.evm.memory[offset] = value.byte(31);
            }
            0x54 => {
                // SLOAD
                let slot = frame.evm.pop()?;
                let value = overlay.storage(&frame.address, &slot)?;
                frame.evm.push(value)?;
            }
            0x55 => {
                // SSTORE
                if frame.is_static {
                    return Err(Fault::WriteProtection.into());
                }
                let slot = frame.evm.pop()?;
                let value = frame.evm.pop()?;
                let current = overlay.storage(&frame.address, &slot)?;
                let charge = if current.is_zero() && !value.is_zero() {
                    gas::SSTORE_SET_GAS
                } else {
                    gas::SSTORE_RESET_GAS
                };
                if !frame.evm.gas.try_consume(charge) {
                    return Err(Fault::OutOfGas.into());
                }
                if !current.is_zero() && value.is_zero() {
                    overlay.add_refund(gas::SSTORE_CLEAR_REFUND);
                }
                overlay.set_storage(&frame.address, slot, value)?;
            }
            0x56 => {
                // JUMP
                let dest = frame.evm.pop()?;
                if !dest.fits_usize() {
                    return Err(Fault::InvalidJump.into());
                }
                let dest = frame
                    .code
                    .resolve_jump(dest.as_usize())
                    .ok_or(Fault::InvalidJump)?;
                frame.evm.pc = dest;
                pc_increment = false;
            }
            0x57 => {
                // JUMPI
                let dest = frame.evm.pop()?;
                let cond = frame.evm.pop()?;
                if !cond.is_zero() {
                    if !dest.fits_usize() {
                        return Err(Fault::InvalidJump.into());
                    }
                    let dest = frame
                        .code
                        .resolve_jump(dest.as_usize())
                        .ok_or(Fault::InvalidJump)?;
                    frame.evm.pc = dest;
                    pc_increment = false;
                }
            }
            0x58 => {
                // PC
                frame.evm.push(Word::from(instruction.offset))?;
            }
            0x59 => {
                // MSIZE
                let len = frame.evm.memory.len();
                frame.evm.push(Word::from(len))?;
            }
            0x5a => {
                // GAS
                let remaining = frame.evm.gas.remaining();
                frame.evm.push(Word::from(remaining))?;
            }
            0x5b => {
                // JUMPDEST: noop, a valid destination for JUMP/JUMPI
            }
            0x5f => {
                // PUSH0
                frame.evm.push(Word::zero())?;
            }

            // 0x60..=0x7f: PUSH1 to PUSH32
            0x60..=0x7f => {
                let arg = instruction.argument.as_ref().ok_or(Fault::MissingData)?;
                frame.evm.push(Word::from_bytes(arg))?;
            }

            // 0x80..=0x8f: DUP1 to DUP16
            0x80..=0x8f => {
                let n = opcode.n as usize;
                if frame.evm.stack.len() < n {
                    return Err(Fault::StackUnderflow.into());
                }
                let value = frame.evm.stack[frame.evm.stack.len() - n];
                frame.evm.push(value)?;
            }

            // 0x90..=0x9f: SWAP1 to SWAP16
            0x90..=0x9f => {
                let n = opcode.n as usize;
                if frame.evm.stack.len() <= n {
                    return Err(Fault::StackUnderflow.into());
                }
                let top = frame.evm.stack.len();
                frame.evm.stack.swap(top - 1, top - 1 - n);
            }

            // 0xa0..=0xa4: LOG0 to LOG4
            0xa0..=0xa4 => {
                if frame.is_static {
                    return Err(Fault::WriteProtection.into());
                }
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                let mut topics = Vec::with_capacity(opcode.n as usize);
                for _ in 0..opcode.n {
                    topics.push(Hash(frame.evm.pop()?.into_bytes()));
                }
                let (offset, len) = frame.evm.mem_range(offset, len)?;
                if !frame.evm.gas.try_consume(gas::log_gas(topics.len(), len)) {
                    return Err(Fault::OutOfGas.into());
                }
                let data = frame.evm.memory[offset..offset + len].to_vec();
                overlay.log(Log::emitted(frame.address, topics, data));
            }

            // 0xf0: CREATE | 0xf5: CREATE2
            0xf0 | 0xf5 => {
                if frame.is_static {
                    return Err(Fault::WriteProtection.into());
                }
                let value = frame.evm.pop()?;
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                let salt = if opcode.code == 0xf5 {
                    Some(frame.evm.pop()?)
                } else {
                    None
                };
                let (offset, len) = frame.evm.mem_range(offset, len)?;
                if salt.is_some() && !frame.evm.gas.try_consume(gas::sha3_gas(len)) {
                    return Err(Fault::OutOfGas.into());
                }
                let initcode = frame.evm.memory[offset..offset + len].to_vec();
                let forwarded = gas::max_forwardable(frame.evm.gas.remaining());
                if !frame.evm.gas.try_consume(forwarded) {
                    return Err(Fault::OutOfGas.into());
                }
                action = Step::Enter(Box::new(Enter {
                    kind: CallKind::Create { salt },
                    to: Address::zero(),
                    value,
                    gas: forwarded,
                    input: initcode,
                    ret_offset: 0,
                    ret_len: 0,
                }));
            }

            // 0xf1: CALL | 0xf2: CALLCODE | 0xf4: DELEGATECALL | 0xfa: STATICCALL
            0xf1 | 0xf2 | 0xf4 | 0xfa => {
                let requested = frame.evm.pop()?;
                let to = Address::from(&frame.evm.pop()?);
                let value = if opcode.code == 0xf1 || opcode.code == 0xf2 {
                    frame.evm.pop()?
                } else {
                    Word::zero()
                };
                let in_offset = frame.evm.pop()?;
                let in_len = frame.evm.pop()?;
                let out_offset = frame.evm.pop()?;
                let out_len = frame.evm.pop()?;

                if opcode.code == 0xf1 && frame.is_static && !value.is_zero() {
                    return Err(Fault::WriteProtection.into());
                }

                let (in_offset, in_len) = frame.evm.mem_range(in_offset, in_len)?;
                let (out_offset, out_len) = frame.evm.mem_range(out_offset, out_len)?;
                let input = frame.evm.memory[in_offset..in_offset + in_len].to_vec();

                let mut extra = 0u64;
                if !value.is_zero() {
                    extra += gas::CALL_VALUE_GAS;
                    if opcode.code == 0xf1 && overlay.account(&to)?.is_empty() {
                        extra += gas::NEW_ACCOUNT_GAS;
                    }
                }
                if !frame.evm.gas.try_consume(extra) {
                    return Err(Fault::OutOfGas.into());
                }

                let forwarded = requested
                    .as_u64_saturating()
                    .min(gas::max_forwardable(frame.evm.gas.remaining()));
                if !frame.evm.gas.try_consume(forwarded) {
                    return Err(Fault::OutOfGas.into());
                }
                let stipend = if !value.is_zero() { gas::CALL_STIPEND } else { 0 };

                let kind = match opcode.code {
                    0xf1 => CallKind::Call,
                    0xf2 => CallKind::CallCode,
                    0xf4 => CallKind::DelegateCall,
                    _ => CallKind::StaticCall,
                };
                action = Step::Enter(Box::new(Enter {
                    kind,
                    to,
                    value,
                    gas: forwarded + stipend,
                    input,
                    ret_offset: out_offset,
                    ret_len: out_len,
                }));
            }

            0xf3 | 0xfd => {
                // RETURN | REVERT
                let offset = frame.evm.pop()?;
                let len = frame.evm.pop()?;
                let (offset, len) = frame.evm.mem_range(offset, len)?;
                let data = frame.evm.memory[offset..offset + len].to_vec();
                return Ok(Step::Exit(if opcode.code == 0xf3 {
                    Halt::Return(data)
                } else {
                    Halt::Revert(data)
                }));
            }
            0xfe => {
                // INVALID
                return Err(Fault::InvalidOpcode(0xfe).into());
            }
            0xff => {
                // SELFDESTRUCT
                if frame.is_static {
                    return Err(Fault::WriteProtection.into());
                }
                let beneficiary = Address::from(&frame.evm.pop()?);
                let address = frame.address;
                let balance = overlay.balance(&address)?;
                if beneficiary != address {
                    overlay.credit(&beneficiary, balance)?;
                }
                overlay.selfdestruct(&address)?;
                return Ok(Step::Exit(Halt::Stop));
            }

            _ => {
                return Err(Fault::InvalidOpcode(opcode.code).into());
            }
        }

        if pc_increment {
            frame.evm.pc += 1;
        }

        Ok(action)
    }

    /// Push a sub-frame for a call or create requested by the innermost
    /// frame. Immediate outcomes (depth limit, missing balance, empty
    /// callee) resolve on the parent's stack without a new frame.
    fn enter(&mut self, overlay: &mut Overlay, enter: Enter) -> Result<(), ExecutorError> {
        if self.frames.len() >= CALL_DEPTH_LIMIT {
            // the forwarded gas stays burned
            tracing::debug!(fault = %Fault::CallDepthExceeded, "refusing to enter a frame");
            self.settle_without_frame(false, 0);
            return Ok(());
        }

        let parent = self.frames.last().expect("an active frame");
        let parent_address = parent.address;
        let parent_caller = parent.caller;
        let parent_value = parent.value;
        let parent_static = parent.is_static;

        match enter.kind {
            CallKind::Create { salt } => {
                let creator = parent_address;
                let nonce = overlay.bump_nonce(&creator)?;
                let address = match salt {
                    Some(salt) => creator.create2(&salt, &enter.input),
                    None => creator.create(nonce),
                };
                let target = overlay.account(&address)?;
                if target.has_code() || target.nonce > 0 {
                    // collision: forwarded gas stays burned
                    self.settle_without_frame(false, 0);
                    return Ok(());
                }
                overlay.checkpoint();
                overlay.set_nonce(&address, 1)?;
                if !overlay.transfer(&creator, &address, enter.value)? {
                    overlay.revert();
                    self.settle_without_frame(false, enter.gas);
                    return Ok(());
                }
                self.frames.push(Frame {
                    evm: Evm {
                        gas: Gas::new(enter.gas),
                        ..Default::default()
                    },
                    code: Decoder::decode(enter.input),
                    input: Vec::new(),
                    address,
                    caller: creator,
                    value: enter.value,
                    is_static: parent_static,
                    kind: FrameKind::Create,
                    created: Some(address),
                });
            }
            CallKind::Call | CallKind::CallCode | CallKind::DelegateCall | CallKind::StaticCall => {
                let (address, caller, value, is_static) = match enter.kind {
                    CallKind::Call => (enter.to, parent_address, enter.value, parent_static),
                    CallKind::CallCode => {
                        (parent_address, parent_address, enter.value, parent_static)
                    }
                    CallKind::DelegateCall => (parent_address, parent_caller, parent_value, parent_static),
                    CallKind::StaticCall => (enter.to, parent_address, Word::zero(), true),
                    CallKind::Create { .. } => unreachable!("handled above"),
                };

                overlay.checkpoint();
                match enter.kind {
                    CallKind::Call if !enter.value.is_zero() => {
                        if !overlay.transfer(&parent_address, &enter.to, enter.value)? {
                            overlay.revert();
                            self.settle_without_frame(false, enter.gas);
                            return Ok(());
                        }
                    }
                    // CALLCODE moves nothing (caller and callee are the same
                    // account) but the balance must still cover the value
                    CallKind::CallCode if !enter.value.is_zero() => {
                        if overlay.balance(&parent_address)? < enter.value {
                            overlay.revert();
                            self.settle_without_frame(false, enter.gas);
                            return Ok(());
                        }
                    }
                    _ => {}
                }

                let code = Decoder::decode(overlay.code(&enter.to)?);
                if code.is_empty() {
                    // plain transfer or call to an EOA
                    overlay.commit();
                    self.settle_without_frame(true, enter.gas);
                    return Ok(());
                }

                self.frames.push(Frame {
                    evm: Evm {
                        gas: Gas::new(enter.gas),
                        ..Default::default()
                    },
                    code,
                    input: enter.input,
                    address,
                    caller,
                    value,
                    is_static,
                    kind: FrameKind::Call {
                        ret_offset: enter.ret_offset,
                        ret_len: enter.ret_len,
                    },
                    created: None,
                });
            }
        }
        Ok(())
    }

    /// Resolve a call that never produced a frame: push the status flag,
    /// clear the return buffer, hand back unspent gas.
    fn settle_without_frame(&mut self, success: bool, reclaim: u64) {
        let parent = self.frames.last_mut().expect("an active frame");
        parent.evm.gas.reclaim(reclaim);
        parent.evm.ret.clear();
        // the stack had room: seven operands were just popped
        parent
            .evm
            .push(if success { Word::one() } else { Word::zero() })
            .expect("stack slot was just freed");
    }

    /// Retire the innermost frame and propagate its result.
    fn exit(&mut self, overlay: &mut Overlay, halt: Halt) -> Result<Option<Outcome>, ExecutorError> {
        let mut frame = self.frames.pop().expect("an active frame");
        let (mut success, reverted, mut ret) = match halt {
            Halt::Stop => (true, false, Vec::new()),
            Halt::Return(data) => (true, false, data),
            Halt::Revert(data) => (false, true, data),
        };

        if frame.kind == FrameKind::Create && success {
            let deposit = gas::CODE_DEPOSIT_GAS * ret.len() as u64;
            if frame.evm.gas.try_consume(deposit) {
                let address = frame.created.expect("create frame has a target");
                overlay.deploy_code(&address, std::mem::take(&mut ret))?;
            } else {
                // cannot pay for the deployed code
                success = false;
                frame.evm.gas.consume_all();
                ret = Vec::new();
            }
        }

        if success {
            overlay.commit();
        } else {
            overlay.revert();
        }

        let gas_left = frame.evm.gas.remaining();
        let Some(parent) = self.frames.last_mut() else {
            return Ok(Some(Outcome {
                success,
                reverted,
                ret,
                gas_used: frame.evm.gas.used(),
                gas_left,
                created: frame.created,
                fault: None,
            }));
        };

        parent.evm.gas.reclaim(gas_left);
        match frame.kind {
            FrameKind::Call {
                ret_offset,
                ret_len,
            } => {
                let n = ret.len().min(ret_len);
                parent.evm.memory[ret_offset..ret_offset + n].copy_from_slice(&ret[..n]);
                parent.evm.ret = ret;
                parent
                    .evm
                    .push(if success { Word::one() } else { Word::zero() })
                    .expect("stack slot was just freed");
            }
            FrameKind::Create => {
                // returndata carries the revert payload only
                parent.evm.ret = if success { Vec::new() } else { ret };
                let result = if success {
                    frame.created.expect("create frame has a target").as_word()
                } else {
                    Word::zero()
                };
                parent
                    .evm
                    .push(result)
                    .expect("stack slot was just freed");
            }
        }
        Ok(None)
    }

    /// Retire the innermost frame on a fault: all its gas burns, its
    /// checkpoint reverts, the caller sees a zero flag and no return data.
    fn fail(&mut self, overlay: &mut Overlay, fault: Fault) -> Result<Option<Outcome>, ExecutorError> {
        tracing::debug!(depth = self.frames.len(), %fault, "frame fault");
        let mut frame = self.frames.pop().expect("an active frame");
        frame.evm.gas.consume_all();
        overlay.revert();

        let Some(parent) = self.frames.last_mut() else {
            return Ok(Some(Outcome {
                success: false,
                reverted: false,
                ret: Vec::new(),
                gas_used: frame.evm.gas.used(),
                gas_left: 0,
                created: frame.created,
                fault: Some(fault),
            }));
        };

        parent.evm.ret.clear();
        parent
            .evm
            .push(Word::zero())
            .expect("stack slot was just freed");
        Ok(None)
    }
}

fn load_word(data: &[u8], offset: Word) -> Word {
    if !offset.fits_usize() {
        return Word::zero();
    }
    let offset = offset.as_usize();
    if offset >= data.len() {
        return Word::zero();
    }
    let mut bytes = [0u8; 32];
    let n = (data.len() - offset).min(32);
    bytes[..n].copy_from_slice(&data[offset..offset + n]);
    Word::from_bytes(&bytes)
}

/// Copy `src[offset..offset+len]` into memory at `dest`, zero-padding reads
/// past the end of `src`. Charges the per-word copy cost plus expansion.
fn copy_padded(
    evm: &mut Evm,
    src: &[u8],
    dest: Word,
    offset: Word,
    len: Word,
) -> Result<(), Fault> {
    let (dest, len) = evm.mem_range(dest, len)?;
    if len == 0 {
        return Ok(());
    }
    if !evm.gas.try_consume(gas::copy_gas(len)) {
        return Err(Fault::OutOfGas);
    }
    let start = if offset.fits_usize() {
        offset.as_usize().min(src.len())
    } else {
        src.len()
    };
    let n = (src.len() - start).min(len);
    evm.memory[dest..dest + n].copy_from_slice(&src[start..start + n]);
    evm.memory[dest + n..dest + len].fill(0);
    Ok(())
}
