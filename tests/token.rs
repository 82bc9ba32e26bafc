//! End-to-end token flow over the provider surface: deploy, mint, approve,
//! transferFrom, balance reads and log queries. The contract is assembled
//! by hand below; its storage layout is balance-at-address-word plus
//! allowance-at-keccak(owner || spender).

use std::collections::HashMap;

use dynamo::{
    Address, Hash, Provider, TransactionRequest, Word, addr,
    common::{Hex, hash::keccak256, tx::Receipt},
};
use pretty_assertions::assert_eq;
use serde_json::json;

const A: Address = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
const B: Address = addr("70997970c51812dc3a010c7d01b50e0d17dc79c8");

const GAS_PRICE: u64 = 50_000;

enum Asm {
    Op(u8),
    Push(Vec<u8>),
    PushLabel(&'static str),
    Label(&'static str),
}

fn op(byte: u8) -> Asm {
    Asm::Op(byte)
}

fn push1(byte: u8) -> Asm {
    Asm::Push(vec![byte])
}

fn pushw(word: Word) -> Asm {
    Asm::Push(word.into_bytes().to_vec())
}

fn assemble(program: Vec<Asm>) -> Vec<u8> {
    let mut offsets = HashMap::new();
    let mut pc = 0usize;
    for item in &program {
        match item {
            Asm::Op(_) => pc += 1,
            Asm::Push(bytes) => pc += 1 + bytes.len(),
            Asm::PushLabel(_) => pc += 3, // PUSH2 hi lo
            Asm::Label(name) => {
                offsets.insert(*name, pc);
                pc += 1; // JUMPDEST
            }
        }
    }
    let mut code = Vec::with_capacity(pc);
    for item in &program {
        match item {
            Asm::Op(byte) => code.push(*byte),
            Asm::Push(bytes) => {
                code.push(0x60 + bytes.len() as u8 - 1);
                code.extend_from_slice(bytes);
            }
            Asm::PushLabel(name) => {
                let target = offsets[name] as u16;
                code.push(0x61);
                code.extend_from_slice(&target.to_be_bytes());
            }
            Asm::Label(_) => code.push(0x5b),
        }
    }
    code
}

fn event(signature: &str) -> Hash {
    keccak256(signature.as_bytes())
}

/// Selector dispatch on the first calldata byte; word-sized arguments at
/// offsets 1, 33, 65.
fn token_runtime() -> Vec<u8> {
    let transfer_sig = event("Transfer(address,address,uint256)");
    let approval_sig = event("Approval(address,address,uint256)");
    let mint_sig = event("Mint(address,uint256)");

    let mut program = vec![
        // selector = first calldata byte
        push1(0x00),
        op(0x35), // CALLDATALOAD
        push1(248),
        op(0x1c), // SHR
        op(0x80), // DUP1
        push1(0x01),
        op(0x14), // EQ
        Asm::PushLabel("mint"),
        op(0x57), // JUMPI
        op(0x80),
        push1(0x02),
        op(0x14),
        Asm::PushLabel("transfer"),
        op(0x57),
        op(0x80),
        push1(0x03),
        op(0x14),
        Asm::PushLabel("approve"),
        op(0x57),
        op(0x80),
        push1(0x04),
        op(0x14),
        Asm::PushLabel("transfer_from"),
        op(0x57),
        op(0x80),
        push1(0x05),
        op(0x14),
        Asm::PushLabel("balance_of"),
        op(0x57),
        op(0x80),
        push1(0x06),
        op(0x14),
        Asm::PushLabel("allowance"),
        op(0x57),
        push1(0x00),
        push1(0x00),
        op(0xfd), // REVERT: unknown selector
    ];

    // mint(wad): balance[caller] += wad; Mint(caller, wad)
    program.extend([
        Asm::Label("mint"),
        op(0x50), // POP selector
        push1(0x01),
        op(0x35), // [wad]
        op(0x80), // [wad wad]
        op(0x33), // CALLER
        op(0x54), // SLOAD -> [wad wad bal]
        op(0x01), // ADD -> [wad newbal]
        op(0x33),
        op(0x55), // SSTORE balance[caller]
        push1(0x00),
        op(0x52), // MSTORE mem[0] = wad
        op(0x33), // topic2 = caller
        pushw(Word::from_bytes(&mint_sig.0)),
        push1(0x20),
        push1(0x00),
        op(0xa2), // LOG2
        op(0x00), // STOP
    ]);

    // transfer(dst, wad): caller -> dst
    program.extend([
        Asm::Label("transfer"),
        op(0x50),
        push1(0x21),
        op(0x35), // [wad]
        op(0x80),
        op(0x33),
        op(0x54), // [wad wad bal]
        op(0x10), // LT: bal < wad -> [wad cond]
        Asm::PushLabel("insufficient"),
        op(0x57),
        op(0x80),
        op(0x33),
        op(0x54),
        op(0x03), // SUB -> [wad bal-wad]
        op(0x33),
        op(0x55), // balance[caller] = bal - wad
        op(0x80),
        push1(0x01),
        op(0x35),
        op(0x54), // [wad wad bal_dst]
        op(0x01),
        push1(0x01),
        op(0x35),
        op(0x55), // balance[dst] += wad
        push1(0x00),
        op(0x52), // mem[0] = wad
        push1(0x01),
        op(0x35), // topic3 = dst
        op(0x33), // topic2 = caller
        pushw(Word::from_bytes(&transfer_sig.0)),
        push1(0x20),
        push1(0x00),
        op(0xa3), // LOG3
        op(0x00),
    ]);

    // approve(guy, wad): allowance[caller][guy] = wad
    program.extend([
        Asm::Label("approve"),
        op(0x50),
        op(0x33),
        push1(0x00),
        op(0x52), // mem[0] = caller
        push1(0x01),
        op(0x35),
        push1(0x20),
        op(0x52), // mem[32] = guy
        push1(0x21),
        op(0x35), // [wad]
        push1(0x40),
        push1(0x00),
        op(0x20), // SHA3(0, 64) -> [wad slot]
        op(0x55), // SSTORE
        push1(0x21),
        op(0x35),
        push1(0x00),
        op(0x52), // mem[0] = wad
        push1(0x01),
        op(0x35), // topic3 = guy
        op(0x33), // topic2 = caller
        pushw(Word::from_bytes(&approval_sig.0)),
        push1(0x20),
        push1(0x00),
        op(0xa3),
        op(0x00),
    ]);

    // transferFrom(src, dst, wad): caller spends allowance[src][caller]
    program.extend([
        Asm::Label("transfer_from"),
        op(0x50),
        push1(0x01),
        op(0x35),
        push1(0x00),
        op(0x52), // mem[0] = src
        op(0x33),
        push1(0x20),
        op(0x52), // mem[32] = caller
        push1(0x41),
        op(0x35), // [wad]
        // allowance check
        op(0x80),
        push1(0x40),
        push1(0x00),
        op(0x20),
        op(0x54), // [wad wad allow]
        op(0x10), // allow < wad
        Asm::PushLabel("insufficient"),
        op(0x57),
        // balance check
        op(0x80),
        push1(0x01),
        op(0x35),
        op(0x54), // [wad wad bal_src]
        op(0x10),
        Asm::PushLabel("insufficient"),
        op(0x57),
        // allowance -= wad
        op(0x80),
        push1(0x40),
        push1(0x00),
        op(0x20),
        op(0x54),
        op(0x03), // [wad allow-wad]
        push1(0x40),
        push1(0x00),
        op(0x20),
        op(0x55),
        // balance[src] -= wad
        op(0x80),
        push1(0x01),
        op(0x35),
        op(0x54),
        op(0x03),
        push1(0x01),
        op(0x35),
        op(0x55),
        // balance[dst] += wad
        op(0x80),
        push1(0x21),
        op(0x35),
        op(0x54),
        op(0x01),
        push1(0x21),
        op(0x35),
        op(0x55),
        // Transfer(src, dst, wad)
        push1(0x00),
        op(0x52), // mem[0] = wad
        push1(0x21),
        op(0x35), // topic3 = dst
        push1(0x01),
        op(0x35), // topic2 = src
        pushw(Word::from_bytes(&transfer_sig.0)),
        push1(0x20),
        push1(0x00),
        op(0xa3),
        op(0x00),
    ]);

    // balanceOf(guy)
    program.extend([
        Asm::Label("balance_of"),
        op(0x50),
        push1(0x01),
        op(0x35),
        op(0x54),
        push1(0x00),
        op(0x52),
        push1(0x20),
        push1(0x00),
        op(0xf3), // RETURN
    ]);

    // allowance(src, guy)
    program.extend([
        Asm::Label("allowance"),
        op(0x50),
        push1(0x01),
        op(0x35),
        push1(0x00),
        op(0x52),
        push1(0x21),
        op(0x35),
        push1(0x20),
        op(0x52),
        push1(0x40),
        push1(0x00),
        op(0x20),
        op(0x54),
        push1(0x00),
        op(0x52),
        push1(0x20),
        push1(0x00),
        op(0xf3),
    ]);

    // shared failure exit: revert with a one-word reason
    program.extend([
        Asm::Label("insufficient"),
        pushw(Word::from_bytes(&keccak256(b"insufficient").0)),
        push1(0x00),
        op(0x52),
        push1(0x20),
        push1(0x00),
        op(0xfd),
    ]);

    assemble(program)
}

/// Constructor: emit LogSetOwner(caller), then return the runtime code.
fn token_initcode() -> Vec<u8> {
    let runtime = token_runtime();
    let owner_sig = event("LogSetOwner(address)");
    let len = runtime.len() as u16;

    let mut code = Vec::new();
    // CALLER, PUSH32 sig, PUSH1 0, PUSH1 0, LOG2
    code.push(0x33);
    code.push(0x7f);
    code.extend_from_slice(&owner_sig.0);
    code.extend_from_slice(&[0x60, 0x00, 0x60, 0x00, 0xa2]);
    // PUSH2 len, PUSH2 offset, PUSH1 0, CODECOPY, PUSH2 len, PUSH1 0, RETURN
    let prefix_len = (code.len() + 3 + 3 + 2 + 1 + 3 + 2 + 1) as u16;
    code.push(0x61);
    code.extend_from_slice(&len.to_be_bytes());
    code.push(0x61);
    code.extend_from_slice(&prefix_len.to_be_bytes());
    code.extend_from_slice(&[0x60, 0x00, 0x39]);
    code.push(0x61);
    code.extend_from_slice(&len.to_be_bytes());
    code.extend_from_slice(&[0x60, 0x00, 0xf3]);
    code.extend_from_slice(&runtime);
    code
}

fn provider() -> Provider {
    let grant = Word::from(1_000_000u64) * Word::from(1_000_000_000_000_000_000u64);
    Provider::builder()
        .fund(A, grant)
        .fund(B, grant)
        .ready()
        .expect("fresh provider")
}

fn send(provider: &mut Provider, from: Address, to: Address, data: Vec<u8>) -> Receipt {
    provider
        .send_transaction(TransactionRequest {
            from: Some(from),
            to: Some(to),
            gas: Some(Word::from(2_000_000u64)),
            gas_price: Some(Word::from(GAS_PRICE)),
            data: Some(Hex(data)),
            ..Default::default()
        })
        .expect("transaction accepted")
}

fn query(provider: &Provider, to: Address, data: Vec<u8>) -> Word {
    let ret = provider
        .call(
            &TransactionRequest {
                from: Some(A),
                to: Some(to),
                data: Some(Hex(data)),
                ..Default::default()
            },
            dynamo::BlockTag::Latest,
        )
        .expect("call succeeded");
    Word::from_bytes(&ret)
}

fn calldata(selector: u8, args: &[Word]) -> Vec<u8> {
    let mut data = vec![selector];
    for arg in args {
        data.extend_from_slice(&arg.into_bytes());
    }
    data
}

fn wad(units: u64) -> Word {
    Word::from(units) * Word::from(1_000_000_000_000_000_000u64)
}

const MINT: u8 = 0x01;
const APPROVE: u8 = 0x03;
const TRANSFER_FROM: u8 = 0x04;
const BALANCE_OF: u8 = 0x05;
const ALLOWANCE: u8 = 0x06;

fn balance_of(provider: &Provider, token: Address, guy: Address) -> Word {
    query(provider, token, calldata(BALANCE_OF, &[guy.as_word()]))
}

fn allowance(provider: &Provider, token: Address, src: Address, guy: Address) -> Word {
    query(
        provider,
        token,
        calldata(ALLOWANCE, &[src.as_word(), guy.as_word()]),
    )
}

#[test]
fn test_deploy_mint_transfer_from() -> eyre::Result<()> {
    let mut provider = provider();

    // deploy: the constructor log names the owner
    let receipt = provider.send_transaction(TransactionRequest {
        from: Some(A),
        gas: Some(Word::from(2_000_000u64)),
        gas_price: Some(Word::from(GAS_PRICE)),
        data: Some(Hex(token_initcode())),
        ..Default::default()
    })?;
    assert_eq!(receipt.status, 1);
    let token = receipt.contract_address.expect("contract created");
    assert_eq!(receipt.logs.len(), 1);
    assert_eq!(receipt.logs[0].topics[0], event("LogSetOwner(address)"));
    assert_eq!(receipt.logs[0].topics[1], Hash(A.as_word().into_bytes()));

    // mint 1000e18 to A
    let receipt = send(&mut provider, A, token, calldata(MINT, &[wad(1000)]));
    assert_eq!(receipt.status, 1);
    assert_eq!(balance_of(&provider, token, A), wad(1000));
    assert_eq!(allowance(&provider, token, A, B), Word::zero());

    // approve B for the full amount
    let receipt = send(
        &mut provider,
        A,
        token,
        calldata(APPROVE, &[B.as_word(), wad(1000)]),
    );
    assert_eq!(receipt.status, 1);
    assert_eq!(allowance(&provider, token, A, B), wad(1000));

    // B pulls 600e18
    let receipt = send(
        &mut provider,
        B,
        token,
        calldata(TRANSFER_FROM, &[A.as_word(), B.as_word(), wad(600)]),
    );
    assert_eq!(receipt.status, 1);
    assert_eq!(balance_of(&provider, token, A), wad(400));
    assert_eq!(balance_of(&provider, token, B), wad(600));
    assert_eq!(allowance(&provider, token, A, B), wad(400));

    // B pulls the remaining 400e18
    let receipt = send(
        &mut provider,
        B,
        token,
        calldata(TRANSFER_FROM, &[A.as_word(), B.as_word(), wad(400)]),
    );
    assert_eq!(receipt.status, 1);
    assert_eq!(receipt.logs.len(), 1);
    let transfer = &receipt.logs[0];
    assert_eq!(transfer.topics[0], event("Transfer(address,address,uint256)"));
    assert_eq!(transfer.topics[1], Hash(A.as_word().into_bytes()));
    assert_eq!(transfer.topics[2], Hash(B.as_word().into_bytes()));
    assert_eq!(Word::from_bytes(&transfer.data.0), wad(400));

    assert_eq!(balance_of(&provider, token, A), Word::zero());
    assert_eq!(balance_of(&provider, token, B), wad(1000));
    assert_eq!(allowance(&provider, token, A, B), Word::zero());

    // past Transfer events from block 0, in block order
    let logs = provider.logs(&serde_json::from_value(json!({
        "fromBlock": "0x0",
        "address": format!("{token}"),
        "topics": [format!("{}", event("Transfer(address,address,uint256)"))],
    }))?)?;
    assert_eq!(logs.len(), 2);
    assert_eq!(Word::from_bytes(&logs[0].data.0), wad(600));
    assert_eq!(Word::from_bytes(&logs[1].data.0), wad(400));
    assert!(logs[0].block_number < logs[1].block_number);

    Ok(())
}

#[test]
fn test_transfer_from_beyond_allowance_reverts() -> eyre::Result<()> {
    let mut provider = provider();

    let receipt = provider.send_transaction(TransactionRequest {
        from: Some(A),
        gas: Some(Word::from(2_000_000u64)),
        gas_price: Some(Word::from(GAS_PRICE)),
        data: Some(Hex(token_initcode())),
        ..Default::default()
    })?;
    let token = receipt.contract_address.expect("contract created");

    send(&mut provider, A, token, calldata(MINT, &[wad(10)]));
    send(
        &mut provider,
        A,
        token,
        calldata(APPROVE, &[B.as_word(), wad(1)]),
    );

    let receipt = send(
        &mut provider,
        B,
        token,
        calldata(TRANSFER_FROM, &[A.as_word(), B.as_word(), wad(5)]),
    );
    assert_eq!(receipt.status, 0);
    assert!(receipt.logs.is_empty());
    assert_eq!(balance_of(&provider, token, A), wad(10));
    assert_eq!(balance_of(&provider, token, B), Word::zero());

    Ok(())
}

#[test]
fn test_mint_emits_mint_not_transfer() -> eyre::Result<()> {
    let mut provider = provider();
    let receipt = provider.send_transaction(TransactionRequest {
        from: Some(A),
        gas: Some(Word::from(2_000_000u64)),
        gas_price: Some(Word::from(GAS_PRICE)),
        data: Some(Hex(token_initcode())),
        ..Default::default()
    })?;
    let token = receipt.contract_address.expect("contract created");

    let receipt = send(&mut provider, A, token, calldata(MINT, &[wad(7)]));
    assert_eq!(receipt.logs.len(), 1);
    assert_eq!(receipt.logs[0].topics[0], event("Mint(address,uint256)"));
    assert_eq!(Word::from_bytes(&receipt.logs[0].data.0), wad(7));
    Ok(())
}
