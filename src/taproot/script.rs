use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, ripemd160};
use bitcoin::opcodes::{self, Opcode};
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::secp256k1::XOnlyPublicKey;

/// Spend condition of the claim leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimLeaf {
    /// Reverse and chain swaps require the witness preimage to be exactly 32 bytes.
    pub checks_preimage_size: bool,
    pub preimage_hash160: [u8; 20],
    pub claim_key: XOnlyPublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundLeaf {
    pub refund_key: XOnlyPublicKey,
    pub timeout_block_height: u32,
}

impl ClaimLeaf {
    pub fn new(checks_preimage_size: bool, preimage_hash: &[u8; 32], claim_key: XOnlyPublicKey) -> Self {
        Self {
            checks_preimage_size,
            preimage_hash160: ripemd160::Hash::hash(preimage_hash).to_byte_array(),
            claim_key,
        }
    }

    pub fn to_script(&self) -> ScriptBuf {
        let mut builder = Builder::new();
        if self.checks_preimage_size {
            builder = builder
                .push_opcode(opcodes::all::OP_SIZE)
                .push_int(32)
                .push_opcode(opcodes::all::OP_EQUALVERIFY);
        }
        builder
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(self.preimage_hash160)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_x_only_key(&self.claim_key)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }
}

impl RefundLeaf {
    pub fn to_script(&self) -> ScriptBuf {
        Builder::new()
            .push_x_only_key(&self.refund_key)
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_int(i64::from(self.timeout_block_height))
            .push_opcode(opcodes::all::OP_CLTV)
            .into_script()
    }
}

pub fn parse_claim_leaf(script: &Script) -> Result<ClaimLeaf> {
    let mut iter = script.instructions_minimal().peekable();

    let checks_preimage_size = matches!(
        iter.peek(),
        Some(Ok(Instruction::Op(op))) if *op == opcodes::all::OP_SIZE
    );
    if checks_preimage_size {
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_SIZE)?;
        let size = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;
    }

    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_HASH160)?;
    let preimage_hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;
    let claim_key = expect_x_only(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;

    anyhow::ensure!(
        iter.next().is_none(),
        "unexpected trailing instructions in claim leaf"
    );

    Ok(ClaimLeaf {
        checks_preimage_size,
        preimage_hash160,
        claim_key,
    })
}

pub fn parse_refund_leaf(script: &Script) -> Result<RefundLeaf> {
    let mut iter = script.instructions_minimal();

    let refund_key = expect_x_only(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIGVERIFY)?;
    let timeout = parse_script_num(next_instruction(&mut iter)?)?;
    let timeout_block_height =
        u32::try_from(timeout).with_context(|| format!("timeout out of range: {timeout}"))?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;

    anyhow::ensure!(
        iter.next().is_none(),
        "unexpected trailing instructions in refund leaf"
    );

    Ok(RefundLeaf {
        refund_key,
        timeout_block_height,
    })
}

fn next_instruction<'a>(
    iter: &mut impl Iterator<Item = Result<Instruction<'a>, bitcoin::script::Error>>,
) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("decode leaf instruction: {e:?}"))?
        .context("unexpected end of leaf script")
}

fn expect_op(actual: Instruction<'_>, expected: Opcode) -> Result<()> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}"),
    }
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(op) => {
            let code = op.to_u8();
            let one = opcodes::all::OP_PUSHNUM_1.to_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok(i64::from(code - one + 1));
            }
            anyhow::bail!("unexpected opcode where script number expected: {op:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    anyhow::ensure!(bytes.len() <= 5, "script number too large: {} bytes", bytes.len());

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}"),
    }
}

fn expect_x_only(actual: Instruction<'_>) -> Result<XOnlyPublicKey> {
    let bytes = expect_push::<32>(actual)?;
    XOnlyPublicKey::from_slice(&bytes).context("leaf key is not a valid x-only public key")
}
