mod support {
    pub mod fixtures;
    pub mod mocks;
}

use anyhow::Result;
use bitcoin::secp256k1::{Message, Secp256k1};

use ln_taproot_swap::error::SwapError;
use ln_taproot_swap::swap::SwapType;
use ln_taproot_swap::taproot::musig::{PARTIAL_SIGNATURE_LEN, PUB_NONCE_LEN};
use ln_taproot_swap::taproot::{Leaf, SigningSession};

use support::fixtures;
use support::mocks::server_partial_signature;

const SIGHASH: [u8; 32] = [0xab; 32];

fn tree() -> Result<ln_taproot_swap::taproot::SwapTree> {
    let hash = fixtures::preimage_hash(&fixtures::preimage("session"));
    fixtures::bitcoin_tree(SwapType::Submarine, Leaf::Refund, hash, 800_000)
}

#[test]
fn aggregated_signature_verifies_against_output_key() -> Result<()> {
    let tree = tree()?;
    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let our_nonce = session.public_nonce();
    assert_eq!(our_nonce.len(), PUB_NONCE_LEN);

    let (server_nonce, server_partial) =
        server_partial_signature(&tree, Message::from_digest(SIGHASH), &our_nonce)?;
    let signature = session.finalize(&server_nonce, &server_partial)?;

    Secp256k1::new().verify_schnorr(&signature, &Message::from_digest(SIGHASH), &tree.output_key())?;
    Ok(())
}

#[test]
fn each_session_draws_a_fresh_nonce() -> Result<()> {
    let tree = tree()?;
    let first = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let second = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    assert_ne!(first.public_nonce(), second.public_nonce());
    Ok(())
}

#[test]
fn short_nonce_is_a_protocol_error() -> Result<()> {
    let tree = tree()?;
    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let (server_nonce, server_partial) =
        server_partial_signature(&tree, Message::from_digest(SIGHASH), &session.public_nonce())?;

    let err = session
        .finalize(&server_nonce[..65], &server_partial)
        .unwrap_err();
    assert!(matches!(
        SwapError::find(&err),
        Some(SwapError::SigningProtocol(_))
    ));
    assert!(err.to_string().contains("65"), "{err:#}");
    Ok(())
}

#[test]
fn partial_signature_for_another_message_is_rejected() -> Result<()> {
    let tree = tree()?;
    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let (server_nonce, server_partial) = server_partial_signature(
        &tree,
        Message::from_digest([0xcd; 32]),
        &session.public_nonce(),
    )?;

    let err = session.finalize(&server_nonce, &server_partial).unwrap_err();
    assert!(matches!(
        SwapError::find(&err),
        Some(SwapError::SigningProtocol(_))
    ));

    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let err = session
        .finalize(&server_nonce, &server_partial[..PARTIAL_SIGNATURE_LEN - 1])
        .unwrap_err();
    assert!(matches!(
        SwapError::find(&err),
        Some(SwapError::SigningProtocol(_))
    ));
    Ok(())
}

#[test]
fn session_needs_the_tree_key() -> Result<()> {
    let tree = tree()?;
    assert!(SigningSession::new(&tree, &fixtures::server_key()?, SIGHASH).is_err());
    Ok(())
}

#[test]
fn sign_produces_our_half_for_the_server() -> Result<()> {
    let tree = tree()?;
    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    let (server_nonce, _) =
        server_partial_signature(&tree, Message::from_digest(SIGHASH), &session.public_nonce())?;

    let partial = session.sign(&server_nonce)?;
    assert_eq!(partial.len(), PARTIAL_SIGNATURE_LEN);

    let session = SigningSession::new(&tree, &fixtures::our_key()?, SIGHASH)?;
    assert!(session.sign(&[0u8; 10]).is_err());
    Ok(())
}
