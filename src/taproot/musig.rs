use anyhow::{Context as _, Result};
use bitcoin::secp256k1::rand::{RngCore as _, thread_rng};
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{All, Keypair, Message, Secp256k1, SecretKey};
use lwk_wollet::elements::secp256k1_zkp::{
    MusigAggNonce, MusigKeyAggCache, MusigPartialSignature, MusigPubNonce, MusigSecNonce,
    MusigSession, MusigSessionId,
};

use crate::error::SwapError;
use crate::taproot::tree::SwapTree;

pub const PUB_NONCE_LEN: usize = 66;
pub const PARTIAL_SIGNATURE_LEN: usize = 32;

/// One two-party MuSig2 round over the tweaked key of a [`SwapTree`].
///
/// A session is consumed by [`SigningSession::finalize`] or [`SigningSession::sign`], so a
/// failed attempt can never be retried with the same nonce.
pub struct SigningSession {
    secp: Secp256k1<All>,
    keypair: Keypair,
    key_agg_cache: MusigKeyAggCache,
    output_key: bitcoin::secp256k1::XOnlyPublicKey,
    counterparty_public_key: bitcoin::secp256k1::PublicKey,
    message: Message,
    sec_nonce: MusigSecNonce,
    pub_nonce: MusigPubNonce,
}

impl SigningSession {
    /// Starts a session for `sighash` and generates our nonce.
    pub fn new(tree: &SwapTree, private_key: &SecretKey, sighash: [u8; 32]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, private_key);
        anyhow::ensure!(
            keypair.public_key() == tree.our_public_key(),
            "private key does not belong to the swap tree"
        );

        let key_agg_cache = tree.tweaked_key_agg_cache()?;
        let message = Message::from_digest(sighash);

        let mut extra_rand = [0u8; 32];
        thread_rng().fill_bytes(&mut extra_rand);
        let (sec_nonce, pub_nonce) = key_agg_cache
            .nonce_gen(
                &secp,
                MusigSessionId::new(&mut thread_rng()),
                keypair.public_key(),
                message,
                Some(extra_rand),
            )
            .map_err(|e| anyhow::anyhow!("generate musig nonce: {e:?}"))?;

        Ok(Self {
            secp,
            keypair,
            key_agg_cache,
            output_key: tree.output_key(),
            counterparty_public_key: tree.counterparty_public_key(),
            message,
            sec_nonce,
            pub_nonce,
        })
    }

    pub fn public_nonce(&self) -> [u8; PUB_NONCE_LEN] {
        self.pub_nonce.serialize()
    }

    /// Produces our partial signature when the counterparty aggregates, as in a
    /// cooperative submarine claim by the server.
    pub fn sign(self, counterparty_nonce: &[u8]) -> Result<[u8; PARTIAL_SIGNATURE_LEN]> {
        let counterparty_nonce = parse_pub_nonce(counterparty_nonce)?;
        let session = self.session(counterparty_nonce);
        let partial = session
            .partial_sign(&self.secp, self.sec_nonce, &self.keypair, &self.key_agg_cache)
            .map_err(|e| SwapError::SigningProtocol(format!("partial sign: {e:?}")))?;
        Ok(partial.serialize())
    }

    /// Verifies the counterparty's partial signature and combines it with ours into the
    /// final key-path signature.
    pub fn finalize(self, counterparty_nonce: &[u8], counterparty_partial: &[u8]) -> Result<Signature> {
        let counterparty_nonce = parse_pub_nonce(counterparty_nonce)?;
        anyhow::ensure!(
            counterparty_partial.len() == PARTIAL_SIGNATURE_LEN,
            SwapError::SigningProtocol(format!(
                "partial signature must be {PARTIAL_SIGNATURE_LEN} bytes, got {}",
                counterparty_partial.len()
            ))
        );
        let counterparty_partial = MusigPartialSignature::from_slice(counterparty_partial)
            .map_err(|e| SwapError::SigningProtocol(format!("parse partial signature: {e:?}")))?;

        let session = self.session(counterparty_nonce);
        if !session.partial_verify(
            &self.secp,
            &self.key_agg_cache,
            counterparty_partial,
            counterparty_nonce,
            self.counterparty_public_key,
        ) {
            return Err(SwapError::SigningProtocol(
                "counterparty partial signature does not verify".to_string(),
            )
            .into());
        }

        let ours = session
            .partial_sign(&self.secp, self.sec_nonce, &self.keypair, &self.key_agg_cache)
            .map_err(|e| SwapError::SigningProtocol(format!("partial sign: {e:?}")))?;
        let signature = session.partial_sig_agg(&[counterparty_partial, ours]);

        self.secp
            .verify_schnorr(&signature, &self.message, &self.output_key)
            .map_err(|e| SwapError::SigningProtocol(format!("aggregate signature invalid: {e}")))
            .context("verify aggregated signature")?;
        Ok(signature)
    }

    fn session(&self, counterparty_nonce: MusigPubNonce) -> MusigSession {
        let agg_nonce = MusigAggNonce::new(&self.secp, &[counterparty_nonce, self.pub_nonce]);
        MusigSession::new(&self.secp, &self.key_agg_cache, agg_nonce, self.message)
    }
}

fn parse_pub_nonce(bytes: &[u8]) -> Result<MusigPubNonce> {
    if bytes.len() != PUB_NONCE_LEN {
        return Err(SwapError::SigningProtocol(format!(
            "public nonce must be {PUB_NONCE_LEN} bytes, got {}",
            bytes.len()
        ))
        .into());
    }
    MusigPubNonce::from_slice(bytes)
        .map_err(|e| SwapError::SigningProtocol(format!("parse public nonce: {e:?}")).into())
}
