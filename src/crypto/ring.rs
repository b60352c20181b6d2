// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Application verification ring.
//!
//! A ring is the set of public keys allowed to sign relays on behalf of an
//! application: the application key itself followed by the keys of every
//! gateway it delegated to. Relay requests carry a SAG (spontaneous
//! anonymous group) ring signature: it proves that one ring member signed
//! without revealing which one.
//!
//! Members are points of the Ed25519 curve. A signature over `n` members is
//! the initial challenge followed by one response scalar per member,
//! `32 * (n + 1)` bytes in total.

use crate::{
    crypto::{ed25519, PublicKey},
    Error, ErrorKind, Result,
};
use ::ring::digest::{Context, SHA512};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_POINT,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
};
use rand::rngs::OsRng;

/// Minimum ring size. Applications without delegations get their own key twice.
pub const MIN_RING_SIZE: usize = 2;

const SCALAR_LEN: usize = 32;

const RING_SIG_DOMAIN: &[u8] = b"relayminer/ring-sag/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    members: Vec<ed25519::PublicKey>,
    points: Vec<EdwardsPoint>,
}

/// Decompress a member key. Small order points are not usable ring members.
fn to_point(key: &ed25519::PublicKey) -> Result<EdwardsPoint> {
    match CompressedEdwardsY(key.to_compressed()).decompress() {
        Some(point) if !point.is_small_order() => Ok(point),
        _ => Err(Error::new_ext(
            ErrorKind::WrongCurve,
            format!("{} is not a valid curve point", hex::encode(key.to_bytes())),
        )),
    }
}

fn challenge(transcript: &Context, commitment: &EdwardsPoint) -> Scalar {
    let mut ctx = transcript.clone();
    ctx.update(commitment.compress().as_bytes());
    let mut wide = [0u8; 64];
    wide.copy_from_slice(ctx.finish().as_ref());
    Scalar::from_bytes_mod_order_wide(&wide)
}

impl Ring {
    /// Build a ring from on-chain public keys, in order.
    ///
    /// Fails with `WrongCurve` if any key is not an Ed25519 curve point and
    /// with `MalformedData` if fewer than two keys are given.
    pub fn new(keys: Vec<PublicKey>) -> Result<Ring> {
        if keys.len() < MIN_RING_SIZE {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("ring needs at least {} members", MIN_RING_SIZE),
            ));
        }
        let members = keys
            .into_iter()
            .map(|key| match key {
                PublicKey::Ed25519 { pb } => Ok(pb),
                PublicKey::Ecdsa(key) => Err(Error::new_ext(
                    ErrorKind::WrongCurve,
                    format!("{:?} key cannot be a ring member", key.curve_id),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        let points = members.iter().map(to_point).collect::<Result<Vec<_>>>()?;
        Ok(Ring { members, points })
    }

    pub fn members(&self) -> &[ed25519::PublicKey] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    // Every challenge commits to the whole ring and to the message.
    fn transcript(&self, data: &[u8]) -> Context {
        let mut ctx = Context::new(&SHA512);
        ctx.update(RING_SIG_DOMAIN);
        for member in &self.members {
            ctx.update(&member.to_compressed());
        }
        ctx.update(data);
        ctx
    }

    /// Ring-sign `data` with the key of one of the members.
    pub fn sign(&self, data: &[u8], keypair: &ed25519::KeyPair) -> Result<Vec<u8>> {
        let public_key = keypair.public_key();
        let index = self
            .members
            .iter()
            .position(|member| *member == public_key)
            .ok_or_else(|| Error::new_ext(ErrorKind::InvalidSignature, "signer not in ring"))?;
        let secret = Scalar::from_bytes_mod_order(keypair.secret_scalar_bytes());
        let len = self.points.len();
        let transcript = self.transcript(data);
        let mut csprng = OsRng {};

        let mut challenges = vec![Scalar::zero(); len];
        let mut responses = vec![Scalar::zero(); len];
        let nonce = Scalar::random(&mut csprng);
        let mut i = (index + 1) % len;
        challenges[i] = challenge(&transcript, &(nonce * ED25519_BASEPOINT_POINT));
        while i != index {
            responses[i] = Scalar::random(&mut csprng);
            let commitment = EdwardsPoint::vartime_double_scalar_mul_basepoint(
                &challenges[i],
                &self.points[i],
                &responses[i],
            );
            let next = (i + 1) % len;
            challenges[next] = challenge(&transcript, &commitment);
            i = next;
        }
        // Closes the ring: s * G + c * P == nonce * G for the signer.
        responses[index] = nonce - challenges[index] * secret;

        let mut sig = Vec::with_capacity(SCALAR_LEN * (len + 1));
        sig.extend_from_slice(challenges[0].as_bytes());
        responses
            .iter()
            .for_each(|response| sig.extend_from_slice(response.as_bytes()));
        Ok(sig)
    }

    /// True if `sig` is a ring signature of `data` by any member.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        if sig.len() != SCALAR_LEN * (self.points.len() + 1) {
            return false;
        }
        let scalars = sig
            .chunks(SCALAR_LEN)
            .map(|chunk| {
                let mut bytes = [0u8; SCALAR_LEN];
                bytes.copy_from_slice(chunk);
                Scalar::from_canonical_bytes(bytes)
            })
            .collect::<Option<Vec<_>>>();
        let scalars = match scalars {
            Some(scalars) => scalars,
            None => return false,
        };
        let transcript = self.transcript(data);
        let first = scalars[0];
        let last = self
            .points
            .iter()
            .zip(&scalars[1..])
            .fold(first, |c, (point, response)| {
                let commitment =
                    EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, point, response);
                challenge(&transcript, &commitment)
            });
        last == first
    }
}
