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

//! Ed25519 keys. This is the curve ring members must live on.

use crate::{crypto::Hash, Error, ErrorKind, Result};
use ed25519_dalek::{
    ExpandedSecretKey, Keypair as KeyPairImpl, PublicKey as PublicKeyImpl, Signer as _,
    Verifier as _,
};
use rand::rngs::OsRng;
use serde::{self, de::Visitor, Deserialize, Serialize};
use std::convert::TryFrom;

pub struct KeyPair(KeyPairImpl);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    imp: PublicKeyImpl,
}

impl KeyPair {
    /// Load from the 64 bytes secret+public concatenation.
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let internal = KeyPairImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair(internal))
    }

    pub fn from_random() -> KeyPair {
        let mut csprng = OsRng {};
        let internal = KeyPairImpl::generate(&mut csprng);
        KeyPair(internal)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig = self.0.sign(data).to_bytes().to_vec();
        Ok(sig)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { imp: self.0.public }
    }

    /// Clamped secret scalar of the expanded key (the public key is this
    /// scalar times the base point).
    pub(crate) fn secret_scalar_bytes(&self) -> [u8; 32] {
        let expanded = ExpandedSecretKey::from(&self.0.secret).to_bytes();
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&expanded[..32]);
        scalar
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let internal = PublicKeyImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(PublicKey { imp: internal })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.imp.to_bytes().to_vec()
    }

    /// Compressed Edwards Y form of the key.
    pub(crate) fn to_compressed(&self) -> [u8; 32] {
        self.imp.to_bytes()
    }

    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        ed25519_dalek::Signature::try_from(sig)
            .and_then(|s| self.imp.verify(data, &s))
            .is_ok()
    }

    /// Base58 of the multihash of the tagged key bytes.
    pub fn to_account_id(&self) -> String {
        let bytes = add_protobuf_header(self.to_bytes());
        let hash = Hash::from_data(&bytes);
        bs58::encode(hash).into_string()
    }
}

// Protobuf header.
#[rustfmt::skip]
fn add_protobuf_header(mut buf: Vec<u8>) -> Vec<u8> {
    let mut res: Vec<u8> = vec![
        // Algorithm type tag.
        0x08,
        // Ed25519.
        0x01,
        // Length tag.
        0x12,
        // Payload length.
        buf.len() as u8,
    ];
    res.append(&mut buf);
    res
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'v> Visitor<'v> for BytesVisitor {
            type Value = PublicKey;

            fn expecting(
                &self,
                fmt: &mut std::fmt::Formatter<'_>,
            ) -> std::result::Result<(), std::fmt::Error> {
                write!(fmt, "expecting byte array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PublicKey::from_bytes(bytes)
                    .map_err(|_err| serde::de::Error::custom("Invalid ed25519 public key"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}
