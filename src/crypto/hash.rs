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

//! Opaque cryptographic secure hash used to bind relay signatures.
//!
//! Current implementation uses SHA-256.
//!
//! The serialization uses [Multihash](https://multiformats.io/multihash) format
//! so that the algorithm travels along with the digest.

use crate::{Error, ErrorKind, Result};
use ring::digest;
use serde::{de::Visitor, Deserializer, Serializer};

/// Available hash algorithms.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Default)]
pub enum HashAlgorithm {
    /// Only used by the empty default hash.
    #[default]
    Identity,
    Sha256,
}

/// Multihash tag for Identity
const MULTIHASH_TYPE_IDENTITY: u8 = 0x00;
/// Multihash SHA-256 type
const MULTIHASH_TYPE_SHA256: u8 = 0x12;

/// SHA-256 digest length.
const SHA256_LEN: usize = 32;

/// Max serialized length.
const MULTIHASH_BYTES_LEN_MAX: usize = 2 + SHA256_LEN;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct Hash([u8; MULTIHASH_BYTES_LEN_MAX]);

impl Default for Hash {
    fn default() -> Self {
        // Implicitly sets algorithm to "identity" and length to 0
        Hash([0; MULTIHASH_BYTES_LEN_MAX])
    }
}

impl Hash {
    /// Creates a new instance by wrapping precomputed hash bytes.
    pub fn new(alg: HashAlgorithm, bytes: &[u8]) -> Result<Self> {
        let hash_len = bytes.len();
        if hash_len > SHA256_LEN {
            return Err(Error::new_ext(ErrorKind::MalformedData, "hash too long"));
        }
        let tag = match alg {
            HashAlgorithm::Identity => MULTIHASH_TYPE_IDENTITY,
            HashAlgorithm::Sha256 if hash_len == SHA256_LEN => MULTIHASH_TYPE_SHA256,
            HashAlgorithm::Sha256 => {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    "bad sha256 digest length",
                ))
            }
        };
        let mut hash = Hash::default();
        hash.0[0] = tag;
        hash.0[1] = hash_len as u8;
        hash.0[2..(2 + hash_len)].copy_from_slice(bytes);
        Ok(hash)
    }

    /// Construct from a bytes slice representing the serialized multihash of
    /// one of the supported hash algorithms.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 || bytes[1] as usize != bytes.len() - 2 {
            return Err(Error::new_ext(ErrorKind::MalformedData, "bad multihash"));
        }
        let alg = match bytes[0] {
            MULTIHASH_TYPE_IDENTITY => HashAlgorithm::Identity,
            MULTIHASH_TYPE_SHA256 => HashAlgorithm::Sha256,
            _ => return Err(Error::new_ext(ErrorKind::MalformedData, "unknown multihash")),
        };
        Hash::new(alg, &bytes[2..])
    }

    /// SHA-256 of arbitrary data.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, data);
        let mut hash = Hash::default();
        hash.0[0] = MULTIHASH_TYPE_SHA256;
        hash.0[1] = SHA256_LEN as u8;
        hash.0[2..].copy_from_slice(digest.as_ref());
        hash
    }

    /// Creates a new instance from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex::decode(hex) {
            Ok(buf) => Self::from_bytes(&buf),
            Err(err) => Err(Error::new_ext(ErrorKind::MalformedData, err)),
        }
    }

    /// Returns the hash serialized as a multihash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..self.size()]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Multihash bytes size.
    pub fn size(&self) -> usize {
        2 + self.hash_size()
    }

    /// Wrapped hash size.
    pub fn hash_size(&self) -> usize {
        self.0[1] as usize
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self.0[0] {
            MULTIHASH_TYPE_SHA256 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Identity,
        }
    }

    /// Wrapped hash bytes.
    pub fn hash_value(&self) -> &[u8] {
        &self.0[2..self.size()]
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl serde::Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HashVisitor;

        impl<'v> Visitor<'v> for HashVisitor {
            type Value = Hash;

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
                Hash::from_bytes(bytes)
                    .map_err(|_err| serde::de::Error::custom("Invalid multihash"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(HashVisitor)
    }
}
