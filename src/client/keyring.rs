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

use crate::{
    base::RwLock,
    crypto::{KeyPair, PublicKey},
    Error, ErrorKind, Result,
};
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;

/// Named signing keys.
#[cfg_attr(test, automock)]
pub trait Keyring: Send + Sync {
    fn sign(&self, key_name: &str, data: &[u8]) -> Result<Vec<u8>>;

    fn public_key(&self, key_name: &str) -> Result<PublicKey>;
}

/// Keys held in process memory.
#[derive(Default)]
pub struct LocalKeyring {
    keys: RwLock<HashMap<String, KeyPair>>,
}

impl LocalKeyring {
    pub fn new() -> Self {
        LocalKeyring::default()
    }

    /// Add a key under `key_name`, replacing any previous one.
    /// Returns the account address derived from the key.
    pub fn add(&self, key_name: &str, keypair: KeyPair) -> String {
        let address = keypair.public_key().to_account_id();
        self.keys.write().insert(key_name.to_owned(), keypair);
        address
    }
}

impl Keyring for LocalKeyring {
    fn sign(&self, key_name: &str, data: &[u8]) -> Result<Vec<u8>> {
        match self.keys.read().get(key_name) {
            Some(keypair) => keypair.sign(data),
            None => Err(Error::new_ext(
                ErrorKind::Internal,
                format!("key '{}' not in keyring", key_name),
            )),
        }
    }

    fn public_key(&self, key_name: &str) -> Result<PublicKey> {
        self.keys
            .read()
            .get(key_name)
            .map(|keypair| keypair.public_key())
            .ok_or_else(|| {
                Error::new_ext(
                    ErrorKind::Internal,
                    format!("key '{}' not in keyring", key_name),
                )
            })
    }
}
