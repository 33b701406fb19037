// Copyright 2023-2026 Chainstate contributors.
// This file is part of Chainstate.

// Chainstate is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Chainstate is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Chainstate.  If not, see <http://www.gnu.org/licenses/>.

//! Account state expressed as Plain Old Data.

use ethereum_types::{H256, U256};
use keccak_hash::KECCAK_EMPTY;
use rlp::{DecoderError, Rlp, RlpStream};

/// The balance, nonce and code hash of an account, as stored in the state
/// trie. Code bodies live in a separate table keyed by their hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Number of transactions sent from this account.
    pub nonce: u64,
    /// Wei owned by this account.
    pub balance: U256,
    /// Keccak of the account's bytecode; `KECCAK_EMPTY` for plain accounts.
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Account {
        Account {
            nonce: 0,
            balance: U256::zero(),
            code_hash: KECCAK_EMPTY,
        }
    }
}

impl Account {
    /// Create a plain account with the given balance and nonce.
    pub fn new_basic(balance: U256, nonce: u64) -> Account {
        Account {
            nonce,
            balance,
            code_hash: KECCAK_EMPTY,
        }
    }

    /// Whether the account is indistinguishable from a never-touched one.
    pub fn is_null(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == KECCAK_EMPTY
    }

    /// Whether this account carries contract code.
    pub fn has_code(&self) -> bool {
        self.code_hash != KECCAK_EMPTY
    }

    /// RLP encoding stored as the trie leaf value.
    pub fn rlp(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.nonce);
        stream.append(&self.balance);
        stream.append(&self.code_hash);
        stream.out().to_vec()
    }

    /// Decode an account from its trie leaf value.
    pub fn from_rlp(bytes: &[u8]) -> Result<Account, DecoderError> {
        let rlp = Rlp::new(bytes);
        Ok(Account {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            code_hash: rlp.val_at(2)?,
        })
    }
}
