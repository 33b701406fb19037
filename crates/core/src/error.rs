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

//! Error types of the execution layer.
//!
//! Transaction errors map to a transaction-level revert and the block
//! continues; block errors reject the whole block with no trie mutation.
//! Fatal storage errors never surface here - the engine aborts instead.

use ethereum_types::{H256, U256};
use std::fmt;

/// Validation failures that revert one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Sender cannot pay for the transfer or gas.
    InsufficientBalance {
        /// What the transaction needed.
        required: U256,
        /// What the sender had.
        available: U256,
    },
    /// Sender nonce does not match the account.
    NonceMismatch {
        /// Nonce in the account.
        expected: u64,
        /// Nonce in the transaction.
        got: u64,
    },
    /// Signature failed shape or recovery checks.
    InvalidSignature,
    /// A delegation authorization was malformed.
    InvalidAuthorization,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransactionError::InsufficientBalance {
                required,
                available,
            } => write!(f, "insufficient balance: need {required}, have {available}"),
            TransactionError::NonceMismatch { expected, got } => {
                write!(f, "nonce mismatch: expected {expected}, got {got}")
            }
            TransactionError::InvalidSignature => write!(f, "invalid signature"),
            TransactionError::InvalidAuthorization => write!(f, "invalid authorization"),
        }
    }
}

/// Validation failures that reject a whole block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Header fails a well-formedness rule.
    InvalidHeader(&'static str),
    /// The parent round names no known proposal.
    UnknownParent(u64),
    /// Executed state root differs from the header's.
    StateRootMismatch {
        /// Root the header claims.
        expected: H256,
        /// Root execution produced.
        got: H256,
    },
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BlockError::InvalidHeader(reason) => write!(f, "invalid header: {reason}"),
            BlockError::UnknownParent(round) => write!(f, "unknown parent round {round}"),
            BlockError::StateRootMismatch { expected, got } => {
                write!(f, "state root mismatch: header {expected}, computed {got}")
            }
        }
    }
}

/// Rejections surfaced by state-coupled precompiles; the literal message
/// is what the EVM returns as revert data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecompileError(pub &'static str);

impl fmt::Display for PrecompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
