// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Duskcoin core
//! Transfer-tracking and blockchain-synchronization engine of the Duskcoin
//! wallet stack.
//!
//! The crate is organised around three tightly coupled pieces:
//! * [`primitives`] — the transaction object model: building, signing and
//!   validating ring-signature / multisignature transactions.
//! * [`transfers`] — per-account indexing of outputs and spends with
//!   rollback-safe detach semantics, fed by view-key scanning consumers.
//! * [`sync`] — the pull-based synchronizer that reconciles a remote node's
//!   chain and mempool view with the registered consumers.
//!
//! Networking, consensus and the block database live behind the
//! [`sync::NodeBackend`] seam and are not part of this crate.

pub mod codec;
pub mod crypto;
pub mod primitives;
pub mod sync;
pub mod transfers;
