// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod container;
mod consumer;
mod synchronizer;
mod types;

pub use crate::transfers::container::*;
pub use crate::transfers::consumer::*;
pub use crate::transfers::synchronizer::*;
pub use crate::transfers::types::*;
