// Copyright (c) 2023 Octavian Oncescu
// Copyright (c) 2023 The Duskcoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod node;
mod observer;
mod state;
mod synchronizer;

pub use crate::sync::node::*;
pub use crate::sync::observer::*;
pub use crate::sync::state::*;
pub use crate::sync::synchronizer::*;
