/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */
//! Optimizer passes module.
//!
//! Each pass is implemented on the [Optimizer](crate::Optimizer) in its own module.

mod canonicalize;
mod escape;
mod floating_reads;
mod read_elimination;

pub use canonicalize::CustomCanonicalizer;
pub use escape::EscapeOutcome;
