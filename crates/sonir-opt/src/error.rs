/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */
use sonir::{GraphError, NodeRef};
use thiserror::Error;

use crate::inliner::InlineError;

///Fatal optimizer errors. Any of those aborts the compilation of the current unit.
///
/// Passes that simply fail to optimize something (an allocation that escapes, a read that can not be resolved) do not
/// report an error, they leave the graph as it is.
#[derive(Debug, Error, Clone)]
pub enum OptError {
    #[error("Invariant violated in {pass} at {node:?}: {reason}")]
    InvariantViolation {
        pass: &'static str,
        node: NodeRef,
        reason: String,
    },

    #[error("Inlining failed: {0}")]
    Inline(#[from] InlineError),

    #[error("Internal graph error: {0}")]
    Graph(#[from] GraphError),
}

impl OptError {
    pub(crate) fn invariant(pass: &'static str, node: NodeRef, reason: impl Into<String>) -> Self {
        OptError::InvariantViolation {
            pass,
            node,
            reason: reason.into(),
        }
    }
}
