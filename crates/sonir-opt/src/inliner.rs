/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Interface to the inliner. Deciding _whether_ to inline is up to the implementation, escape analysis only asks.

use sonir::{Graph, GraphError, NodeRef};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InlineError {
    #[error("Bailout while inlining {callee}: {reason}")]
    Bailout { callee: String, reason: String },
    #[error("Inlining produced a broken graph: {0}")]
    Graph(#[from] GraphError),
}

///Why the inliner is asked to inline a call site.
#[derive(Debug, Clone)]
pub struct InlineContext {
    ///The allocation that is passed to the call.
    pub allocation: NodeRef,
    ///Accumulated weight of the allocation's non-escaping usages.
    pub weight: f64,
    ///1 for the first round of inlining for this allocation.
    pub attempt: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InlineOutcome {
    ///The call was replaced. `new_nodes` are all nodes that were added to the graph.
    Inlined { new_nodes: Vec<NodeRef> },
    Declined,
}

pub trait Inliner {
    ///Tries to replace `invoke` with the body of its target.
    fn inline(
        &mut self,
        graph: &mut Graph,
        invoke: NodeRef,
        context: &InlineContext,
    ) -> Result<InlineOutcome, InlineError>;
}

///Inliner that declines every call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInline;

impl Inliner for NoInline {
    fn inline(
        &mut self,
        _graph: &mut Graph,
        _invoke: NodeRef,
        _context: &InlineContext,
    ) -> Result<InlineOutcome, InlineError> {
        Ok(InlineOutcome::Declined)
    }
}
