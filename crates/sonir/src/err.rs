/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */
use thiserror::Error;

use crate::NodeRef;

///Errors that happen when operating on the graph directly. For instance, when trying to remove
/// a node that is still in use, accessing a non-existent node, or splicing a control split.
///
/// All of those are defects of the caller. They are not recoverable for the current compilation unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("The node {0:?} is invalid. It might have been deleted since its creation.")]
    InvalidNode(NodeRef),

    #[error("Cannot remove {node:?}, it still has {usages} usages")]
    NodeHasUsages { node: NodeRef, usages: usize },

    #[error("Cannot remove {0:?}, it is still connected to the control sequence")]
    StillConnected(NodeRef),

    #[error("{0:?} is a fixed node, expected a floating node")]
    ExpectedFloating(NodeRef),
    #[error("{0:?} is a floating node, expected a fixed node")]
    ExpectedFixed(NodeRef),

    #[error("{0:?} is not connected to any control predecessor")]
    NotConnected(NodeRef),
    #[error("{0:?} already has a control predecessor")]
    AlreadyConnected(NodeRef),

    #[error("Expected a {expected} node kind, found {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0:?} can not be spliced, it is not a single-entry, single-exit fixed node")]
    NotSpliceable(NodeRef),

    #[error("Expected {node:?} to be a merge or loop header")]
    ExpectedMerge { node: NodeRef },
    #[error("Expected {node:?} to be a phi")]
    ExpectedPhi { node: NodeRef },

    #[error("Phi {phi:?} has {inputs} inputs, but its merge {merge:?} has {predecessors} predecessors")]
    PhiArityMismatch {
        phi: NodeRef,
        merge: NodeRef,
        inputs: usize,
        predecessors: usize,
    },
    #[error("Phi {0:?} is closed, no further inputs can be appended")]
    PhiClosed(NodeRef),

    #[error("Input {index} does not exist on {node:?}")]
    InvalidInput { node: NodeRef, index: usize },

    #[error("{user:?} is live, but uses the dead node {dead:?}")]
    LiveUsageOfDeadNode { user: NodeRef, dead: NodeRef },

    #[error("Malformed control flow at {node:?}: {reason}")]
    MalformedControlFlow { node: NodeRef, reason: String },

    #[error("Graph verification failed at {node:?}: {reason}")]
    Verification { node: NodeRef, reason: String },

    #[error("Interpreter fault at {node:?}: {reason}")]
    Interpreter { node: NodeRef, reason: String },
    #[error("Interpreter ran out of fuel after {0} steps")]
    OutOfFuel(usize),
}
