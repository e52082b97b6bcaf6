/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

use super::LocationIdentity;

///What a phi unifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhiKind {
    ///Ordinary SSA value.
    Value,
    ///The last writer of `LocationIdentity` along each incoming edge.
    Memory(LocationIdentity),
}

///Lifecycle of a phi's input list. Inputs are append-only, the state tells how many are expected.
///
/// - Merge phis start [Open](PhiState::Open) and are [Closed](PhiState::Closed) once there is one input per predecessor.
/// - Loop-header phis start in [ReceivingBackEdges](PhiState::ReceivingBackEdges) with only the forward-edge input and are
///   closed after every loop-end supplied its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhiState {
    Open,
    ReceivingBackEdges,
    Closed,
}

///A merge-point value combinator. Anchored at its merge (or loop header) with one input per predecessor
/// in predecessor order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhiNode {
    pub kind: PhiKind,
    pub state: PhiState,
}

impl PhiNode {
    pub fn value() -> Self {
        PhiNode {
            kind: PhiKind::Value,
            state: PhiState::Open,
        }
    }

    pub fn memory(location: LocationIdentity) -> Self {
        PhiNode {
            kind: PhiKind::Memory(location),
            state: PhiState::Open,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.kind, PhiKind::Memory(_))
    }

    pub fn location(&self) -> Option<LocationIdentity> {
        if let PhiKind::Memory(l) = self.kind {
            Some(l)
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == PhiState::Closed
    }

    ///Computes the next state after the input list grew to `inputs` on a merge with `predecessors` incoming edges.
    pub(crate) fn advance(&mut self, inputs: usize, predecessors: usize, is_loop: bool) {
        self.state = match self.state {
            PhiState::Closed => PhiState::Closed,
            PhiState::Open | PhiState::ReceivingBackEdges if is_loop => {
                //A loop phi is only complete, once at least one back-edge exists and is filled.
                if predecessors > 1 && inputs == predecessors {
                    PhiState::Closed
                } else {
                    PhiState::ReceivingBackEdges
                }
            }
            PhiState::Open | PhiState::ReceivingBackEdges => {
                if inputs == predecessors {
                    PhiState::Closed
                } else {
                    PhiState::Open
                }
            }
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_phi_closes_on_full_arity() {
        let mut phi = PhiNode::value();
        phi.advance(1, 2, false);
        assert!(phi.state == PhiState::Open);
        phi.advance(2, 2, false);
        assert!(phi.state == PhiState::Closed);
    }

    #[test]
    fn loop_phi_waits_for_back_edges() {
        let mut phi = PhiNode::value();
        phi.advance(1, 1, true);
        assert!(phi.state == PhiState::ReceivingBackEdges);
        phi.advance(2, 3, true);
        assert!(phi.state == PhiState::ReceivingBackEdges);
        phi.advance(3, 3, true);
        assert!(phi.state == PhiState::Closed);
    }
}
