/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Graph building utilities for structured control flow.
//!
//! The [GraphBuilder] keeps a _cursor_, the last fixed node of the open control sequence. Fixed nodes are appended after
//! the cursor. Branches and loops are built via callbacks that receive a builder for the nested sequence. Values that
//! leave a nested sequence are merged via phis.

use crate::{
    err::GraphError,
    nodes::{CallTarget, FieldDesc, NodeKind, ObjectShape, PhiKind, ValueKind},
    Graph, NodeRef,
};

pub struct GraphBuilder<'a> {
    ctx: &'a mut Graph,
    cursor: Option<NodeRef>,
}

impl<'a> GraphBuilder<'a> {
    ///Starts building right after the graph's `Start` node.
    pub fn new(ctx: &'a mut Graph) -> Self {
        let cursor = Some(ctx.start());
        GraphBuilder { ctx, cursor }
    }

    ///Starts building after `cursor`, which must be an open fixed node.
    pub fn at(ctx: &'a mut Graph, cursor: NodeRef) -> Self {
        GraphBuilder {
            ctx,
            cursor: Some(cursor),
        }
    }

    pub fn ctx(&self) -> &Graph {
        &*self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut Graph {
        &mut *self.ctx
    }

    ///The last fixed node of the open sequence. `None` after the sequence was terminated by a return.
    pub fn cursor(&self) -> Option<NodeRef> {
        self.cursor
    }

    fn open_cursor(&self) -> Result<NodeRef, GraphError> {
        self.cursor.ok_or(GraphError::MalformedControlFlow {
            node: self.ctx.start(),
            reason: "control sequence was already terminated".to_owned(),
        })
    }

    fn nested(&mut self, cursor: NodeRef) -> GraphBuilder<'_> {
        GraphBuilder {
            ctx: &mut *self.ctx,
            cursor: Some(cursor),
        }
    }

    ///Appends a fixed node after the cursor.
    pub fn append(&mut self, kind: NodeKind, inputs: &[NodeRef]) -> Result<NodeRef, GraphError> {
        if !kind.is_fixed_with_next() {
            return Err(GraphError::UnexpectedKind {
                expected: "fixed with next",
                found: kind.name(),
            });
        }
        let cursor = self.open_cursor()?;
        let node = self.ctx.add(kind, inputs);
        self.ctx.set_next(cursor, node)?;
        self.cursor = Some(node);
        Ok(node)
    }

    pub fn floating(&mut self, kind: NodeKind, inputs: &[NodeRef]) -> NodeRef {
        self.ctx.add(kind, inputs)
    }

    pub fn int(&mut self, value: i64) -> NodeRef {
        self.ctx.int(value)
    }

    pub fn bool(&mut self, value: bool) -> NodeRef {
        self.ctx.bool(value)
    }

    pub fn null(&mut self) -> NodeRef {
        self.ctx.null()
    }

    pub fn parameter(&mut self, index: u32, kind: ValueKind) -> NodeRef {
        self.ctx.parameter(index, kind)
    }

    pub fn new_instance(&mut self, shape: ObjectShape) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::NewInstance(shape), &[])
    }

    pub fn new_array(&mut self, elem: ValueKind, length: usize) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::NewArray { elem, length }, &[])
    }

    pub fn load_field(&mut self, object: NodeRef, field: FieldDesc) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::LoadField(field), &[object])
    }

    pub fn store_field(
        &mut self,
        object: NodeRef,
        field: FieldDesc,
        value: NodeRef,
    ) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::StoreField(field), &[object, value])
    }

    pub fn load_indexed(
        &mut self,
        array: NodeRef,
        elem: ValueKind,
        index: NodeRef,
    ) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::LoadIndexed(elem), &[array, index])
    }

    pub fn store_indexed(
        &mut self,
        array: NodeRef,
        elem: ValueKind,
        index: NodeRef,
        value: NodeRef,
    ) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::StoreIndexed(elem), &[array, index, value])
    }

    pub fn invoke(&mut self, target: CallTarget, args: &[NodeRef]) -> Result<NodeRef, GraphError> {
        self.append(NodeKind::Invoke(target), args)
    }

    ///Records a frame state capturing `locals`.
    pub fn frame_state(&mut self, bci: u32, locals: &[NodeRef]) -> Result<NodeRef, GraphError> {
        self.append(
            NodeKind::FrameState {
                bci,
                locals: locals.len(),
            },
            locals,
        )
    }

    ///Terminates the sequence.
    pub fn ret(&mut self, value: Option<NodeRef>) -> Result<NodeRef, GraphError> {
        let cursor = self.open_cursor()?;
        let inputs: &[NodeRef] = match &value {
            Some(v) => std::slice::from_ref(v),
            None => &[],
        };
        let ret = self.ctx.add(NodeKind::Return, inputs);
        self.ctx.set_next(cursor, ret)?;
        self.cursor = None;
        Ok(ret)
    }

    ///Builds a two-way branch on `cond`. Both callbacks return the values they want to hand to the code after the
    /// branch. Values that differ are merged via a phi, the merged values are returned.
    ///
    /// If one branch terminates, the values of the other one are returned unmerged. If both terminate, the sequence is terminated.
    pub fn if_else<T, F>(
        &mut self,
        cond: NodeRef,
        then_branch: T,
        else_branch: F,
    ) -> Result<Vec<NodeRef>, GraphError>
    where
        T: FnOnce(&mut GraphBuilder<'_>) -> Result<Vec<NodeRef>, GraphError>,
        F: FnOnce(&mut GraphBuilder<'_>) -> Result<Vec<NodeRef>, GraphError>,
    {
        let cursor = self.open_cursor()?;
        let split = self.ctx.add(NodeKind::If, &[cond]);
        self.ctx.set_next(cursor, split)?;
        let true_begin = self.ctx.add(NodeKind::Begin, &[]);
        let false_begin = self.ctx.add(NodeKind::Begin, &[]);
        self.ctx.set_successors(split, &[true_begin, false_begin])?;

        let (true_values, true_cursor) = {
            let mut nested = self.nested(true_begin);
            let values = then_branch(&mut nested)?;
            (values, nested.cursor)
        };
        let (false_values, false_cursor) = {
            let mut nested = self.nested(false_begin);
            let values = else_branch(&mut nested)?;
            (values, nested.cursor)
        };

        match (true_cursor, false_cursor) {
            (Some(t), Some(f)) => {
                if true_values.len() != false_values.len() {
                    return Err(GraphError::MalformedControlFlow {
                        node: split,
                        reason: format!(
                            "branches yield {} and {} values",
                            true_values.len(),
                            false_values.len()
                        ),
                    });
                }
                let merge = self.ctx.add(NodeKind::Merge, &[]);
                for tail in [t, f] {
                    let end = self.ctx.add(NodeKind::End, &[]);
                    self.ctx.set_next(tail, end)?;
                    self.ctx.add_end(merge, end)?;
                }
                let mut merged = Vec::with_capacity(true_values.len());
                for (tv, fv) in true_values.into_iter().zip(false_values) {
                    if tv == fv {
                        merged.push(tv);
                    } else {
                        merged.push(self.ctx.add_phi(merge, PhiKind::Value, &[tv, fv])?);
                    }
                }
                self.cursor = Some(merge);
                Ok(merged)
            }
            (Some(t), None) => {
                self.cursor = Some(t);
                Ok(true_values)
            }
            (None, Some(f)) => {
                self.cursor = Some(f);
                Ok(false_values)
            }
            (None, None) => {
                self.cursor = None;
                Ok(Vec::new())
            }
        }
    }

    ///Builds a loop that carries `entry` values.
    ///
    /// `header` computes the loop condition from the loop-carried values, `body` returns the values for the next iteration.
    /// The loop is left when the condition is false. Returns the loop-carried values as seen after the loop.
    pub fn while_loop<H, B>(
        &mut self,
        entry: &[NodeRef],
        header: H,
        body: B,
    ) -> Result<Vec<NodeRef>, GraphError>
    where
        H: FnOnce(&mut GraphBuilder<'_>, &[NodeRef]) -> Result<NodeRef, GraphError>,
        B: FnOnce(&mut GraphBuilder<'_>, &[NodeRef]) -> Result<Vec<NodeRef>, GraphError>,
    {
        let cursor = self.open_cursor()?;
        let forward_end = self.ctx.add(NodeKind::End, &[]);
        self.ctx.set_next(cursor, forward_end)?;
        let loop_begin = self.ctx.add(NodeKind::LoopBegin, &[]);
        self.ctx.add_end(loop_begin, forward_end)?;

        let mut phis = Vec::with_capacity(entry.len());
        for value in entry {
            phis.push(self.ctx.add_phi(loop_begin, PhiKind::Value, &[*value])?);
        }

        let (cond, header_tail) = {
            let mut nested = self.nested(loop_begin);
            let cond = header(&mut nested, &phis)?;
            (cond, nested.open_cursor()?)
        };
        let split = self.ctx.add(NodeKind::If, &[cond]);
        self.ctx.set_next(header_tail, split)?;
        let body_begin = self.ctx.add(NodeKind::Begin, &[]);
        let exit_begin = self.ctx.add(NodeKind::Begin, &[]);
        self.ctx.set_successors(split, &[body_begin, exit_begin])?;

        let (back_values, body_tail) = {
            let mut nested = self.nested(body_begin);
            let values = body(&mut nested, &phis)?;
            (values, nested.cursor)
        };

        if let Some(tail) = body_tail {
            if back_values.len() != phis.len() {
                return Err(GraphError::MalformedControlFlow {
                    node: loop_begin,
                    reason: format!(
                        "loop carries {} values, but body yields {}",
                        phis.len(),
                        back_values.len()
                    ),
                });
            }
            let loop_end = self.ctx.add(NodeKind::LoopEnd, &[]);
            self.ctx.set_next(tail, loop_end)?;
            self.ctx.add_end(loop_begin, loop_end)?;
            for (phi, value) in phis.iter().zip(back_values) {
                self.ctx.add_phi_input(*phi, value)?;
            }
        } else {
            for phi in phis.iter() {
                self.ctx.close_phi(*phi)?;
            }
        }

        self.cursor = Some(exit_begin);
        Ok(phis)
    }
}
