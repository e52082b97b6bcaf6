/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Iterative dominator computation by Cooper, Harvey and Kennedy,
//! [_A Simple, Fast Dominance Algorithm_](https://www.cs.rice.edu/~keith/EMBED/dom.pdf).
//!
//! Works on dense indices, so the same code computes dominators (on the forward graph) and
//! post-dominators (on the reversed graph with a virtual exit).

///Computes the immediate dominator of every node.
///
/// - `order` is a reverse post order of the reachable nodes, starting with the entry.
/// - `preds[n]` lists the predecessors of node `n`.
///
/// Returns `idom[n]`. The entry dominates itself, unreachable nodes have `None`.
pub(crate) fn immediate_dominators(order: &[usize], preds: &[Vec<usize>]) -> Vec<Option<usize>> {
    let count = preds.len();
    let mut idom: Vec<Option<usize>> = vec![None; count];
    let Some(&entry) = order.first() else {
        return idom;
    };

    //position in `order`, used to walk up the tree.
    let mut rank = vec![usize::MAX; count];
    for (idx, n) in order.iter().enumerate() {
        rank[*n] = idx;
    }

    idom[entry] = Some(entry);
    let mut changed = true;
    while changed {
        changed = false;
        for &n in order.iter().skip(1) {
            let mut new_idom = None;
            for &p in preds[n].iter() {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(current) => intersect(&idom, &rank, p, current),
                });
            }
            if new_idom.is_some() && idom[n] != new_idom {
                idom[n] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(idom: &[Option<usize>], rank: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while rank[a] > rank[b] {
            let Some(up) = idom[a] else {
                return b;
            };
            a = up;
        }
        while rank[b] > rank[a] {
            let Some(up) = idom[b] else {
                return a;
            };
            b = up;
        }
    }
    a
}

///Reverse post order of the nodes reachable from `entry` via `succs`.
pub(crate) fn reverse_post_order(entry: usize, succs: &[Vec<usize>]) -> Vec<usize> {
    let mut visited = vec![false; succs.len()];
    let mut post = Vec::with_capacity(succs.len());
    let mut stack = vec![(entry, 0usize)];
    visited[entry] = true;
    while let Some((n, idx)) = stack.pop() {
        if idx < succs[n].len() {
            stack.push((n, idx + 1));
            let s = succs[n][idx];
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            post.push(n);
        }
    }
    post.reverse();
    post
}
