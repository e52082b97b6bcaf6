/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! # Sonir-Opt
//!
//! Mid-tier optimizations on a [sonir] graph.
//!
//! The [Optimizer] owns the graph of a single compilation unit together with its [OptConfig] and [Statistics]. The passes
//! are implemented on the optimizer and can be run one by one, or as a whole via [Optimizer::run_pipeline]:
//!
//! 1. canonicalization, to get rid of trivially dead or foldable code,
//! 2. escape analysis, which replaces non-escaping allocations by their scalar field values,
//! 3. canonicalization again,
//! 4. floating reads, which detaches memory reads from the control sequence and attaches them to their last writer,
//! 5. read elimination, which replaces floating reads by the value that was last written,
//! 6. a final canonicalization.

use sonir::Graph;

pub mod config;
mod error;
pub mod inliner;
pub mod passes;
pub mod stats;

pub use config::OptConfig;
pub use error::OptError;
pub use inliner::{InlineContext, InlineError, InlineOutcome, Inliner, NoInline};
pub use passes::{CustomCanonicalizer, EscapeOutcome};
pub use stats::{Counter, Statistics};

///The optimizer of a single compilation unit.
pub struct Optimizer {
    pub(crate) graph: Graph,
    pub config: OptConfig,
    pub stats: Statistics,
}

impl Optimizer {
    pub fn new(graph: Graph) -> Self {
        Self::with_config(graph, OptConfig::default())
    }

    pub fn with_config(graph: Graph, config: OptConfig) -> Self {
        Optimizer {
            graph,
            config,
            stats: Statistics::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    ///Runs all enabled passes. Statistics are flushed at the end of the run, the flushed counters are returned.
    pub fn run_pipeline(&mut self, inliner: &mut dyn Inliner) -> Result<Statistics, OptError> {
        self.push_debug_state("initial");
        self.canonicalize()?;

        if self.config.escape_analysis {
            self.escape_analysis(inliner)?;
            self.push_debug_state("escape analysis");
            self.canonicalize()?;
        }
        if self.config.floating_reads {
            self.floating_reads()?;
            self.push_debug_state("floating reads");
            if self.config.read_elimination {
                self.eliminate_reads()?;
                self.push_debug_state("read elimination");
            }
        }
        self.canonicalize()?;
        self.push_debug_state("final");

        Ok(self.stats.flush())
    }

    ///Logs the whole graph, if dumping is enabled.
    pub fn push_debug_state(&self, phase: &str) {
        if !self.config.dump {
            return;
        }
        #[cfg(feature = "log")]
        log::info!("graph after {phase}:\n{}", self.graph.dump());
        #[cfg(not(feature = "log"))]
        let _ = phase;
    }

    ///Checks graph invariants after `pass`. Only active in debug builds.
    pub(crate) fn verify_after(&self, pass: &'static str) -> Result<(), OptError> {
        if cfg!(debug_assertions) {
            self.graph.verify().map_err(|e| match e {
                sonir::GraphError::Verification { node, reason } => {
                    OptError::invariant(pass, node, reason)
                }
                other => OptError::Graph(other),
            })?;
        }
        Ok(())
    }
}
