/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Config options for the optimizer

use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptConfig {
    ///How often a single node is processed by one canonicalizer run. Nodes that would be processed more often are
    /// skipped for the rest of the run.
    pub canonicalizer_max_revisits: usize,
    ///How often escape analysis inlines call sites of a single allocation before giving up on it.
    pub escape_max_retries: usize,
    ///Minimum weight of an allocation's non-escaping usages before inlining is considered.
    pub escape_min_weight: f64,

    pub escape_analysis: bool,
    pub floating_reads: bool,
    pub read_elimination: bool,

    ///Logs the whole graph between the pipeline phases.
    pub dump: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            canonicalizer_max_revisits: 10,
            escape_max_retries: 3,
            escape_min_weight: 10.0,
            escape_analysis: true,
            floating_reads: true,
            read_elimination: true,
            dump: false,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok()
}

impl OptConfig {
    ///The default config, overwritten by whatever is set in the environment:
    ///
    /// - `SONIR_CANON_MAX_REVISITS`, `SONIR_EA_MAX_RETRIES` and `SONIR_EA_MIN_WEIGHT` set the bounds,
    /// - `SONIR_NO_EA`, `SONIR_NO_FLOATING_READS`, `SONIR_NO_READ_ELIM` disable passes,
    /// - `SONIR_DUMP_ALL` enables graph dumps.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_value("SONIR_CANON_MAX_REVISITS") {
            config.canonicalizer_max_revisits = v;
        }
        if let Some(v) = env_value("SONIR_EA_MAX_RETRIES") {
            config.escape_max_retries = v;
        }
        if let Some(v) = env_value("SONIR_EA_MIN_WEIGHT") {
            config.escape_min_weight = v;
        }
        if env_flag("SONIR_NO_EA") {
            config.escape_analysis = false;
        }
        if env_flag("SONIR_NO_FLOATING_READS") {
            config.floating_reads = false;
        }
        if env_flag("SONIR_NO_READ_ELIM") {
            config.read_elimination = false;
        }
        if env_flag("SONIR_DUMP_ALL") {
            config.dump = true;
        }
        config
    }
}
