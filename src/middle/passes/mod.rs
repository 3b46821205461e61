//! Optimizer passes over the IR tree
//!
//! Independent rewrite passes composed by a driver: the inliner runs once,
//! then rematerialization and pruning repeat until neither reports a
//! change. Every pass operates in place on one disambiguated tree; no pass
//! retains a reference outside its call.

pub mod copier;
pub mod inliner;
pub mod metrics;
pub mod names;
pub mod rematerializer;
pub mod semantics;
pub mod unused_pruner;

use crate::error::{CoreError, Result};
use crate::middle::ir::Block;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Output-size bias of the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePreference {
    Small,
    #[default]
    Balanced,
}

/// Optimizer configuration
///
/// The thresholds are untuned empirical constants; they are configuration,
/// not a compatibility contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Master switch; when off, the driver is a no-op
    pub run_optimizer: bool,
    pub size_preference: SizePreference,
    /// Inline any callee smaller than this
    pub inline_small_size: usize,
    /// Inline callees smaller than this when a call argument is constant
    pub inline_constant_bonus_size: usize,
    /// Rematerialize values referenced at most this often
    pub remat_max_references: usize,
    /// ... when their evaluation cost is at most this
    pub remat_max_cost: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            run_optimizer: true,
            size_preference: SizePreference::Balanced,
            inline_small_size: 10,
            inline_constant_bonus_size: 50,
            remat_max_references: 5,
            remat_max_cost: 1,
        }
    }
}

impl OptimizerSettings {
    /// Settings with the optimizer disabled
    pub fn none() -> Self {
        Self {
            run_optimizer: false,
            ..Self::default()
        }
    }

    /// Settings biased toward small output: the constant bonus shrinks so
    /// inlining duplicates less code.
    pub fn small() -> Self {
        Self {
            size_preference: SizePreference::Small,
            inline_small_size: 6,
            inline_constant_bonus_size: 20,
            ..Self::default()
        }
    }
}

/// Safety cap for the driver loop; the passes' own invariants make real
/// runs converge in a handful of rounds.
const MAX_ROUNDS: usize = 64;

/// Run the full pass sequence to a fixpoint
///
/// `externally_used` names are treated as referenced from outside the tree
/// (entry-point dispatch targets) and survive pruning.
pub fn run_suite(
    block: &mut Block,
    settings: &OptimizerSettings,
    externally_used: &HashSet<String>,
) -> Result<()> {
    if !settings.run_optimizer {
        return Ok(());
    }
    let mut dispenser = names::NameDispenser::new(block);
    inliner::Inliner::run(block, &mut dispenser, settings)?;
    for round in 1..=MAX_ROUNDS {
        let rematerialized = rematerializer::Rematerializer::run(block, settings)?;
        let pruned = unused_pruner::UnusedPruner::run_until_stabilized(block, externally_used)?;
        debug!(round, rematerialized, pruned, "optimizer round");
        if !rematerialized && !pruned {
            return Ok(());
        }
    }
    Err(CoreError::internal("optimizer driver failed to stabilize"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::parser::parse_block;
    use crate::middle::ir::printer::print_block;

    #[test]
    fn test_suite_cleans_single_use_helper() {
        let mut block = parse_block(
            "{ let r := wrap(5) mstore(0, r) function wrap(x) -> y { y := add(x, 1) } }",
        )
        .unwrap();
        run_suite(&mut block, &OptimizerSettings::default(), &HashSet::new()).unwrap();
        let printed = print_block(&block);
        // The definition and the call are gone; the store reads the
        // inlined computation through its renamed return binding.
        assert!(!printed.contains("function wrap"));
        assert!(!printed.contains("wrap("));
        assert!(printed.contains("wrap_y := add(5, 1)"));
        assert!(printed.contains("mstore(0, wrap_y)"));
    }

    #[test]
    fn test_suite_disabled_is_identity() {
        let source = "{ let r := wrap(5) mstore(0, r) function wrap(x) -> y { y := add(x, 1) } }";
        let mut block = parse_block(source).unwrap();
        let original = block.clone();
        run_suite(&mut block, &OptimizerSettings::none(), &HashSet::new()).unwrap();
        assert!(crate::middle::ir::syntactic_eq(&original, &block));
    }
}
