//! # carve-analysis
//!
//! The carve analysis pipeline: control-flow recovery, CFG path covers,
//! symbolic context propagation, and structure synthesis.
//!
//! Three dependent stages process each function:
//! 1. [`FlowRecovery`] traces every function reachable from the image
//!    entry point and classifies its branches.
//! 2. [`Propagation`] computes a path cover per function and interprets
//!    the instruction stream against forked symbolic contexts.
//! 3. [`synth::synthesize`] turns observed memory-access patterns into
//!    typed struct definitions and links them across functions.

pub mod coverage;
pub mod error;
pub mod flow;
pub mod output;
pub mod propagate;
pub mod recovery;
pub mod struc;
pub mod synth;

#[cfg(test)]
mod testutil;

pub use coverage::{Path, PathCover, PathStep};
pub use error::AnalysisError;
pub use flow::{Call, Func, Jump, JumpKind};
pub use output::{render_all, render_struc};
pub use propagate::{FuncContexts, Propagation};
pub use recovery::{va_bounds, FlowRecovery};
pub use struc::{merge_strucs, new_struc, Field, FieldKind, StructDef, StrucRef};

use carve_emulate::Addr;
use carve_pe::PeImage;
use std::collections::BTreeMap;

/// Runs the full pipeline over one image.
pub fn recover_structs(
    image: &PeImage,
) -> Result<BTreeMap<String, StrucRef>, AnalysisError> {
    let mut funcs = FlowRecovery::new(image).analyze()?;
    let propagation = Propagation::analyze(&mut funcs);
    Ok(synth::synthesize(image, &funcs, &propagation))
}

/// Runs the pipeline and keeps the intermediate stages, for callers that
/// report per-stage progress.
pub struct Pipeline<'a> {
    image: &'a PeImage,
    /// Recovered functions keyed by entry offset.
    pub funcs: BTreeMap<Addr, Func>,
    /// Propagated contexts.
    pub propagation: Propagation,
}

impl<'a> Pipeline<'a> {
    /// Stage 1: control-flow recovery.
    pub fn recover(image: &'a PeImage) -> Result<Self, AnalysisError> {
        let funcs = FlowRecovery::new(image).analyze()?;
        Ok(Self {
            image,
            funcs,
            propagation: Propagation::default(),
        })
    }

    /// Stage 2: context propagation.
    pub fn propagate(&mut self) {
        self.propagation = Propagation::analyze(&mut self.funcs);
    }

    /// Stage 3: structure synthesis.
    pub fn synthesize(&self) -> BTreeMap<String, StrucRef> {
        synth::synthesize(self.image, &self.funcs, &self.propagation)
    }
}
