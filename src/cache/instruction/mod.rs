//! Serve-time body instructions.
//!
//! Ephemeral instructions ride inside a [`ResponseEntry`] and are consumed by
//! the first request that serves it; the engine then persists the rewritten
//! entry once. Perpetual instructions are registered process-wide and run on
//! every served body without touching the stored entry.

mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::warn;

use super::context::RequestContext;
use super::entry::{ResponseEntry, now_unix};

pub use builtin::{AppendText, ReplacePlaceholder, RequestNonce};

const METRIC_INSTRUCTION_ERROR: &str = "pagefront_cache_instruction_error_total";

/// When an instruction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// Applied once to a cached entry, then persisted away.
    Ephemeral,
    /// Applied to every served body, never persisted.
    Perpetual,
}

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("no ephemeral instruction registered as `{0}`")]
    Unknown(String),
    #[error("instruction `{name}` requires argument `{arg}`")]
    MissingArgument { name: &'static str, arg: &'static str },
    #[error("instruction `{name}` failed: {reason}")]
    Failed { name: &'static str, reason: String },
}

/// A body transformation.
pub trait Instruction: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> InstructionKind;

    /// Transform `body`. `args` come from the queued reference for ephemeral
    /// instructions and are empty for perpetual ones.
    fn apply(
        &self,
        body: &str,
        ctx: &RequestContext,
        args: &BTreeMap<String, String>,
    ) -> Result<String, InstructionError>;
}

/// Summary of one ephemeral drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub applied: usize,
    pub failed: usize,
}

impl Drained {
    /// Whether the entry changed and needs to be written back.
    pub fn needs_persist(&self) -> bool {
        self.applied + self.failed > 0
    }
}

/// Registered instructions, split by kind.
#[derive(Clone, Default)]
pub struct InstructionPipeline {
    ephemeral: HashMap<&'static str, Arc<dyn Instruction>>,
    perpetual: Vec<Arc<dyn Instruction>>,
}

impl InstructionPipeline {
    pub fn builder() -> InstructionPipelineBuilder {
        InstructionPipelineBuilder::default()
    }

    /// Pipeline with the built-in ephemeral instructions and no perpetual ones.
    pub fn with_defaults() -> InstructionPipelineBuilder {
        Self::builder()
            .instruction(AppendText)
            .instruction(ReplacePlaceholder)
    }

    pub fn perpetual_names(&self) -> Vec<&'static str> {
        self.perpetual.iter().map(|i| i.name()).collect()
    }

    pub fn knows_ephemeral(&self, name: &str) -> bool {
        self.ephemeral.contains_key(name)
    }

    /// Consume every queued instruction of `entry`, rewriting its body.
    ///
    /// The queue is always left empty: unknown or failing instructions are
    /// skipped with the body they were given left intact.
    pub fn drain_ephemeral(&self, entry: &mut ResponseEntry, ctx: &RequestContext) -> Drained {
        let mut drained = Drained::default();

        while let Some(queued) = entry.instructions.pop_front() {
            let result = match self.ephemeral.get(queued.name.as_str()) {
                Some(instruction) => run(instruction.as_ref(), &entry.body, ctx, &queued.args),
                None => Err(InstructionError::Unknown(queued.name.clone())),
            };

            match result {
                Ok(body) => {
                    entry.body = body;
                    drained.applied += 1;
                }
                Err(error) => {
                    record_failure(&queued.name, &error, ctx);
                    drained.failed += 1;
                }
            }
        }

        if drained.needs_persist() {
            entry.last_modified = now_unix();
        }
        drained
    }

    /// Run every perpetual instruction over `body`, in registration order.
    pub fn apply_perpetual(&self, body: String, ctx: &RequestContext) -> String {
        let no_args = BTreeMap::new();
        self.perpetual
            .iter()
            .fold(body, |body, instruction| {
                match run(instruction.as_ref(), &body, ctx, &no_args) {
                    Ok(next) => next,
                    Err(error) => {
                        record_failure(instruction.name(), &error, ctx);
                        body
                    }
                }
            })
    }

    /// Both passes: drain `entry`, then personalize the result for this request.
    pub fn apply(&self, entry: &mut ResponseEntry, ctx: &RequestContext) -> (String, Drained) {
        let drained = self.drain_ephemeral(entry, ctx);
        (self.apply_perpetual(entry.body.clone(), ctx), drained)
    }
}

fn run(
    instruction: &dyn Instruction,
    body: &str,
    ctx: &RequestContext,
    args: &BTreeMap<String, String>,
) -> Result<String, InstructionError> {
    catch_unwind(AssertUnwindSafe(|| instruction.apply(body, ctx, args))).unwrap_or_else(|_| {
        Err(InstructionError::Failed {
            name: instruction.name(),
            reason: "panicked".to_string(),
        })
    })
}

fn record_failure(name: &str, error: &InstructionError, ctx: &RequestContext) {
    counter!(METRIC_INSTRUCTION_ERROR).increment(1);
    warn!(
        instruction = name,
        error = %error,
        url = ctx.full_url(),
        "instruction skipped"
    );
}

/// Collects instructions; ephemeral ones are addressed by name, perpetual ones keep order.
#[derive(Default)]
pub struct InstructionPipelineBuilder {
    ephemeral: HashMap<&'static str, Arc<dyn Instruction>>,
    perpetual: Vec<Arc<dyn Instruction>>,
}

impl InstructionPipelineBuilder {
    pub fn instruction(self, instruction: impl Instruction + 'static) -> Self {
        self.shared(Arc::new(instruction))
    }

    /// Register an instruction; a later ephemeral registration replaces an earlier one of the same name.
    pub fn shared(mut self, instruction: Arc<dyn Instruction>) -> Self {
        match instruction.kind() {
            InstructionKind::Ephemeral => {
                self.ephemeral.insert(instruction.name(), instruction);
            }
            InstructionKind::Perpetual => self.perpetual.push(instruction),
        }
        self
    }

    pub fn build(self) -> InstructionPipeline {
        InstructionPipeline {
            ephemeral: self.ephemeral,
            perpetual: self.perpetual,
        }
    }
}
