use std::collections::BTreeMap;

use uuid::Uuid;

use super::{Instruction, InstructionError, InstructionKind};
use crate::cache::context::RequestContext;

const DEFAULT_NONCE_TOKEN: &str = "{{pagefront:nonce}}";

fn required<'a>(
    name: &'static str,
    args: &'a BTreeMap<String, String>,
    arg: &'static str,
) -> Result<&'a str, InstructionError> {
    args.get(arg)
        .map(String::as_str)
        .ok_or(InstructionError::MissingArgument { name, arg })
}

/// Appends `text` to the body.
///
/// Not idempotent: two requests racing on the same queued entry both start
/// from the stored body, so last-writer-wins leaves a single append.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendText;

impl Instruction for AppendText {
    fn name(&self) -> &'static str {
        "append"
    }

    fn kind(&self) -> InstructionKind {
        InstructionKind::Ephemeral
    }

    fn apply(
        &self,
        body: &str,
        _ctx: &RequestContext,
        args: &BTreeMap<String, String>,
    ) -> Result<String, InstructionError> {
        let text = required(self.name(), args, "text")?;
        let mut out = String::with_capacity(body.len() + text.len());
        out.push_str(body);
        out.push_str(text);
        Ok(out)
    }
}

/// Replaces every `placeholder` with `value`. Idempotent once applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplacePlaceholder;

impl Instruction for ReplacePlaceholder {
    fn name(&self) -> &'static str {
        "replace"
    }

    fn kind(&self) -> InstructionKind {
        InstructionKind::Ephemeral
    }

    fn apply(
        &self,
        body: &str,
        _ctx: &RequestContext,
        args: &BTreeMap<String, String>,
    ) -> Result<String, InstructionError> {
        let placeholder = required(self.name(), args, "placeholder")?;
        let value = required(self.name(), args, "value")?;
        if placeholder.is_empty() {
            return Err(InstructionError::Failed {
                name: self.name(),
                reason: "placeholder is empty".to_string(),
            });
        }
        Ok(body.replace(placeholder, value))
    }
}

/// Stamps a fresh random token into every served body.
#[derive(Debug, Clone)]
pub struct RequestNonce {
    token: String,
}

impl RequestNonce {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Default for RequestNonce {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TOKEN)
    }
}

impl Instruction for RequestNonce {
    fn name(&self) -> &'static str {
        "nonce"
    }

    fn kind(&self) -> InstructionKind {
        InstructionKind::Perpetual
    }

    fn apply(
        &self,
        body: &str,
        _ctx: &RequestContext,
        _args: &BTreeMap<String, String>,
    ) -> Result<String, InstructionError> {
        if self.token.is_empty() || !body.contains(self.token.as_str()) {
            return Ok(body.to_string());
        }
        let nonce = Uuid::new_v4().simple().to_string();
        Ok(body.replace(self.token.as_str(), &nonce))
    }
}
