//! # Process Module
//!
//! Everything that touches external tool processes goes through here.
//!
//! - [`CommandSpec`]: a program plus its argument list, with a label used in
//!   logs and diagnostics.
//! - [`CommandTemplate`]: a [`CommandSpec`] with a `{reference}` placeholder,
//!   rendered once per track.
//! - [`ProcessSupervisor`]: spawns processes under a resolution *attempt* and
//!   terminates them as a group.
//! - [`AttemptGuard`]: owned handle to an attempt; dropping it terminates
//!   whatever the attempt still has running.

pub mod supervisor;

pub use supervisor::{AttemptGuard, AttemptId, ProcessExit, ProcessHandle, ProcessSupervisor};

use std::fmt;

/// Placeholder reemplazado por la referencia del track al renderizar.
pub const REFERENCE_PLACEHOLDER: &str = "{reference}";

/// Invocación concreta de una herramienta externa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Plantilla de invocación; los argumentos pueden contener `{reference}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(CommandSpec);

impl CommandTemplate {
    pub fn new(spec: CommandSpec) -> Self {
        Self(spec)
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn render(&self, reference: &str) -> CommandSpec {
        CommandSpec {
            label: self.0.label.clone(),
            program: self.0.program.clone(),
            args: self
                .0
                .args
                .iter()
                .map(|arg| arg.replace(REFERENCE_PLACEHOLDER, reference))
                .collect(),
        }
    }

    /// Invocación barata (`--version`) usada para precalentar la herramienta.
    pub fn version_check(&self, flag: &str) -> CommandSpec {
        CommandSpec::new(self.0.label.clone(), self.0.program.clone()).arg(flag)
    }
}
