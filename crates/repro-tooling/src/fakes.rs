//! Scripted command runner (testing only)
//!
//! `ScriptedRunner` records every [`ToolCommand`] it receives and answers
//! from a list of rules instead of spawning processes. Unmatched commands
//! succeed with empty output.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, ToolCommand};
use crate::Result;

type Handler = Arc<dyn Fn(&ToolCommand) -> Result<CommandOutput> + Send + Sync>;

struct Rule {
    program: String,
    args: Vec<String>,
    handler: Handler,
}

impl Rule {
    fn matches(&self, command: &ToolCommand) -> bool {
        command.program == self.program && self.args.iter().all(|a| command.has_arg(a))
    }
}

/// Command runner answering from scripted rules.
///
/// Rules match on the program name plus a set of arguments that must all
/// be present. The most recently added matching rule wins.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer matching commands with a fixed output.
    pub fn on(&self, program: &str, args: &[&str], output: CommandOutput) -> &Self {
        self.on_with(program, args, move |_| Ok(output.clone()))
    }

    /// Answer matching commands by calling `handler`, which may also touch
    /// the filesystem the way the real tool would.
    pub fn on_with<F>(&self, program: &str, args: &[&str], handler: F) -> &Self
    where
        F: Fn(&ToolCommand) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Every command received so far, in order.
    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands received for `program`.
    pub fn calls_to(&self, program: &str) -> Vec<ToolCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn was_called(&self, program: &str) -> bool {
        !self.calls_to(program).is_empty()
    }

    /// Whether some command for `program` carried every arg in `args`.
    pub fn was_called_with(&self, program: &str, args: &[&str]) -> bool {
        self.calls_to(program)
            .iter()
            .any(|c| args.iter().all(|a| c.has_arg(a)))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.clone());
        let handler = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.matches(command))
            .map(|r| Arc::clone(&r.handler));
        match handler {
            Some(handler) => handler(command),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
