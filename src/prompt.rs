//! User interaction seam
//!
//! Planners ask questions through the `Prompter` trait so that the planning
//! logic can be driven by a terminal in production and by a scripted queue of
//! answers in tests.

use crate::error::{LayoutError, Result};
use dialoguer::{Confirm, Input, Password, Select};

pub trait Prompter {
    /// Yes/no question.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// Pick one entry from `items`, returning its index.
    fn select(&self, question: &str, items: &[String], default: usize) -> Result<usize>;

    /// Free-form line of text.
    fn input(&self, question: &str, default: Option<&str>) -> Result<String>;

    /// Secret entered twice, never echoed.
    fn password(&self, question: &str) -> Result<String>;

    /// Show a message and wait for acknowledgment.
    fn notify(&self, message: &str) -> Result<()>;
}

/// Terminal prompter backed by dialoguer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompter;

fn prompt_err(e: dialoguer::Error) -> LayoutError {
    LayoutError::prompt(e.to_string())
}

impl Prompter for ConsolePrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        Confirm::new()
            .with_prompt(question)
            .default(default)
            .interact()
            .map_err(prompt_err)
    }

    fn select(&self, question: &str, items: &[String], default: usize) -> Result<usize> {
        if items.is_empty() {
            return Err(LayoutError::prompt(format!("nothing to choose for '{}'", question)));
        }
        Select::new()
            .with_prompt(question)
            .items(items)
            .default(default.min(items.len() - 1))
            .interact()
            .map_err(prompt_err)
    }

    fn input(&self, question: &str, default: Option<&str>) -> Result<String> {
        let mut input = Input::<String>::new().with_prompt(question);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        input.interact_text().map_err(prompt_err)
    }

    fn password(&self, question: &str) -> Result<String> {
        Password::new()
            .with_prompt(question)
            .with_confirmation("Repeat passphrase", "Passphrases do not match")
            .interact()
            .map_err(prompt_err)
    }

    fn notify(&self, message: &str) -> Result<()> {
        eprintln!("{}", message);
        Input::<String>::new()
            .with_prompt("Press Enter to continue")
            .allow_empty(true)
            .interact_text()
            .map(|_| ())
            .map_err(prompt_err)
    }
}
