//! Built-in callback handlers
//!
//! # Overview
//!
//! - [`ConsoleCallbackHandler`] - Prints events to stdout
//! - [`FileCallbackHandler`] - Writes events to a file
//!
//! See [`crate::handler::NullCallbackHandler`] for the no-op handler.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Result;
use crate::handler::CallbackHandler;
use crate::run::Run;

/// Console callback handler that prints to stdout.
///
/// This handler prints execution events to the console, useful for debugging
/// and monitoring chain execution.
#[derive(Debug, Clone)]
pub struct ConsoleCallbackHandler {
    /// Whether to use colored output (ANSI codes).
    colored: bool,
}

impl ConsoleCallbackHandler {
    /// Create a new console callback handler.
    #[must_use]
    pub const fn new(colored: bool) -> Self {
        Self { colored }
    }

    fn print(&self, msg: &str) {
        println!("{msg}");
    }

    fn print_with_color(&self, msg: &str, bold: bool) {
        if self.colored && bold {
            println!("\x1b[1m{msg}\x1b[0m");
        } else {
            println!("{msg}");
        }
    }
}

impl Default for ConsoleCallbackHandler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CallbackHandler for ConsoleCallbackHandler {
    fn on_chain_start(
        &self,
        run: &Run,
        _inputs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.print_with_color(&format!("\n> Entering new {} chain...", run.name), true);
        Ok(())
    }

    fn on_chain_end(
        &self,
        _run: &Run,
        _outputs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.print_with_color("\n> Finished chain.", true);
        Ok(())
    }

    fn on_chain_error(&self, _run: &Run, error: &str) -> Result<()> {
        self.print(&format!("\n> Chain error: {error}"));
        Ok(())
    }

    fn on_llm_new_token(&self, _run: &Run, token: &str) -> Result<()> {
        print!("{token}");
        std::io::stdout().flush().ok();
        Ok(())
    }

    fn on_text(&self, _run: &Run, text: &str) -> Result<()> {
        self.print(text);
        Ok(())
    }

    fn on_tool_end(&self, _run: &Run, output: &str) -> Result<()> {
        self.print(&format!("Tool output: {output}"));
        Ok(())
    }
}

/// File callback handler that writes to a file.
///
/// This handler writes execution events to a file, useful for logging
/// and audit trails.
#[derive(Debug)]
pub struct FileCallbackHandler {
    /// File handle (mutex-guarded for concurrent dispatch).
    file: Mutex<std::fs::File>,
}

impl FileCallbackHandler {
    /// Create a new file callback handler.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the file to write to
    /// * `append` - If true, append to existing file; if false, truncate
    pub fn new(filepath: impl Into<PathBuf>, append: bool) -> Result<Self> {
        let filepath = filepath.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&filepath)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, msg: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{msg}")?;
        file.flush()?;
        Ok(())
    }
}

impl CallbackHandler for FileCallbackHandler {
    fn on_chain_start(
        &self,
        run: &Run,
        _inputs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.write(&format!("\n> Entering new {} chain...", run.name))
    }

    fn on_chain_end(
        &self,
        _run: &Run,
        _outputs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.write("\n> Finished chain.")
    }

    fn on_chain_error(&self, _run: &Run, error: &str) -> Result<()> {
        self.write(&format!("\n> Chain error: {error}"))
    }

    fn on_llm_new_token(&self, _run: &Run, token: &str) -> Result<()> {
        self.write(token)
    }

    fn on_text(&self, _run: &Run, text: &str) -> Result<()> {
        self.write(text)
    }

    fn on_tool_end(&self, _run: &Run, output: &str) -> Result<()> {
        self.write(&format!("Tool output: {output}"))
    }
}
