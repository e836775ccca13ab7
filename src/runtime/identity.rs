//! Where the model name comes from.

use std::io::{self, BufRead, Write};

/// Supplies the model name once per session.
pub trait IdentitySource {
    fn model_name(&mut self) -> io::Result<String>;
}

/// Asks on a terminal: `Model name: `.
pub struct PromptIdentity<R, W> {
    input: R,
    output: W,
}

impl PromptIdentity<io::StdinLock<'static>, io::Stdout> {
    pub fn stdin() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> PromptIdentity<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> IdentitySource for PromptIdentity<R, W> {
    fn model_name(&mut self) -> io::Result<String> {
        write!(self.output, "Model name: ")?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input closed before a model name was entered",
            ));
        }
        Ok(line.trim().to_string())
    }
}

/// A name fixed up front (`--name`).
#[derive(Clone, Debug)]
pub struct FixedIdentity(pub String);

impl IdentitySource for FixedIdentity {
    fn model_name(&mut self) -> io::Result<String> {
        Ok(self.0.trim().to_string())
    }
}
