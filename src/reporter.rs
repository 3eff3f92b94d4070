use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compilation,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Compilation => write!(f, "compile"),
            Phase::Runtime => write!(f, "runtime"),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub phase: Phase,
    pub msg: String,
    pub line: u32,
    /// For compile reports: " at 'lexeme'", " at end", or "".
    pub location: String,
    /// For runtime reports: one entry per active frame, deepest first.
    pub trace: Vec<String>,
}

impl Report {
    pub fn compile(msg: String, line: u32, location: String) -> Self {
        Report {
            phase: Phase::Compilation,
            msg,
            line,
            location,
            trace: Vec::new(),
        }
    }

    pub fn runtime(msg: String, line: u32, trace: Vec<String>) -> Self {
        Report {
            phase: Phase::Runtime,
            msg,
            line,
            location: String::new(),
            trace,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Phase::Compilation => {
                write!(f, "[line {}] Error{}: {}", self.line, self.location, self.msg)
            }
            Phase::Runtime => {
                write!(f, "{}", self.msg)?;
                for frame in &self.trace {
                    write!(f, "\n{}", frame)?;
                }
                Ok(())
            }
        }
    }
}

pub trait Reporter {
    fn warning(&mut self, report: Report);
    fn error(&mut self, report: Report);
}
