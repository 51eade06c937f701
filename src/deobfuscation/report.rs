//! Outcome of an unpacking run and its console rendering.

use std::{
    fmt::Write as _,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use crate::{
    deobfuscation::{cleanup::CleanupStats, strings::StringFailure},
    Error,
};

/// Heading printed above unresolved references.
pub const UNRESOLVED_HEADING: &str = "Could not load file or assembly or one of its dependencies:";

/// What an [`crate::deobfuscation::Unpacker`] run did.
#[derive(Debug, Default)]
pub struct UnpackReport {
    /// The protected input
    pub input: PathBuf,
    /// Where the result was written, once saved
    pub output: Option<PathBuf>,
    /// One [`Error::DependencyResolution`] per reference that could not be resolved at load time
    pub unresolved: Vec<Error>,
    /// Name of the native helper that was bound, if any
    pub native_helper: Option<String>,
    /// Virtualization stubs found
    pub stubs: usize,
    /// Stubs whose body was restored
    pub methods_recovered: usize,
    /// One [`Error::StubRecovery`] per stub left in place
    pub stub_failures: Vec<Error>,
    /// String lookup sites found
    pub string_sites: usize,
    /// String lookups replaced by literals
    pub strings_recovered: usize,
    /// String lookups left in place
    pub string_failures: Vec<StringFailure>,
    /// What cleanup removed
    pub cleanup: CleanupStats,
    /// Non-fatal problems
    pub warnings: Vec<String>,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl UnpackReport {
    /// Create an empty report for `input`.
    #[must_use]
    pub fn new(input: impl Into<PathBuf>) -> Self {
        UnpackReport {
            input: input.into(),
            ..UnpackReport::default()
        }
    }

    /// Returns true if every stub and every string site was recovered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stub_failures.is_empty() && self.string_failures.is_empty()
    }

    /// Multi-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Input:    {}", self.input.display());
        if let Some(output) = &self.output {
            let _ = writeln!(out, "Output:   {}", output.display());
        }
        if let Some(helper) = &self.native_helper {
            let _ = writeln!(out, "Helper:   {helper}");
        }
        let _ = writeln!(
            out,
            "Methods:  {}/{} recovered",
            self.methods_recovered, self.stubs
        );
        let _ = writeln!(
            out,
            "Strings:  {}/{} recovered",
            self.strings_recovered, self.string_sites
        );
        let _ = writeln!(out, "Removed:  {}", self.cleanup);
        if !self.unresolved.is_empty() {
            let _ = writeln!(out, "Unresolved references: {}", self.unresolved.len());
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "Warning:  {warning}");
        }
        let _ = write!(out, "Time:     {:.1}s", self.elapsed.as_secs_f64());
        out
    }

    /// Write the unresolved references and stub failures in console form.
    ///
    /// # Errors
    /// Returns any error of `out`.
    pub fn write_console<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_unresolved(out, &self.unresolved)?;
        write_stub_failures(out, &self.stub_failures)
    }
}

/// Write the unresolved reference block. Nothing is written for an empty list.
///
/// [`Error::DependencyResolution`] entries are written as the bare reference name.
///
/// # Errors
/// Returns any error of `out`.
pub fn write_unresolved<W: Write>(out: &mut W, unresolved: &[Error]) -> io::Result<()> {
    if unresolved.is_empty() {
        return Ok(());
    }
    writeln!(out, "{UNRESOLVED_HEADING}")?;
    for error in unresolved {
        match error {
            Error::DependencyResolution { reference } => writeln!(out, "{reference}")?,
            other => writeln!(out, "{other}")?,
        }
    }
    writeln!(out)
}

/// Write one `Error` / `Method` / `MDToken` block per failed stub.
///
/// Errors other than [`Error::StubRecovery`] are written as a single `Error:` line.
///
/// # Errors
/// Returns any error of `out`.
pub fn write_stub_failures<W: Write>(out: &mut W, failures: &[Error]) -> io::Result<()> {
    for failure in failures {
        match failure {
            Error::StubRecovery {
                method,
                token,
                source,
            } => {
                writeln!(out, "Error: {source}")?;
                writeln!(out, "Method: {method}")?;
                writeln!(out, "MDToken:{:08X}", token.value())?;
            }
            other => writeln!(out, "Error: {other}")?,
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::Token;

    fn render(report: &UnpackReport) -> String {
        let mut out = Vec::new();
        report.write_console(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn empty_report_prints_nothing() {
        let report = UnpackReport::new("Sample.exe");
        assert_eq!(render(&report), "");
        assert!(report.is_complete());
    }

    #[test]
    fn console_layout() {
        let mut report = UnpackReport::new("Sample.exe");
        report.unresolved = vec![
            Error::DependencyResolution {
                reference: "Foo, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null".into(),
            },
            Error::DependencyResolution {
                reference: "Bar, Version=2.0.0.0, Culture=neutral, PublicKeyToken=null".into(),
            },
        ];
        report.stub_failures.push(Error::StubRecovery {
            method: "Sample.Program::Main".into(),
            token: Token::new(0x0600_0002),
            source: Box::new(Error::Host("Invalid method index 3".into())),
        });

        assert_eq!(
            render(&report),
            "Could not load file or assembly or one of its dependencies:\n\
             Foo, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null\n\
             Bar, Version=2.0.0.0, Culture=neutral, PublicKeyToken=null\n\
             \n\
             Error: Invalid method index 3\n\
             Method: Sample.Program::Main\n\
             MDToken:06000002\n\
             \n"
        );
        assert!(!report.is_complete());
    }

    #[test]
    fn summary_mentions_counts() {
        let mut report = UnpackReport::new("Sample.exe");
        report.stubs = 3;
        report.methods_recovered = 2;
        report.output = Some(PathBuf::from("Sample-unpacked.exe"));
        let summary = report.summary();
        assert!(summary.contains("2/3 recovered"));
        assert!(summary.contains("Sample-unpacked.exe"));
    }
}
