use std::io::Write;
use std::sync::{Arc, RwLock};
use tracing_subscriber::fmt::MakeWriter;

use crate::core::masking::SecretMasker;

/// Shared set of values that must never reach a log line. Secrets are added
/// as soon as they are resolved.
pub type SharedMasker = Arc<RwLock<SecretMasker>>;

/// Where masked log lines go. `tap` receives a copy of every line, and
/// `quiet` keeps them off stderr.
#[derive(Clone)]
pub(crate) struct MaskingMakeWriter {
    pub masker: SharedMasker,
    pub tap: Option<tokio::sync::broadcast::Sender<String>>,
    pub quiet: bool,
}

impl MaskingMakeWriter {
    pub fn stderr(masker: SharedMasker) -> Self {
        Self {
            masker,
            tap: None,
            quiet: false,
        }
    }
}

impl<'a> MakeWriter<'a> for MaskingMakeWriter {
    type Writer = MaskingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter {
            masker: self.masker.clone(),
            tap: self.tap.clone(),
            quiet: self.quiet,
        }
    }
}

pub(crate) struct MaskingWriter {
    masker: SharedMasker,
    tap: Option<tokio::sync::broadcast::Sender<String>>,
    quiet: bool,
}

impl std::io::Write for MaskingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf);
        let masked = match self.masker.read() {
            Ok(masker) if !masker.is_empty() => masker.mask(&msg),
            Ok(_) => msg.into_owned(),
            // A poisoned masker could hide nothing; drop the line instead.
            Err(_) => return Ok(buf.len()),
        };
        if !self.quiet {
            std::io::stderr().write_all(masked.as_bytes())?;
        }
        if let Some(tap) = &self.tap {
            let _ = tap.send(masked); // no receivers is fine
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.quiet {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Unknown levels fall back to `info`.
pub fn init(level: &str, masker: SharedMasker) {
    let level = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(MaskingMakeWriter::stderr(masker))
        .try_init();
}
