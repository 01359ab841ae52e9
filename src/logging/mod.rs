//! Logging bootstrap: console + append-mode file layers, both behind the
//! secret-masking writer. Rotation of the file itself is handled externally.

pub mod redact;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// `level_override` (from `--log-level`) wins over the configured level.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let env_filter =
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_path = Path::new(&config.file);
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(MaskingMakeWriter::new(io::stdout)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(MaskingMakeWriter::new(Mutex::new(log_file))),
        )
        .init();

    Ok(())
}

/// `MakeWriter` wrapper that redacts secrets from every formatted line.
pub struct MaskingMakeWriter<M> {
    inner: M,
}

impl<M> MaskingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for MaskingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = MaskingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter {
            inner: self.inner.make_writer(),
        }
    }
}

pub struct MaskingWriter<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let masked = redact::redact(&text);
        self.inner.write_all(masked.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn masking_writer_redacts_before_sink() {
        let mut sink: Vec<u8> = Vec::new();
        {
            let mut writer = MaskingWriter { inner: &mut sink };
            writer
                .write_all(b"url https://craig.chat/rec/x?key=secretsecret end\n")
                .unwrap();
        }
        let written = String::from_utf8(sink).unwrap();
        assert!(written.contains("?key=***"));
        assert!(!written.contains("secretsecret"));
    }

    #[test]
    fn masking_writer_reports_original_length() {
        let mut sink: Vec<u8> = Vec::new();
        let mut writer = MaskingWriter { inner: &mut sink };
        let buf = b"key sk-ant-REDACTED\n";
        let n = writer.write(buf).unwrap();
        assert_eq!(n, buf.len());
    }
}
