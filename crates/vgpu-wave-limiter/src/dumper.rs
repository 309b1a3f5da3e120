//! Per-kernel CSV dump of every profiled invocation.

use crate::limiter::Phase;
use crate::trace::kernel_path;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Collects `(time, waves, phase)` per invocation and writes
/// `<prefix><kernel>.csv` when dropped.
pub struct DataDumper {
    path: Option<PathBuf>,
    rows: Vec<(u64, u32, Phase)>,
}

impl DataDumper {
    pub fn new(prefix: Option<&str>, kernel: &str) -> Self {
        Self { path: kernel_path(prefix, kernel, ".csv"), rows: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&mut self, time_ns: u64, waves: u32, phase: Phase) {
        if self.is_enabled() {
            self.rows.push((time_ns, waves, phase));
        }
    }

    pub fn rows(&self) -> &[(u64, u32, Phase)] {
        &self.rows
    }

    /// One `index,time,waves,phase` row per sample, without a header line.
    pub fn write_csv(&self, w: &mut impl Write) -> std::io::Result<()> {
        for (i, (time, waves, phase)) in self.rows.iter().enumerate() {
            writeln!(w, "{i},{time},{waves},{}", *phase as u8)?;
        }
        Ok(())
    }
}

impl Drop for DataDumper {
    fn drop(&mut self) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let written = File::create(path).and_then(|f| {
            let mut w = BufWriter::new(f);
            self.write_csv(&mut w)?;
            w.flush()
        });
        if let Err(e) = written {
            debug!(path = %path.display(), error = %e, "wave limiter dump not written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_dumper_keeps_nothing() {
        let mut d = DataDumper::new(None, "k");
        d.record(1, 2, Phase::Warmup);
        assert!(!d.is_enabled());
        assert!(d.rows().is_empty());
    }

    #[test]
    fn writes_csv_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/dump_", dir.path().display());
        {
            let mut d = DataDumper::new(Some(&prefix), "ns/k");
            d.record(1500, 8, Phase::Warmup);
            d.record(1400, 7, Phase::Adapt);
        }
        let csv = std::fs::read_to_string(dir.path().join("dump_ns_k.csv")).unwrap();
        assert_eq!(csv, "0,1500,8,0\n1,1400,7,1\n");
    }

    #[test]
    fn unwritable_path_is_silent() {
        let mut d = DataDumper::new(Some("/nonexistent/dir/x_"), "k");
        d.record(1, 1, Phase::Run);
        drop(d);
    }
}
