//! Human-readable per-kernel trace of the adaptation buffers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

/// Replace path separators so a kernel name can be used as a file name.
pub(crate) fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Path `<prefix><kernel><ext>`, when `prefix` is set.
pub(crate) fn kernel_path(prefix: Option<&str>, kernel: &str, ext: &str) -> Option<PathBuf> {
    prefix.map(|p| PathBuf::from(format!("{p}{}{ext}", sanitize_filename(kernel))))
}

/// Snapshot written after every measurement.
pub(crate) struct TraceSnapshot<'a> {
    pub kernel: &'a str,
    pub phase: u8,
    pub waves: u32,
    pub best_wave: u32,
    pub measure: &'a [u64],
    pub reference: &'a [u64],
    pub ratio: &'a [u64],
}

/// Optional trace file.  Open or write failures turn the sink off.
#[derive(Default)]
pub(crate) struct TraceSink {
    writer: Option<BufWriter<File>>,
}

impl TraceSink {
    pub fn open(prefix: Option<&str>, kernel: &str) -> Self {
        let Some(path) = kernel_path(prefix, kernel, ".txt") else {
            return Self::default();
        };
        match File::create(&path) {
            Ok(f) => Self { writer: Some(BufWriter::new(f)) },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "wave limiter trace disabled");
                Self::default()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn write(&mut self, s: &TraceSnapshot<'_>) {
        let Some(w) = self.writer.as_mut() else {
            return;
        };
        if Self::write_snapshot(w, s).is_err() {
            self.writer = None;
        }
    }

    fn write_snapshot(w: &mut impl Write, s: &TraceSnapshot<'_>) -> std::io::Result<()> {
        writeln!(
            w,
            "[WaveLimiter] {} state={} waves={} bestWave={}",
            s.kernel, s.phase, s.waves, s.best_wave
        )?;
        for (label, row) in [("measure", s.measure), ("reference", s.reference), ("ratio", s.ratio)] {
            write!(w, " {label} =")?;
            for v in row {
                write!(w, " {v}")?;
            }
            writeln!(w)?;
        }
        writeln!(w)?;
        w.flush()
    }
}
