use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

/// Removes ANSI colour sequences so the log file stays plain text.
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Appends to a log file and trims the oldest lines once the file grows past `max_lines`.
#[derive(Clone)]
pub struct LineCappedWriter {
    path: PathBuf,
    max_lines: u32,
    state: Arc<Mutex<WriterState>>,
}

struct WriterState {
    file: Option<File>,
    lines_since_prune: u32,
}

impl LineCappedWriter {
    pub fn new(path: impl Into<PathBuf>, max_lines: u32) -> Self {
        Self {
            path: path.into(),
            max_lines: max_lines.max(1),
            state: Arc::new(Mutex::new(WriterState {
                file: None,
                lines_since_prune: 0,
            })),
        }
    }

    /// Prune after writing a tenth of the cap, but never more often than every 50 lines.
    fn prune_threshold(&self) -> u32 {
        (self.max_lines / 10).max(50)
    }

    pub(crate) fn append(&self, msg: &str) {
        if let Err(e) = self.write_locked(msg.as_bytes()) {
            eprintln!("Failed to write log file: {}", e);
        }
    }

    fn write_locked(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            state.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(buf)?;
        }

        state.lines_since_prune += buf.iter().filter(|&&b| b == b'\n').count() as u32;
        if state.lines_since_prune >= self.prune_threshold() {
            // The handle points at the old inode after a rewrite, so drop it first.
            state.file = None;
            if let Err(e) = prune_file(&self.path, self.max_lines as usize) {
                eprintln!("Failed to prune log file: {}", e);
            }
            state.lines_since_prune = 0;
        }
        Ok(())
    }
}

fn prune_file(path: &Path, max_lines: usize) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .collect::<Result<_, _>>()?;
    if lines.len() <= max_lines {
        return Ok(());
    }

    let mut file = File::create(path)?;
    for line in &lines[lines.len() - max_lines..] {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

impl io::Write for LineCappedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_locked(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.state.lock().file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LineCappedWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colour_codes() {
        assert_eq!(strip_ansi_escapes("\x1b[32mINFO\x1b[0m ok"), "INFO ok");
    }

    #[test]
    fn keeps_only_newest_lines() {
        let path = std::env::temp_dir().join(format!("radiorelay-log-{}.log", uuid::Uuid::new_v4()));
        let writer = LineCappedWriter::new(&path, 10);
        for i in 0..120 {
            writer.append(&format!("line {}\n", i));
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines.len() <= 60, "file kept {} lines", lines.len());
        assert_eq!(lines.last(), Some(&"line 119"));
        let _ = std::fs::remove_file(&path);
    }
}
