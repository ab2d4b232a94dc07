use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use anyhow::Result;

pub type LogFile = Arc<Mutex<BufWriter<File>>>;

/// Mirrors every line to stderr and, when opened with a file, to `logs/`.
#[derive(Clone, Default)]
pub struct Logger {
    file: Option<LogFile>,
}

impl Logger {
    /// Opens `logs/<prefix>_<timestamp>.log`. Returns the logger and the file path.
    pub fn open(prefix: &str) -> Result<(Self, String)> {
        std::fs::create_dir_all("logs")?;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = format!("logs/{}_{}.log", prefix, ts);
        let file = File::create(&path)?;
        eprintln!("Log: {}", path);
        Ok((Self { file: Some(Arc::new(Mutex::new(BufWriter::new(file)))) }, path))
    }

    pub fn stderr() -> Self {
        Self { file: None }
    }

    pub fn write_line(&self, msg: &str) {
        eprintln!("{}", msg);
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", msg);
                let _ = f.flush();
            }
        }
    }
}

#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {{
        $logger.write_line(&format!($($arg)*));
    }};
}
