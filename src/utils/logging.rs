//! 日志初始化
//!
//! 两路输出共享一个 `log::Log`：
//! - stderr:  INFO (可被 `RUST_LOG` 覆盖)
//! - 日志文件: DEBUG, 按大小滚动 (1 MB × 10 个备份)
//!
//! 格式: `[<timestamp>: <LEVEL>] <message>`

use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 单个日志文件大小上限
pub const MAX_LOG_BYTES: u64 = 1024 * 1024;

/// 保留的备份文件数
pub const LOG_BACKUPS: usize = 10;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Log file error: {0}")]
    Io(#[from] io::Error),

    #[error("Logger already initialized: {0}")]
    SetLogger(#[from] log::SetLoggerError),
}

// ═══════════════════════════════════════════════════════════════════════════
// 滚动文件
// ═══════════════════════════════════════════════════════════════════════════

/// 按大小滚动的日志文件: `exch_srv.log` → `exch_srv.log.1` → ... → `exch_srv.log.N`
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups > 0 {
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 组合 Logger
// ═══════════════════════════════════════════════════════════════════════════

struct DualLogger {
    stderr: env_logger::Logger,
    file: env_logger::Logger,
}

impl Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.stderr.enabled(metadata) || self.file.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.stderr.matches(record) {
            self.stderr.log(record);
        }
        if self.file.matches(record) {
            self.file.log(record);
        }
    }

    fn flush(&self) {
        self.stderr.flush();
        self.file.flush();
    }
}

fn formatted(builder: &mut env_logger::Builder) -> &mut env_logger::Builder {
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}: {}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    })
}

/// 初始化全局日志
pub fn init(log_file: &Path) -> Result<(), LoggingError> {
    let mut stderr = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    formatted(&mut stderr).target(env_logger::Target::Stderr);
    let stderr = stderr.build();

    let writer = RotatingFile::open(log_file, MAX_LOG_BYTES, LOG_BACKUPS)?;
    let mut file = env_logger::Builder::new();
    formatted(&mut file)
        .filter_level(LevelFilter::Debug)
        .filter_module("h2", LevelFilter::Info)
        .filter_module("hyper", LevelFilter::Info)
        .filter_module("tower", LevelFilter::Info)
        .target(env_logger::Target::Pipe(Box::new(writer)));
    let file = file.build();

    let max_level = stderr.filter().max(file.filter());
    log::set_boxed_logger(Box::new(DualLogger { stderr, file }))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotating_file_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("exch_srv.log");
        let mut writer = RotatingFile::open(&path, 16, 2).unwrap();

        for line in ["aaaaaaaaaa\n", "bbbbbbbbbb\n", "cccccccccc\n", "dddddddddd\n"] {
            writer.write_all(line.as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "dddddddddd\n");
        assert_eq!(fs::read_to_string(path.with_extension("log.1")).unwrap(), "cccccccccc\n");
        assert_eq!(fs::read_to_string(path.with_extension("log.2")).unwrap(), "bbbbbbbbbb\n");
        assert!(!path.with_extension("log.3").exists());
    }

    #[test]
    fn test_rotating_file_appends_to_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exch_srv.log");
        fs::write(&path, "old\n").unwrap();

        let mut writer = RotatingFile::open(&path, 1024, 1).unwrap();
        writer.write_all(b"new\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
