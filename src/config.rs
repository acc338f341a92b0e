//! Engine configuration parameters.
//!
//! Parameters arrive in a textual `key=value` file loaded once at startup.
//! Blank lines and lines starting with `#` are ignored; anything else must
//! be a recognized `KEY=value` pair. Malformed lines and out-of-range values
//! are reported with their line number.
//!
//! Recognized keys:
//! - `MEMORY_SIZE` — total tuple-memory pool in bytes
//! - `QUEUE_SIZE` — per-queue capacity in pages
//! - `SHARED_QUEUE_SIZE` — system-stream output queue capacity in pages
//! - `INDEX_THRESHOLD` — hash-index load factor triggering a doubling (0..1)
//! - `RUN_TIME` — scheduler run length in logical units; 0 means forever
//! - `CPU_SPEED` — CPU clock in MHz, for converting tick measurements

use std::fs;
use std::path::Path;

use crate::error::RilletError;

/// Page size used by the memory manager and every downstream allocator.
pub const PAGE_SIZE: usize = 4096;

/// Engine parameters with their startup defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerParams {
    /// Total tuple-memory pool in bytes.
    pub memory_size: usize,
    /// Capacity of each inter-operator queue, in pages.
    pub queue_size_pages: usize,
    /// Capacity of each system-stream output queue, in pages.
    pub shared_queue_size_pages: usize,
    /// Hash-index load factor beyond which the bucket count doubles.
    pub index_threshold: f64,
    /// Scheduler run length in logical units; 0 runs until stopped.
    pub run_time: u64,
    /// CPU clock in MHz (tick-to-seconds conversion for the system stream).
    pub cpu_speed_mhz: u32,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            memory_size: 64 << 20, // 64 MiB
            queue_size_pages: 1,
            shared_queue_size_pages: 1,
            index_threshold: 0.85,
            run_time: 0,
            cpu_speed_mhz: 1000,
        }
    }
}

impl ServerParams {
    /// Number of pages in the memory pool.
    pub fn num_pages(&self) -> usize {
        self.memory_size / PAGE_SIZE
    }

    /// Capacity of a regular queue in elements.
    pub fn queue_capacity(&self) -> usize {
        queue_elements(self.queue_size_pages)
    }

    /// Capacity of a system-stream output queue in elements.
    pub fn shared_queue_capacity(&self) -> usize {
        queue_elements(self.shared_queue_size_pages)
    }

    /// Load parameters from a `key=value` config file, starting from
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self, RilletError> {
        let text = fs::read_to_string(path).map_err(|e| {
            RilletError::InvalidParam(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_str_content(&text)
    }

    /// Parse config-file content. Exposed separately so tests can avoid
    /// the filesystem.
    pub fn from_str_content(text: &str) -> Result<Self, RilletError> {
        let mut params = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(RilletError::InvalidParam(format!(
                    "config line {line_no}: expected KEY=value, got '{raw}'"
                )));
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "MEMORY_SIZE" => {
                    params.memory_size = parse_num(key, value, line_no)?;
                    if params.memory_size < PAGE_SIZE {
                        return Err(RilletError::InvalidParam(format!(
                            "config line {line_no}: MEMORY_SIZE must be at least one page ({PAGE_SIZE})"
                        )));
                    }
                }
                "QUEUE_SIZE" => {
                    params.queue_size_pages = parse_nonzero(key, value, line_no)?;
                }
                "SHARED_QUEUE_SIZE" => {
                    params.shared_queue_size_pages = parse_nonzero(key, value, line_no)?;
                }
                "INDEX_THRESHOLD" => {
                    let t: f64 = value.parse().map_err(|_| {
                        RilletError::InvalidParam(format!(
                            "config line {line_no}: INDEX_THRESHOLD must be a number"
                        ))
                    })?;
                    if !(t > 0.0 && t < 1.0) {
                        return Err(RilletError::InvalidParam(format!(
                            "config line {line_no}: INDEX_THRESHOLD must be in (0, 1), got {t}"
                        )));
                    }
                    params.index_threshold = t;
                }
                "RUN_TIME" => {
                    params.run_time = parse_num(key, value, line_no)? as u64;
                }
                "CPU_SPEED" => {
                    params.cpu_speed_mhz = parse_nonzero(key, value, line_no)? as u32;
                }
                other => {
                    return Err(RilletError::InvalidParam(format!(
                        "config line {line_no}: unknown key '{other}'"
                    )));
                }
            }
        }

        Ok(params)
    }
}

/// Elements that fit in the given number of queue pages.
fn queue_elements(pages: usize) -> usize {
    let elem = std::mem::size_of::<crate::exec::queue::Element>().max(1);
    ((pages * PAGE_SIZE) / elem).max(1)
}

fn parse_num(key: &str, value: &str, line_no: usize) -> Result<usize, RilletError> {
    value.parse().map_err(|_| {
        RilletError::InvalidParam(format!(
            "config line {line_no}: {key} must be a non-negative integer, got '{value}'"
        ))
    })
}

fn parse_nonzero(key: &str, value: &str, line_no: usize) -> Result<usize, RilletError> {
    let n = parse_num(key, value, line_no)?;
    if n == 0 {
        return Err(RilletError::InvalidParam(format!(
            "config line {line_no}: {key} must be positive"
        )));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = ServerParams::default();
        assert_eq!(p.memory_size, 64 << 20);
        assert_eq!(p.run_time, 0);
        assert!(p.index_threshold > 0.0 && p.index_threshold < 1.0);
        assert!(p.num_pages() > 0);
        assert!(p.queue_capacity() > 0);
    }

    #[test]
    fn test_parse_full_file() {
        let text = "\
# engine config
MEMORY_SIZE = 1048576

QUEUE_SIZE=2
SHARED_QUEUE_SIZE=4
INDEX_THRESHOLD=0.75
RUN_TIME=100
CPU_SPEED=2800
";
        let p = ServerParams::from_str_content(text).unwrap();
        assert_eq!(p.memory_size, 1 << 20);
        assert_eq!(p.queue_size_pages, 2);
        assert_eq!(p.shared_queue_size_pages, 4);
        assert_eq!(p.index_threshold, 0.75);
        assert_eq!(p.run_time, 100);
        assert_eq!(p.cpu_speed_mhz, 2800);
    }

    #[test]
    fn test_unknown_key_reports_line() {
        let err = ServerParams::from_str_content("MEMORY_SIZE=1048576\nBOGUS=1\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "got: {msg}");
        assert!(msg.contains("BOGUS"));
    }

    #[test]
    fn test_malformed_line() {
        let err = ServerParams::from_str_content("MEMORY_SIZE\n").unwrap_err();
        assert!(err.to_string().contains("expected KEY=value"));
    }

    #[test]
    fn test_threshold_range() {
        assert!(ServerParams::from_str_content("INDEX_THRESHOLD=0.0").is_err());
        assert!(ServerParams::from_str_content("INDEX_THRESHOLD=1.0").is_err());
        assert!(ServerParams::from_str_content("INDEX_THRESHOLD=0.5").is_ok());
    }

    #[test]
    fn test_run_time_zero_means_forever() {
        let p = ServerParams::from_str_content("RUN_TIME=0").unwrap();
        assert_eq!(p.run_time, 0);
    }

    #[test]
    fn test_memory_smaller_than_page_rejected() {
        assert!(ServerParams::from_str_content("MEMORY_SIZE=100").is_err());
    }
}
