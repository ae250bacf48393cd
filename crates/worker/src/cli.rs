use std::path::PathBuf;

use clap::Parser;
use reqwest::Url;

use bundle_worker_engine::WorkerConfig;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:2900/";

fn default_server_url() -> Url {
    Url::parse(DEFAULT_SERVER_URL).expect("DEFAULT_SERVER_URL must be a valid URL")
}

/// Parse a byte size such as `512MB`, `10GiB`, or a bare byte count.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("size must not be empty".to_string());
    }

    let lower = s.to_ascii_lowercase();
    let (num, scale) = if let Some(raw) = lower.strip_suffix("kib") {
        (raw, 1024u64)
    } else if let Some(raw) = lower.strip_suffix("mib") {
        (raw, 1024u64 * 1024)
    } else if let Some(raw) = lower.strip_suffix("gib") {
        (raw, 1024u64 * 1024 * 1024)
    } else if let Some(raw) = lower.strip_suffix("kb") {
        (raw, 1000u64)
    } else if let Some(raw) = lower.strip_suffix("mb") {
        (raw, 1000u64 * 1000)
    } else if let Some(raw) = lower.strip_suffix("gb") {
        (raw, 1000u64 * 1000 * 1000)
    } else if let Some(raw) = lower.strip_suffix('b') {
        (raw, 1u64)
    } else {
        (lower.as_str(), 1u64)
    };

    let num = num.trim();
    if num.is_empty() {
        return Err(format!("invalid size: {input:?}"));
    }

    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid size number: {input:?}"))?;

    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size too large: {input:?}"))
}

/// Parse a device list such as `0,1,4-7` into sorted identifiers.
pub fn parse_device_set(input: &str) -> Result<Vec<u32>, String> {
    let mut out = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid device range: {part:?}"))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid device range: {part:?}"))?;
                if lo > hi {
                    return Err(format!("invalid device range: {part:?}"));
                }
                out.extend(lo..=hi);
            }
            None => out.push(
                part.parse()
                    .map_err(|_| format!("invalid device id: {part:?}"))?,
            ),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "bundle-worker", version, about = "Bundle service worker agent")]
pub struct Cli {
    /// Bundle service base URL.
    #[arg(long, env = "BUNDLE_WORKER_SERVER_URL", default_value_t = default_server_url())]
    pub server_url: Url,

    /// Worker id; defaults to the persisted identity (generated on first run).
    #[arg(long, env = "BUNDLE_WORKER_ID")]
    pub id: Option<String>,

    /// Free-form label the operator may target this worker by.
    #[arg(long, env = "BUNDLE_WORKER_TAG")]
    pub tag: Option<String>,

    /// Root directory for run working directories, caches, and state.
    #[arg(long, env = "BUNDLE_WORKER_WORK_DIR", default_value = "bundle-worker-data")]
    pub work_dir: PathBuf,

    /// Directory replaced by the code tarball on self-upgrade.
    ///
    /// Defaults to the directory containing this executable.
    #[arg(long, env = "BUNDLE_WORKER_CODE_DIR")]
    pub code_dir: Option<PathBuf>,

    /// CPU cores runs may be pinned to, e.g. `0,1,4-7`, or `all`.
    #[arg(long, env = "BUNDLE_WORKER_CPUSET", default_value = "all")]
    pub cpuset: String,

    /// GPU devices runs may use, e.g. `0,1`, or `auto` to detect.
    #[arg(long, env = "BUNDLE_WORKER_GPUSET", default_value = "auto")]
    pub gpuset: String,

    /// Dependency cache quota (e.g. `10GB`).
    #[arg(
        long = "work-dir-quota",
        env = "BUNDLE_WORKER_WORK_DIR_QUOTA",
        default_value = "10GB",
        value_parser = parse_size
    )]
    pub work_dir_quota_bytes: u64,

    /// Container image cache quota (e.g. `20GB`); unlimited when absent.
    #[arg(long = "image-quota", env = "BUNDLE_WORKER_IMAGE_QUOTA", value_parser = parse_size)]
    pub image_quota_bytes: Option<u64>,

    /// Prefix of the two container networks the worker maintains.
    #[arg(
        long,
        env = "BUNDLE_WORKER_NETWORK_PREFIX",
        default_value = WorkerConfig::DEFAULT_NETWORK_PREFIX
    )]
    pub network_prefix: String,

    /// Seconds a graceful container stop may take before force-kill.
    #[arg(long, env = "BUNDLE_WORKER_GRACE_PERIOD", default_value_t = 10)]
    pub grace_period_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes_with_and_without_suffix() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("10GB").unwrap(), 10_000_000_000);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("512 mb".trim()).unwrap(), 512_000_000);
        assert!(parse_size("").is_err());
        assert!(parse_size("10XB").is_err());
    }

    #[test]
    fn parses_device_sets_with_ranges() {
        assert_eq!(parse_device_set("0,1,4-7").unwrap(), vec![0, 1, 4, 5, 6, 7]);
        assert_eq!(parse_device_set("3").unwrap(), vec![3]);
        assert_eq!(parse_device_set("1,1,0").unwrap(), vec![0, 1]);
        assert!(parse_device_set("7-4").is_err());
        assert!(parse_device_set("x").is_err());
    }
}
