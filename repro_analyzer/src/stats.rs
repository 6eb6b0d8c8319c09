//! Aggregation of per-program execution outcomes, with a durable json
//! snapshot merged back in on startup.

use crate::util::hash_bytes;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatsData {
    total_runs: u64,
    successful_runs: u64,
    error_runs: u64,
    results: BTreeMap<String, ResultData>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultData {
    program: String,
    total_runs: u64,
    successful_runs: u64,
    error_runs: u64,
    #[serde(default)]
    errors: BTreeMap<String, ErrorData>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ErrorData {
    #[serde(rename = "Error")]
    error: String,
    /// How often this error was seen per pool; `count` is its sum.
    #[serde(rename = "Pools", default)]
    pools: Vec<u64>,
    #[serde(rename = "Count")]
    count: u64,
}

/// Threadsafe execution statistics. Holds its own mutex; callers must not
/// enter it while holding the coordinator's scheduling mutex.
pub struct Statistics {
    pools: usize,
    data_path: Option<PathBuf>,
    inner: Mutex<StatsData>,
}

impl Statistics {
    /// Create statistics for `pools` pools. When `data_path` names an
    /// existing snapshot it is merged in; the same path receives the flush
    /// on shutdown. Without a path the flush goes to stdout.
    pub fn new(pools: usize, data_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let stats = Self {
            pools,
            data_path: data_path.clone(),
            inner: Mutex::new(StatsData::default()),
        };
        if let Some(path) = data_path.as_deref() {
            if path.exists() {
                stats
                    .load_data(path)
                    .with_context(|| format!("failed to load stats file {}", path.display()))?;
            }
        }
        Ok(stats)
    }

    /// Merge a json snapshot into the current state. Totals and error
    /// counts are summed; per-pool arrays are summed element-wise, growing
    /// to the longer of the two.
    pub fn load_data(&self, path: &Path) -> anyhow::Result<()> {
        let content = fs::read_to_string(path)?;
        let loaded: StatsData = serde_json::from_str(&content).context("bad stats json")?;

        let mut inner = self.inner.lock().unwrap();
        inner.total_runs += loaded.total_runs;
        inner.successful_runs += loaded.successful_runs;
        inner.error_runs += loaded.error_runs;
        for (program_id, result) in loaded.results {
            let current = inner
                .results
                .entry(program_id)
                .or_insert_with(|| ResultData {
                    program: result.program.clone(),
                    ..Default::default()
                });
            current.total_runs += result.total_runs;
            current.successful_runs += result.successful_runs;
            current.error_runs += result.error_runs;
            for (error_id, info) in result.errors {
                let error = current.errors.entry(error_id).or_insert_with(|| ErrorData {
                    error: info.error.clone(),
                    ..Default::default()
                });
                error.count += info.count;
                if error.pools.len() < info.pools.len() {
                    error.pools.resize(info.pools.len(), 0);
                }
                for (pool, n) in info.pools.iter().enumerate() {
                    error.pools[pool] += n;
                }
            }
        }
        Ok(())
    }

    /// Record the outcome of one execution. `program` is the serialized
    /// form registered at submission time; it is only needed the first time
    /// a task id shows up. An outcome for an id the coordinator does not
    /// know and that has no result entry yet is dropped.
    pub fn add_result(
        &self,
        pool: usize,
        task_id: &str,
        error: Option<&[u8]>,
        program: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.results.contains_key(task_id) {
            match program {
                Some(program) => {
                    inner.results.insert(
                        task_id.to_string(),
                        ResultData {
                            program,
                            ..Default::default()
                        },
                    );
                }
                None => {
                    log::warn!("dropping result for unknown task {}", task_id);
                    return;
                }
            }
        }

        inner.total_runs += 1;
        let pool_count = self.pools;
        let result = inner.results.get_mut(task_id).unwrap();
        result.total_runs += 1;

        if let Some(error) = error {
            let text = String::from_utf8_lossy(error).into_owned();
            let error_id = hash_bytes(text.as_bytes());
            let info = result.errors.entry(error_id).or_insert_with(|| ErrorData {
                error: text,
                pools: vec![0; pool_count],
                count: 0,
            });
            if info.pools.len() <= pool {
                info.pools.resize(pool + 1, 0);
            }
            info.pools[pool] += 1;
            info.count += 1;
            result.error_runs += 1;
            inner.error_runs += 1;
        } else {
            result.successful_runs += 1;
            inner.successful_runs += 1;
        }
    }

    /// Serialized program text of a recorded task, if any.
    pub fn program_of(&self, task_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.results.get(task_id).map(|r| r.program.clone())
    }

    /// Render the whole state as pretty-printed json (tab indented). The
    /// snapshot is consistent: no result is half-updated in the output.
    pub fn json(&self) -> serde_json::Result<String> {
        let inner = self.inner.lock().unwrap();
        let mut buf = Vec::with_capacity(4096);
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        inner.serialize(&mut ser)?;
        Ok(String::from_utf8(buf).unwrap())
    }

    /// Flush the current state to the configured sink.
    pub fn print(&self) {
        let data = match self.json() {
            Ok(data) => data,
            Err(e) => {
                log::error!("can't save data to json: {}", e);
                return;
            }
        };
        match self.data_path.as_deref() {
            Some(path) => {
                if let Err(e) = atomic_write(path, data.as_bytes()) {
                    log::error!("failed to write stats file {}: {}", path.display(), e);
                }
            }
            None => println!("{}", data),
        }
    }

    #[cfg(test)]
    fn totals(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.total_runs, inner.successful_runs, inner.error_runs)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invariants(stats: &Statistics) {
        let inner = stats.inner.lock().unwrap();
        assert_eq!(inner.total_runs, inner.successful_runs + inner.error_runs);
        for result in inner.results.values() {
            assert_eq!(
                result.total_runs,
                result.successful_runs + result.error_runs
            );
            for error in result.errors.values() {
                assert_eq!(error.count, error.pools.iter().sum::<u64>());
            }
        }
    }

    #[test]
    fn success_and_error_runs_are_counted() {
        let stats = Statistics::new(2, None).unwrap();
        stats.add_result(0, "t1", None, Some("close(0x3)\n".to_string()));
        stats.add_result(0, "t1", Some(b"BUG: foo"), None);
        stats.add_result(1, "t1", Some(b"BUG: foo"), None);
        assert_eq!(stats.totals(), (3, 1, 2));
        invariants(&stats);

        let inner = stats.inner.lock().unwrap();
        let result = &inner.results["t1"];
        assert_eq!(result.errors.len(), 1);
        let error = result.errors.values().next().unwrap();
        assert_eq!(error.error, "BUG: foo");
        assert_eq!(error.pools, vec![1, 1]);
        assert_eq!(error.count, 2);
    }

    #[test]
    fn distinct_errors_get_distinct_fingerprints() {
        let stats = Statistics::new(1, None).unwrap();
        stats.add_result(0, "t1", Some(b"BUG: foo"), Some("close(0x3)\n".into()));
        stats.add_result(0, "t1", Some(b"BUG: bar"), None);
        let inner = stats.inner.lock().unwrap();
        assert_eq!(inner.results["t1"].errors.len(), 2);
    }

    #[test]
    fn unknown_task_is_dropped() {
        let stats = Statistics::new(1, None).unwrap();
        stats.add_result(0, "ghost", None, None);
        assert_eq!(stats.totals(), (0, 0, 0));
        assert!(stats.program_of("ghost").is_none());
    }

    #[test]
    fn known_result_keeps_counting_without_program() {
        let stats = Statistics::new(1, None).unwrap();
        stats.add_result(0, "t1", None, Some("close(0x3)\n".into()));
        stats.add_result(0, "t1", None, None);
        assert_eq!(stats.totals(), (2, 2, 0));
    }

    #[test]
    fn persist_load_roundtrip_is_stable() {
        let dir = std::env::temp_dir().join(format!("repro-stats-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.json");

        let stats = Statistics::new(3, Some(path.clone())).unwrap();
        for _ in 0..7 {
            stats.add_result(0, "t1", None, Some("close(0x3)\n".into()));
        }
        stats.add_result(0, "t1", Some(b"BUG: foo"), None);
        stats.add_result(0, "t1", Some(b"BUG: foo"), None);
        stats.add_result(1, "t1", Some(b"BUG: foo"), None);
        stats.print();
        let first = fs::read_to_string(&path).unwrap();

        let reloaded = Statistics::new(3, Some(path.clone())).unwrap();
        assert_eq!(reloaded.totals(), (10, 7, 3));
        invariants(&reloaded);
        reloaded.print();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_merges_pool_arrays_elementwise() {
        let dir = std::env::temp_dir().join(format!("repro-stats-merge-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("merge.json");

        let stats = Statistics::new(3, Some(path.clone())).unwrap();
        stats.add_result(0, "t1", Some(b"BUG: foo"), Some("close(0x3)\n".into()));
        stats.add_result(0, "t1", Some(b"BUG: foo"), None);
        stats.add_result(1, "t1", Some(b"BUG: foo"), None);
        stats.print();

        let merged = Statistics::new(3, Some(path.clone())).unwrap();
        merged.add_result(2, "t1", Some(b"BUG: foo"), None);
        {
            let inner = merged.inner.lock().unwrap();
            let error = inner.results["t1"].errors.values().next().unwrap();
            assert_eq!(error.pools, vec![2, 1, 1]);
            assert_eq!(error.count, 4);
        }
        invariants(&merged);

        fs::remove_dir_all(&dir).unwrap();
    }
}
