use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memoizer::config::MemoConfig;
use memoizer::{MemoError, Memoizer};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many requests are in flight at the same time.
    pub concurrency: usize,
    /// The size of the key space requests are drawn from.
    pub keys: u64,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Computations fail for every key divisible by this.
    #[serde(default)]
    pub error_every: Option<u64>,
}

pub type WorkloadMemo = Memoizer<u64, u64, String>;

pub struct PreparedWorkload {
    pub concurrency: usize,
    pub keys: u64,
    pub memo: WorkloadMemo,
    /// How often the memoized function actually ran.
    pub computations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

/// Creates a dedicated memoizer for `workload`, so workloads do not share cache entries.
pub fn prepare_workload(index: usize, base: &MemoConfig, workload: Workload) -> PreparedWorkload {
    let Workload {
        concurrency,
        keys,
        latency,
        error_every,
    } = workload;

    let config = MemoConfig {
        name: format!("{}.{index}", base.name),
        ..base.clone()
    };
    let computations = Arc::new(AtomicUsize::new(0));

    let memo = {
        let computations = Arc::clone(&computations);
        Memoizer::new(config, move |key: u64| {
            computations.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(latency).await;
                match error_every {
                    Some(every) if every > 0 && key % every == 0 => {
                        Err(format!("computation for key {key} failed"))
                    }
                    _ => Ok(key.wrapping_mul(key)),
                }
            }
        })
    };

    PreparedWorkload {
        concurrency: concurrency.max(1),
        keys: keys.max(1),
        memo,
        computations,
    }
}

/// Requests a random key of the workload's key space.
pub async fn process_workload(workload: &PreparedWorkload) -> Result<u64, MemoError<String>> {
    let key = rand::rng().random_range(0..workload.keys);
    workload.memo.get(key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 8
                keys: 100
                latency: 10ms
              - concurrency: 2
                keys: 10
                latency: 1s
                error_every: 3
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workloads.len(), 2);
        assert_eq!(config.workloads[0].latency, Duration::from_millis(10));
        assert_eq!(config.workloads[0].error_every, None);
        assert_eq!(config.workloads[1].error_every, Some(3));
    }

    #[tokio::test]
    async fn test_workload_computes_each_key_once() {
        let workload = Workload {
            concurrency: 4,
            keys: 3,
            latency: Duration::ZERO,
            error_every: Some(2),
        };
        let workload = prepare_workload(0, &MemoConfig::named("stress"), workload);
        assert_eq!(workload.memo.name(), "stress.0");

        for _ in 0..50 {
            match process_workload(&workload).await {
                Ok(value) => assert_eq!(value, 1),
                Err(err) => assert!(err.into_computation_error().is_some()),
            }
        }
        assert!(workload.computations() <= 3);
    }
}
