use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gateway_core::{now_millis, GatewayError, Instance, LoadMetric};
use gateway_store::ObservationStore;

/// Selection strategy (§4.5). `Cost` and `ContentAware` are documented as
/// future work and currently alias `RoundRobin`/`Performance` respectively.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    Performance,
    LeastLoaded,
    RoundRobin,
    Cost,
    ContentAware,
}

const SCORE_EPSILON: f64 = 1e-9;

/// Picks one `running` instance of a template per call. Holds one
/// round-robin cursor per `(template, strategy)` pair, used both for plain
/// round-robin selection and to break ties among equally-scored candidates
/// under `performance`/`least-loaded`.
pub struct LoadBalancer {
    store: Arc<ObservationStore>,
    cursors: DashMap<String, usize>,
    warmup: Duration,
}

impl LoadBalancer {
    pub fn new(store: Arc<ObservationStore>) -> Self {
        Self::with_warmup(store, Duration::from_secs(10))
    }

    pub fn with_warmup(store: Arc<ObservationStore>, warmup: Duration) -> Self {
        Self {
            store,
            cursors: DashMap::new(),
            warmup,
        }
    }

    /// Picks one `running` instance of `template` under `strategy`. Fails
    /// with `NoHealthyInstance` if none are running. Any candidate the
    /// balancer has not seen before is registered into metrics with
    /// `addedAt = now`, per §4.5.
    pub fn pick(&self, template: &str, strategy: Strategy) -> Result<Instance, GatewayError> {
        let candidates: Vec<Instance> = self
            .store
            .list_instances_for_template(template)
            .into_iter()
            .filter(|i| i.state == gateway_core::InstanceState::Running)
            .collect();
        self.pick_from(template, strategy, &candidates)
    }

    /// Same as [`LoadBalancer::pick`], but scores a caller-supplied
    /// candidate list instead of re-reading the store. The dispatcher uses
    /// this to pick among instances that already passed its health gate
    /// (§4.8 step 6), without the balancer re-admitting ones the gate just
    /// excluded.
    pub fn pick_from(
        &self,
        template: &str,
        strategy: Strategy,
        candidates: &[Instance],
    ) -> Result<Instance, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstance {
                template: template.to_string(),
            });
        }
        let mut candidates: Vec<Instance> = candidates.to_vec();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        for instance in &candidates {
            if self.store.get_metrics(&instance.id).is_none() {
                self.store
                    .set_metrics(&instance.id, LoadMetric::new_at(now_millis()))?;
            }
        }

        let chosen = match strategy {
            Strategy::RoundRobin | Strategy::Cost => {
                self.round_robin_pick(template, strategy, &candidates)
            }
            Strategy::Performance | Strategy::ContentAware => {
                self.scored_pick(template, strategy, &candidates, |metric| {
                    self.performance_score(metric)
                })
            }
            Strategy::LeastLoaded => {
                self.scored_pick(template, strategy, &candidates, |metric| {
                    // Smaller `requestCount` should win, so score is negated
                    // to reuse the same max-score tie-break machinery.
                    -(metric.request_count as f64)
                })
            }
        };

        Ok(chosen)
    }

    fn cursor_key(&self, template: &str, strategy: Strategy) -> String {
        format!("{template}:{strategy:?}")
    }

    fn next_cursor(&self, key: &str, len: usize) -> usize {
        let mut cursor = self.cursors.entry(key.to_string()).or_insert(0);
        let idx = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        idx
    }

    fn round_robin_pick(&self, template: &str, strategy: Strategy, candidates: &[Instance]) -> Instance {
        let key = self.cursor_key(template, strategy);
        let idx = self.next_cursor(&key, candidates.len());
        candidates[idx].clone()
    }

    fn performance_score(&self, metric: &LoadMetric) -> f64 {
        let latency_component = 1.0 - (metric.avg_latency_ms / 5000.0).min(1.0);
        let error_component = 1.0 - metric.error_rate();
        let base = 0.5 * latency_component + 0.5 * error_component;
        base * warmup_factor(metric.added_at, self.warmup)
    }

    /// Scores every candidate with `score_fn`, picks the maximum, and breaks
    /// ties among equally-scored candidates (already id-sorted) using the
    /// strategy's round-robin cursor.
    fn scored_pick(
        &self,
        template: &str,
        strategy: Strategy,
        candidates: &[Instance],
        score_fn: impl Fn(&LoadMetric) -> f64,
    ) -> Instance {
        let scored: Vec<(f64, &Instance)> = candidates
            .iter()
            .map(|instance| {
                let metric = self
                    .store
                    .get_metrics(&instance.id)
                    .unwrap_or_else(|| LoadMetric::new_at(now_millis()));
                (score_fn(&metric), instance)
            })
            .collect();

        let best = scored
            .iter()
            .map(|(score, _)| *score)
            .fold(f64::NEG_INFINITY, f64::max);

        let tied: Vec<&Instance> = scored
            .iter()
            .filter(|(score, _)| (score - best).abs() <= SCORE_EPSILON)
            .map(|(_, instance)| *instance)
            .collect();

        if tied.len() == 1 {
            return tied[0].clone();
        }

        let key = self.cursor_key(template, strategy);
        let idx = self.next_cursor(&key, tied.len());
        tied[idx].clone()
    }
}

fn warmup_factor(added_at: u64, warmup: Duration) -> f64 {
    if warmup.is_zero() {
        return 1.0;
    }
    let elapsed = now_millis().saturating_sub(added_at) as f64;
    (elapsed / warmup.as_millis() as f64).min(1.0)
}
