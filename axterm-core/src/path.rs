//! Path scoring and suggestion: tracks delivery statistics per
//! (destination, path) pair and scores candidate paths so a caller can pick
//! the best one to route a digipeated send through.

use crate::address::Address;
use std::time::{Duration, Instant};

/// One hour - beyond this a path's statistics are considered to be telling us
/// less and less about current conditions.
const FRESHNESS_DECAY_SECS: f64 = 3600.0;
/// Used as the RTT estimate for a path that has never completed a successful
/// round trip, so it can still be scored (poorly) rather than excluded.
const DEFAULT_RTT_SECS: f64 = 3.0;
const MIN_FRESHNESS_TO_SUGGEST: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSignature {
    pub hops: u8,
    pub via: Vec<Address>,
}

impl PathSignature {
    pub fn direct() -> Self {
        Self {
            hops: 0,
            via: Vec::new(),
        }
    }

    pub fn digipeated(via: Vec<Address>) -> Self {
        Self {
            hops: via.len() as u8,
            via,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathStats {
    attempts: u32,
    successes: u32,
    average_rtt: Option<Duration>,
    last_updated: Instant,
}

impl PathStats {
    pub fn new(now: Instant) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            average_rtt: None,
            last_updated: now,
        }
    }

    /// Record the outcome of an attempt over this path. `rtt` is only
    /// meaningful - and only folded into the running average - on success;
    /// a failure still counts against ETX but contributes no RTT sample.
    pub fn record(&mut self, success: bool, rtt: Option<Duration>, now: Instant) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            if let Some(sample) = rtt {
                self.average_rtt = Some(match self.average_rtt {
                    None => sample,
                    Some(prev) => ema(prev, sample),
                });
            }
        }
        self.last_updated = now;
    }

    /// Expected transmission count: `1 / successRate`, clamped to 20 whenever
    /// the success rate drops below 0.05 (including the no-attempts and
    /// all-failures cases, where the raw ratio would be undefined or infinite).
    pub fn etx(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        let success_rate = self.successes as f64 / self.attempts as f64;
        if success_rate < 0.05 {
            return 20.0;
        }
        1.0 / success_rate
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.average_rtt
    }

    /// How much to trust this statistic right now: decays exponentially with
    /// time since the last observation, 1.0 when fresh and approaching 0 as
    /// it ages past `FRESHNESS_DECAY_SECS`.
    pub fn freshness(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_updated).as_secs_f64();
        (-elapsed / FRESHNESS_DECAY_SECS).exp()
    }
}

fn ema(previous: Duration, sample: Duration, ) -> Duration {
    const ALPHA: f64 = 0.25;
    let prev = previous.as_secs_f64();
    let next = sample.as_secs_f64();
    Duration::from_secs_f64(prev + ALPHA * (next - prev))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionTag {
    Direct,
    MostReliable,
    BestEtt,
}

#[derive(Debug, Clone)]
pub struct PathSuggestion {
    pub path: PathSignature,
    pub composite_score: f64,
    pub tag: SuggestionTag,
    pub reason: String,
}

/// Score and rank candidate paths to a destination, returning up to `limit`
/// suggestions ordered from best (lowest composite score) to worst. Paths
/// whose statistics have decayed below a usable freshness are dropped
/// entirely rather than suggested on stale information.
pub fn suggest(
    candidates: &[(PathSignature, PathStats)],
    now: Instant,
    limit: usize,
) -> Vec<PathSuggestion> {
    struct Scored {
        path: PathSignature,
        etx: f64,
        freshness: f64,
        ett: f64,
        composite: f64,
    }

    let mut scored: Vec<Scored> = candidates
        .iter()
        .filter_map(|(path, stats)| {
            let freshness = stats.freshness(now);
            if freshness < MIN_FRESHNESS_TO_SUGGEST {
                return None;
            }
            let etx = stats.etx();
            let rtt_secs = stats
                .average_rtt()
                .map(|d| d.as_secs_f64())
                .unwrap_or(DEFAULT_RTT_SECS);
            let ett = rtt_secs * etx;
            let composite =
                ett + 0.5 * path.hops as f64 + 2.0 * (1.0 - freshness) + 0.3 * (etx - 1.0).max(0.0);
            Some(Scored {
                path: path.clone(),
                etx,
                freshness,
                ett,
                composite,
            })
        })
        .collect();

    scored.sort_by(|a, b| a.composite.partial_cmp(&b.composite).unwrap());

    scored
        .into_iter()
        .take(limit)
        .map(|s| {
            let tag = if s.path.hops == 0 {
                SuggestionTag::Direct
            } else if s.etx <= 1.5 {
                SuggestionTag::MostReliable
            } else {
                SuggestionTag::BestEtt
            };
            let reason = match tag {
                SuggestionTag::Direct => "direct path, no digipeaters required".to_string(),
                SuggestionTag::MostReliable => {
                    format!("reliable path (ETX {:.2})", s.etx)
                }
                SuggestionTag::BestEtt => {
                    format!("lowest estimated transmission time ({:.2}s, ETX {:.2})", s.ett, s.etx)
                }
            };
            PathSuggestion {
                path: s.path,
                composite_score: s.composite,
                tag,
                reason,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etx_improves_with_successes_and_worsens_with_failures() {
        let now = Instant::now();
        let mut stats = PathStats::new(now);
        stats.record(true, Some(Duration::from_millis(500)), now);
        assert_eq!(stats.etx(), 1.0);
        stats.record(false, None, now);
        assert!(stats.etx() > 1.0);
    }

    #[test]
    fn rtt_only_updates_on_success() {
        let now = Instant::now();
        let mut stats = PathStats::new(now);
        stats.record(true, Some(Duration::from_millis(200)), now);
        stats.record(false, None, now);
        // failure doesn't move the average away from the one successful sample
        assert_eq!(stats.average_rtt(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn freshness_decays_over_time() {
        let now = Instant::now();
        let stats = PathStats::new(now);
        assert!((stats.freshness(now) - 1.0).abs() < 1e-9);
        let much_later = now + Duration::from_secs(36000);
        assert!(stats.freshness(much_later) < 0.1);
    }

    #[test]
    fn stale_paths_are_excluded_from_suggestions() {
        let now = Instant::now();
        let mut stats = PathStats::new(now);
        stats.record(true, Some(Duration::from_millis(100)), now);
        let much_later = now + Duration::from_secs(100_000);
        let suggestions = suggest(&[(PathSignature::direct(), stats)], much_later, 3);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn direct_path_is_tagged_direct() {
        let now = Instant::now();
        let mut direct_stats = PathStats::new(now);
        direct_stats.record(true, Some(Duration::from_millis(300)), now);
        let suggestions = suggest(&[(PathSignature::direct(), direct_stats)], now, 1);
        assert_eq!(suggestions[0].tag, SuggestionTag::Direct);
    }

    #[test]
    fn lower_composite_score_ranks_first() {
        let now = Instant::now();
        let mut fast = PathStats::new(now);
        fast.record(true, Some(Duration::from_millis(100)), now);
        let mut slow = PathStats::new(now);
        slow.record(true, Some(Duration::from_secs(5)), now);

        let digi = Address::new("DIGI", 1).unwrap();
        let candidates = vec![
            (PathSignature::digipeated(vec![digi.clone()]), slow),
            (PathSignature::direct(), fast),
        ];
        let suggestions = suggest(&candidates, now, 2);
        assert_eq!(suggestions[0].path.hops, 0);
        assert!(suggestions[0].composite_score < suggestions[1].composite_score);
    }

    #[test]
    fn limit_caps_number_of_suggestions() {
        let now = Instant::now();
        let mut stats_a = PathStats::new(now);
        stats_a.record(true, Some(Duration::from_millis(100)), now);
        let mut stats_b = PathStats::new(now);
        stats_b.record(true, Some(Duration::from_millis(150)), now);
        let digi = Address::new("DIGI", 1).unwrap();
        let candidates = vec![
            (PathSignature::direct(), stats_a),
            (PathSignature::digipeated(vec![digi]), stats_b),
        ];
        let suggestions = suggest(&candidates, now, 1);
        assert_eq!(suggestions.len(), 1);
    }
}
