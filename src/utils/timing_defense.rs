//! Timing attack defense for the mix's delay-assignment stage.
//!
//! A global view of inter-packet timing only tells an observer whether the
//! node as a whole looks bursty; the attack this mix actually cares about
//! is per-circuit correlation (an adversary watching one circuit's packets
//! arrive and leave, trying to link them by timing alone). So timing is
//! recorded both globally, for burst masking across the whole node, and
//! per `circuit_id`, for the correlation/entropy figures that matter to a
//! single circuit's unlinkability.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand::rngs::StdRng;
use tokio::sync::Mutex;
use tracing::debug;

/// Timing defense configuration
#[derive(Debug, Clone)]
pub struct TimingDefenseConfig {
    /// Enable timing defense
    pub enabled: bool,
    /// Timing randomization percentage (0.0-1.0)
    pub randomization_pct: f64,
    /// Correlation window size, in packets, kept per circuit
    pub correlation_window_size: usize,
    /// Burst detection threshold (packets/sec)
    pub burst_threshold: f64,
    /// Maximum acceptable correlation coefficient
    pub max_correlation: f64,
    /// Circuits tracked before the oldest is evicted
    pub max_tracked_circuits: usize,
}

impl Default for TimingDefenseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            randomization_pct: 0.3, // +/-30% randomization
            correlation_window_size: 100,
            burst_threshold: 100.0, // 100 packets/sec
            max_correlation: 0.3,
            max_tracked_circuits: 4096,
        }
    }
}

/// Timing recorded for one packet on one circuit.
#[derive(Debug, Clone)]
pub struct PacketTiming {
    pub timestamp: Instant,
    pub size: usize,
    pub original_delay_ms: f64,
    pub actual_delay_ms: f64,
}

struct CircuitHistory {
    timings: VecDeque<PacketTiming>,
    last_seen: Instant,
}

impl CircuitHistory {
    fn new(capacity: usize) -> Self {
        Self {
            timings: VecDeque::with_capacity(capacity),
            last_seen: Instant::now(),
        }
    }
}

/// Timing attack defense manager: randomizes per-packet delay, tracks
/// per-circuit timing history for correlation analysis, and masks bursts
/// that would otherwise stand out against the node's background rate.
pub struct TimingDefenseManager {
    config: TimingDefenseConfig,
    global_history: Arc<Mutex<VecDeque<PacketTiming>>>,
    circuits: Arc<Mutex<HashMap<u64, CircuitHistory>>>,
    rng: Arc<Mutex<StdRng>>,
}

impl TimingDefenseManager {
    pub fn new(config: TimingDefenseConfig) -> Self {
        Self {
            global_history: Arc::new(Mutex::new(VecDeque::with_capacity(
                config.correlation_window_size,
            ))),
            circuits: Arc::new(Mutex::new(HashMap::new())),
            config,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Apply timing randomization to a delay: `delay * (1 +/- random *
    /// randomization_pct)`.
    pub async fn randomize_delay(&self, delay: Duration) -> Duration {
        if !self.config.enabled {
            return delay;
        }

        let mut rng = self.rng.lock().await;
        let delay_ms = delay.as_secs_f64() * 1000.0;
        let randomization = (rng.gen::<f64>() - 0.5) * 2.0 * self.config.randomization_pct;
        let randomized_ms = delay_ms * (1.0 + randomization);

        Duration::from_millis(randomized_ms.max(0.0) as u64)
    }

    /// Record a packet's timing on its circuit and in the node-wide
    /// history used for burst masking. Evicts the oldest tracked circuit
    /// once `max_tracked_circuits` is exceeded, so a long-lived node
    /// doesn't accumulate one entry per circuit ever seen.
    pub async fn record_packet_timing(
        &self,
        circuit_id: u64,
        size: usize,
        original_delay: Duration,
        actual_delay: Duration,
    ) {
        let timing = PacketTiming {
            timestamp: Instant::now(),
            size,
            original_delay_ms: original_delay.as_secs_f64() * 1000.0,
            actual_delay_ms: actual_delay.as_secs_f64() * 1000.0,
        };

        {
            let mut history = self.global_history.lock().await;
            history.push_back(timing.clone());
            while history.len() > self.config.correlation_window_size {
                history.pop_front();
            }
        }

        let mut circuits = self.circuits.lock().await;
        if !circuits.contains_key(&circuit_id) && circuits.len() >= self.config.max_tracked_circuits {
            if let Some(oldest) = circuits
                .iter()
                .min_by_key(|(_, c)| c.last_seen)
                .map(|(id, _)| *id)
            {
                circuits.remove(&oldest);
                debug!(circuit_id = oldest, "evicted timing history for idle circuit");
            }
        }

        let entry = circuits
            .entry(circuit_id)
            .or_insert_with(|| CircuitHistory::new(self.config.correlation_window_size));
        entry.last_seen = timing.timestamp;
        entry.timings.push_back(timing);
        while entry.timings.len() > self.config.correlation_window_size {
            entry.timings.pop_front();
        }
    }

    fn pearson_correlation(timings: &VecDeque<PacketTiming>) -> f64 {
        if timings.len() < 2 {
            return 0.0;
        }

        let n = timings.len() as f64;
        let original: Vec<f64> = timings.iter().map(|t| t.original_delay_ms).collect();
        let actual: Vec<f64> = timings.iter().map(|t| t.actual_delay_ms).collect();

        let mean_original = original.iter().sum::<f64>() / n;
        let mean_actual = actual.iter().sum::<f64>() / n;

        let mut numerator = 0.0;
        let mut sum_sq_original = 0.0;
        let mut sum_sq_actual = 0.0;
        for i in 0..timings.len() {
            let diff_original = original[i] - mean_original;
            let diff_actual = actual[i] - mean_actual;
            numerator += diff_original * diff_actual;
            sum_sq_original += diff_original * diff_original;
            sum_sq_actual += diff_actual * diff_actual;
        }

        let denominator = (sum_sq_original * sum_sq_actual).sqrt();
        if denominator == 0.0 {
            return 0.0;
        }
        numerator / denominator
    }

    /// Pearson correlation between original and randomized delay across the
    /// whole node. Low absolute value indicates good resistance.
    pub async fn calculate_correlation(&self) -> f64 {
        let history = self.global_history.lock().await;
        Self::pearson_correlation(&history)
    }

    /// Pearson correlation scoped to a single circuit: the figure an
    /// attacker watching just that circuit's packets would observe.
    pub async fn calculate_circuit_correlation(&self, circuit_id: u64) -> f64 {
        let circuits = self.circuits.lock().await;
        match circuits.get(&circuit_id) {
            Some(history) => Self::pearson_correlation(&history.timings),
            None => 0.0,
        }
    }

    fn is_burst(timings: &VecDeque<PacketTiming>, threshold: f64) -> bool {
        if timings.len() < 10 {
            return false;
        }

        let recent_count = 10usize.min(timings.len());
        let recent: Vec<&PacketTiming> = timings.iter().rev().take(recent_count).collect();
        if recent.len() < 2 {
            return false;
        }

        let oldest = recent.last().unwrap().timestamp;
        let newest = recent.first().unwrap().timestamp;
        let duration = newest.duration_since(oldest).as_secs_f64();
        if duration == 0.0 {
            return true;
        }

        let rate = recent_count as f64 / duration;
        rate > threshold
    }

    /// Detect a burst in the node-wide arrival rate.
    pub async fn detect_burst(&self) -> bool {
        let history = self.global_history.lock().await;
        Self::is_burst(&history, self.config.burst_threshold)
    }

    /// If a burst is detected, returns an additional 10-100ms delay to
    /// break up the pattern before forwarding.
    pub async fn mask_burst_pattern(&self) -> Option<Duration> {
        if !self.detect_burst().await {
            return None;
        }

        let mut rng = self.rng.lock().await;
        let delay_ms = 10.0 + rng.gen::<f64>() * 90.0;
        Some(Duration::from_millis(delay_ms as u64))
    }

    /// Inter-packet timing variance across the node-wide history. Higher
    /// variance indicates better resistance to timing attacks.
    pub async fn calculate_timing_variance(&self) -> f64 {
        let history = self.global_history.lock().await;
        Self::variance_of(&history)
    }

    fn variance_of(timings: &VecDeque<PacketTiming>) -> f64 {
        if timings.len() < 2 {
            return 0.0;
        }

        let mut intervals = Vec::new();
        for i in 1..timings.len() {
            let interval = timings[i]
                .timestamp
                .duration_since(timings[i - 1].timestamp)
                .as_secs_f64()
                * 1000.0;
            intervals.push(interval);
        }
        if intervals.is_empty() {
            return 0.0;
        }

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        intervals.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / intervals.len() as f64
    }

    /// Entropy of the node-wide actual-delay distribution, binned into
    /// `num_bins` buckets. Higher entropy means less predictable timing.
    pub async fn calculate_timing_entropy(&self, num_bins: usize) -> f64 {
        let history = self.global_history.lock().await;
        Self::entropy_of(&history, num_bins)
    }

    fn entropy_of(timings: &VecDeque<PacketTiming>, num_bins: usize) -> f64 {
        if timings.len() < 10 {
            return 0.0;
        }

        let delays: Vec<f64> = timings.iter().map(|t| t.actual_delay_ms).collect();
        let min_delay = delays.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_delay = delays.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let bin_width = (max_delay - min_delay) / num_bins as f64;
        if bin_width == 0.0 {
            return 0.0;
        }

        let mut bin_counts = vec![0usize; num_bins];
        for &delay in &delays {
            let bin_idx = ((delay - min_delay) / bin_width).floor() as usize;
            bin_counts[bin_idx.min(num_bins - 1)] += 1;
        }

        let total = delays.len() as f64;
        bin_counts
            .iter()
            .filter(|&&count| count > 0)
            .map(|&count| {
                let p = count as f64 / total;
                -p * p.log2()
            })
            .sum()
    }

    /// Overall timing attack resistance score (0.0-1.0, higher is better):
    /// 30% low correlation, 30% high variance, 40% high entropy.
    pub async fn timing_attack_resistance_score(&self) -> f64 {
        let correlation = self.calculate_correlation().await.abs();
        let variance = self.calculate_timing_variance().await;
        let entropy = self.calculate_timing_entropy(20).await;

        let correlation_score = (1.0 - correlation).clamp(0.0, 1.0);
        let variance_score = (variance / 10000.0).min(1.0);
        let entropy_score = (entropy / 4.32).min(1.0);

        (correlation_score * 0.3) + (variance_score * 0.3) + (entropy_score * 0.4)
    }

    /// Whether node-wide correlation stays under `max_correlation`.
    pub async fn is_defense_effective(&self) -> bool {
        self.calculate_correlation().await.abs() < self.config.max_correlation
    }

    /// How many circuits currently have tracked timing history.
    pub async fn tracked_circuit_count(&self) -> usize {
        self.circuits.lock().await.len()
    }

    pub async fn get_timing_stats(&self) -> TimingStats {
        let correlation = self.calculate_correlation().await;
        let variance = self.calculate_timing_variance().await;
        let entropy = self.calculate_timing_entropy(20).await;
        let burst_detected = self.detect_burst().await;
        let resistance_score = self.timing_attack_resistance_score().await;
        let tracked_circuits = self.tracked_circuit_count().await;

        TimingStats {
            correlation,
            variance,
            entropy,
            burst_detected,
            resistance_score,
            tracked_circuits,
        }
    }

    pub async fn reset_history(&self) {
        self.global_history.lock().await.clear();
        self.circuits.lock().await.clear();
    }
}

/// Timing statistics snapshot.
#[derive(Debug, Clone)]
pub struct TimingStats {
    pub correlation: f64,
    pub variance: f64,
    pub entropy: f64,
    pub burst_detected: bool,
    pub resistance_score: f64,
    pub tracked_circuits: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn randomized_delays_vary_around_the_base() {
        let manager = TimingDefenseManager::new(TimingDefenseConfig::default());
        let base_delay = Duration::from_millis(100);

        let mut delays = Vec::new();
        for _ in 0..100 {
            delays.push(manager.randomize_delay(base_delay).await.as_millis() as f64);
        }

        let mean = delays.iter().sum::<f64>() / delays.len() as f64;
        let variance =
            delays.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / delays.len() as f64;
        assert!(variance > 0.0);
    }

    #[tokio::test]
    async fn correlation_stays_low_with_randomization_enabled() {
        let manager = TimingDefenseManager::new(TimingDefenseConfig::default());

        for circuit_id in 0..50u64 {
            let original = Duration::from_millis(100);
            let actual = manager.randomize_delay(original).await;
            manager
                .record_packet_timing(circuit_id, 1000, original, actual)
                .await;
        }

        let correlation = manager.calculate_correlation().await;
        assert!(correlation.abs() < 0.8);
    }

    #[tokio::test]
    async fn per_circuit_history_is_isolated_from_other_circuits() {
        let manager = TimingDefenseManager::new(TimingDefenseConfig::default());

        for _ in 0..20 {
            manager
                .record_packet_timing(1, 1000, Duration::from_millis(50), Duration::from_millis(50))
                .await;
        }
        for _ in 0..5 {
            manager
                .record_packet_timing(2, 1000, Duration::from_millis(10), Duration::from_millis(90))
                .await;
        }

        assert_eq!(manager.tracked_circuit_count().await, 2);
        let corr_1 = manager.calculate_circuit_correlation(1).await;
        let corr_2 = manager.calculate_circuit_correlation(2).await;
        // Circuit 1's delays never change from packet to packet, so its
        // correlation is degenerate (zero variance); circuit 2's is not.
        assert_eq!(corr_1, 0.0);
        assert!(corr_2.is_finite());
    }

    #[tokio::test]
    async fn burst_of_packets_is_detected() {
        let config = TimingDefenseConfig {
            burst_threshold: 50.0,
            ..Default::default()
        };
        let manager = TimingDefenseManager::new(config);

        for _ in 0..10 {
            manager
                .record_packet_timing(7, 1000, Duration::from_millis(10), Duration::from_millis(10))
                .await;
            sleep(Duration::from_millis(5)).await; // ~200 pkt/s
        }

        assert!(manager.detect_burst().await);
    }

    #[tokio::test]
    async fn entropy_is_positive_for_varied_delays() {
        let manager = TimingDefenseManager::new(TimingDefenseConfig::default());

        for i in 0..100u64 {
            let delay = Duration::from_millis(50 + (i % 20) * 10);
            manager.record_packet_timing(i % 3, 1000, delay, delay).await;
        }

        assert!(manager.calculate_timing_entropy(20).await > 0.0);
    }

    #[tokio::test]
    async fn resistance_score_stays_in_unit_range() {
        let manager = TimingDefenseManager::new(TimingDefenseConfig::default());

        for circuit_id in 0..100u64 {
            let original = Duration::from_millis(100);
            let actual = manager.randomize_delay(original).await;
            manager
                .record_packet_timing(circuit_id % 5, 1000, original, actual)
                .await;
            sleep(Duration::from_millis(10)).await;
        }

        let score = manager.timing_attack_resistance_score().await;
        assert!(score > 0.0 && score <= 1.0);
    }

    #[tokio::test]
    async fn idle_circuits_are_evicted_once_the_tracking_cap_is_hit() {
        let config = TimingDefenseConfig {
            max_tracked_circuits: 3,
            ..Default::default()
        };
        let manager = TimingDefenseManager::new(config);

        for circuit_id in 0..5u64 {
            manager
                .record_packet_timing(circuit_id, 100, Duration::from_millis(10), Duration::from_millis(10))
                .await;
        }

        assert_eq!(manager.tracked_circuit_count().await, 3);
    }
}
