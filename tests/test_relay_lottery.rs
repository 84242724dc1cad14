//! Integration tests for the VRF-based relay lottery: fairness, Sybil
//! resistance, and cost-of-forgery behavior under realistic network sizes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use betanet_mixcore::core::relay_lottery::{RelayLottery, WeightedRelay};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn realistic_relays(count: usize) -> Vec<WeightedRelay> {
    (0..count)
        .map(|i| {
            let reputation = 0.5 + (i as f64 / count as f64) * 0.4;
            let performance = 0.7 + (i as f64 / count as f64) * 0.2;
            let stake = 1000 + (i as u64) * 500;
            WeightedRelay::new(addr(8080 + i as u16), reputation, performance, stake)
        })
        .collect()
}

#[test]
fn high_reputation_relays_are_favored_over_many_draws() {
    let mut lottery = RelayLottery::new();

    let high = addr(8080);
    let mid = addr(8081);
    let low = addr(8082);

    lottery.add(WeightedRelay::new(high, 0.9, 0.9, 5000));
    lottery.add(WeightedRelay::new(mid, 0.5, 0.5, 2000));
    lottery.add(WeightedRelay::new(low, 0.3, 0.3, 1000));

    let mut counts: HashMap<SocketAddr, u32> = HashMap::new();
    for i in 0..10_000u64 {
        let (chosen, _) = lottery.select(&i.to_be_bytes()).unwrap();
        *counts.entry(chosen).or_insert(0) += 1;
    }

    assert!(counts[&high] > counts[&mid]);
    assert!(counts[&mid] > counts[&low]);
}

#[test]
fn sybil_resistant_lottery_floors_under_staked_relays() {
    let mut lottery = RelayLottery::with_sybil_resistance(1000);
    lottery.add(WeightedRelay::new(addr(9000), 0.5, 0.7, 10_000));
    lottery.add(WeightedRelay::new(addr(9001), 0.5, 0.7, 100_000));

    let total_stake = 110_000u64;
    let cost_10_pct = lottery.cost_of_forgery(total_stake / 10);
    let cost_33_pct = lottery.cost_of_forgery(total_stake / 3);

    assert!(cost_33_pct > cost_10_pct);
    assert!(cost_33_pct >= 1.0, "33% stake should be prohibitively costly");
}

#[test]
fn select_k_returns_unique_relays_without_replacement() {
    let mut lottery = RelayLottery::new();
    for relay in realistic_relays(20) {
        lottery.add(relay);
    }

    let (selected, proof) = lottery.select_k(b"path-seed", 10).unwrap();
    let unique: HashSet<_> = selected.iter().collect();
    assert_eq!(unique.len(), 10);
    assert_eq!(proof.selected, selected);
}

#[test]
fn select_k_rejects_requests_larger_than_the_network() {
    let mut lottery = RelayLottery::new();
    for relay in realistic_relays(3) {
        lottery.add(relay);
    }
    assert!(lottery.select_k(b"seed", 5).is_err());
}

#[test]
fn empty_lottery_rejects_draws() {
    let mut lottery = RelayLottery::new();
    assert!(lottery.select(b"seed").is_err());
}

#[test]
fn draws_scale_to_a_thousand_relay_network() {
    let mut lottery = RelayLottery::new();
    for relay in realistic_relays(1000) {
        lottery.add(relay);
    }

    let start = Instant::now();
    for i in 0..500u64 {
        let _ = lottery.select(&i.to_be_bytes()).unwrap();
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() < 200,
        "500 draws over 1000 relays took {:?}",
        elapsed
    );
}

#[test]
fn weight_updates_are_reflected_in_subsequent_draws() {
    let mut lottery = RelayLottery::new();
    let target = addr(9500);
    lottery.add(WeightedRelay::new(target, 0.1, 0.1, 100));
    lottery.add(WeightedRelay::new(addr(9501), 0.9, 0.9, 100_000));

    let before = lottery.get(&target).unwrap().weight;
    lottery.update_weight(&target, 0.95, 0.95, 200_000);
    let after = lottery.get(&target).unwrap().weight;

    assert!(after > before);
}

#[cfg(feature = "vrf")]
#[test]
fn vrf_lottery_determinism_and_tamper_detection() {
    let mut lottery = RelayLottery::new();
    lottery.add(WeightedRelay::new(addr(7000), 0.5, 0.5, 5000));
    lottery.add(WeightedRelay::new(addr(7001), 0.3, 0.3, 3000));
    lottery.add(WeightedRelay::new(addr(7002), 0.2, 0.2, 2000));

    let pk = lottery.vrf_public_key();
    let (_addr, mut proof) = lottery.select(b"epoch_42").unwrap();
    assert!(RelayLottery::verify(&proof, &pk).unwrap());

    proof.vrf_proof[0] ^= 0xFF;
    assert!(!RelayLottery::verify(&proof, &pk).unwrap());
}
