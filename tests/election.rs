//! End-to-end RALE election scenarios over real loopback UDP sockets.

mod common;

use raled::rale::Role;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_converges_on_a_single_leader() {
    let nodes = common::spin_cluster(3, 19100, 19200).await;

    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut leaders = 0;
    let mut leader_term = None;
    for node in &nodes {
        if node.rale.is_leader().await {
            leaders += 1;
            leader_term = Some(node.rale.current_term().await);
        }
    }
    assert_eq!(leaders, 1, "expected exactly one leader after the election settles");

    for node in &nodes {
        let (term, leader_id) = node.rale.leader_cell.get();
        assert_eq!(Some(term), leader_term);
        assert!(leader_id > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_reset_their_timer_on_heartbeat() {
    let nodes = common::spin_cluster(3, 19300, 19400).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    let mut found_leader = false;
    for node in &nodes {
        if node.rale.is_leader().await {
            found_leader = true;
        }
    }
    assert!(found_leader, "a leader should have been elected");

    // Hold for multiple heartbeat intervals: followers should stay
    // followers rather than timing out into a new election storm.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut follower_count = 0;
    for node in &nodes {
        if node.rale.role().await == Role::Follower {
            follower_count += 1;
        }
    }
    assert_eq!(follower_count, 2, "the two non-leader nodes should remain followers");
}
