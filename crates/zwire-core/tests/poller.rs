//! Poller fairness: a full sweep of the poll list costs one interval, and
//! the tick spacing adapts as values come and go.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{Harness, SimNode, HOME_ID};

use zwire_core::{DriverOptions, ValueId};

fn options(dir: &tempfile::TempDir, poll_interval: Duration) -> DriverOptions {
    DriverOptions {
        user_path: dir.path().to_path_buf(),
        save_configuration: false,
        poll_interval,
        ..DriverOptions::default()
    }
}

fn basic_value(node_id: u8) -> ValueId {
    ValueId::new(HOME_ID, node_id, 0x20)
}

#[tokio::test(start_paused = true)]
async fn poll_sweep_shares_the_interval() {
    let dir = tempfile::tempdir().unwrap();
    let nodes: BTreeMap<u8, SimNode> = [2u8, 3, 4, 5]
        .into_iter()
        .map(|id| (id, SimNode::switch()))
        .collect();
    let mut harness = Harness::start(options(&dir, Duration::from_secs(12)), nodes).await;
    harness.drain_notifications();

    for id in [2u8, 3, 4, 5] {
        assert!(harness.driver.enable_poll(basic_value(id)).unwrap());
    }
    // Double enable is a no-op.
    assert!(!harness.driver.enable_poll(basic_value(2)).unwrap());

    // Let any pre-enable sleep expire so the cadence has settled.
    tokio::time::sleep(Duration::from_secs(13)).await;
    harness.net.lock().unwrap().log.clear();
    tokio::time::sleep(Duration::from_secs(24)).await;

    // Four values over a 12 s interval: one poll tick every ~3 s, each
    // value refreshed once per sweep.
    let polls: Vec<_> = {
        let net = harness.net.lock().unwrap();
        net.sent_with_function(0x13)
            .into_iter()
            .filter(|(_, body)| body.get(5) == Some(&0x20) && body.get(6) == Some(&0x02))
            .collect()
    };
    assert!(
        polls.len() >= 7,
        "two sweeps of four values, got {}",
        polls.len()
    );
    for pair in polls.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(
            gap >= Duration::from_millis(2500) && gap <= Duration::from_millis(3500),
            "tick spacing was {gap:?}"
        );
    }
    // Fairness: within one sweep, each node appears exactly once.
    let first_sweep: Vec<u8> = polls.iter().take(4).map(|(_, body)| body[3]).collect();
    let mut sorted = first_sweep.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 4, "every polled value gets one tick per sweep");

    // Removing a value reshapes the spacing: three values, ~4 s ticks.
    assert!(harness.driver.disable_poll(basic_value(3)));
    assert!(!harness.driver.is_polled(&basic_value(3)));
    tokio::time::sleep(Duration::from_secs(6)).await;
    harness.net.lock().unwrap().log.clear();
    tokio::time::sleep(Duration::from_secs(24)).await;

    let polls: Vec<_> = {
        let net = harness.net.lock().unwrap();
        net.sent_with_function(0x13)
            .into_iter()
            .filter(|(_, body)| body.get(5) == Some(&0x20) && body.get(6) == Some(&0x02))
            .collect()
    };
    assert!(!polls.iter().any(|(_, body)| body[3] == 3), "disabled value is not polled");
    for pair in polls.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(
            gap >= Duration::from_millis(3500) && gap <= Duration::from_millis(4500),
            "tick spacing after removal was {gap:?}"
        );
    }

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sleeping_targets_defer_their_poll_to_wake_up() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = BTreeMap::from([(7, SimNode::sleeper())]);
    let mut harness = Harness::start(options(&dir, Duration::from_secs(6)), nodes).await;

    // Wake the node once so its pipeline finishes and polling has a value
    // to work with.
    harness
        .port
        .inject(&common::frame(0x00, 0x04, &[0x00, 7, 2, 0x84, 0x07]));
    harness
        .wait_for(|n| matches!(n, zwire_core::Notification::AllNodesQueried { .. }))
        .await;

    assert!(harness.driver.enable_poll(basic_value(7)).unwrap());

    // The check-in window closes again: the next send round-trips a NO_ACK
    // and the engine marks the node asleep.
    harness.net.lock().unwrap().nodes.get_mut(&7).unwrap().silent = true;
    harness.driver.send_msg(
        zwire_core::command_class::basic::Basic::set_value(7, 0x63),
        zwire_core::MsgQueue::Send,
    );
    tokio::time::sleep(Duration::from_secs(3)).await;

    harness.net.lock().unwrap().log.clear();
    // Two full poll intervals pass; the sleeping target must not be polled
    // on the wire.
    tokio::time::sleep(Duration::from_secs(12)).await;
    let polled = {
        let net = harness.net.lock().unwrap();
        net.send_data_to(7)
            .iter()
            .any(|(_, body)| body.get(5) == Some(&0x20) && body.get(6) == Some(&0x02))
    };
    assert!(!polled, "polls for a sleeping target are deferred");

    // Next check-in flushes the deferred poll.
    harness.net.lock().unwrap().nodes.get_mut(&7).unwrap().silent = false;
    harness
        .port
        .inject(&common::frame(0x00, 0x04, &[0x00, 7, 2, 0x84, 0x07]));
    let net = std::sync::Arc::clone(&harness.net);
    tokio::time::timeout(Duration::from_secs(600), async move {
        loop {
            let polled = net.lock().unwrap().send_data_to(7).iter().any(|(_, body)| {
                body.get(5) == Some(&0x20) && body.get(6) == Some(&0x02)
            });
            if polled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("deferred poll never ran after wake-up");

    harness.shutdown().await;
}
