//! End-to-end runs on the tokio runtime with real time and OS randomness.

use std::time::Duration;

use prifi_node::{NodeConfig, RunArena, RunHandle, RunOutput, SystemEnv};
use prifi_proto::ProtocolParams;

fn fast_config(params: ProtocolParams) -> NodeConfig {
    NodeConfig {
        params,
        full_rate_interval: Duration::from_millis(2),
        half_rate_interval: Duration::from_millis(4),
    }
}

/// Outputs until the run finishes or halts.
async fn drain(handle: &mut RunHandle) -> Vec<RunOutput> {
    let mut outputs = Vec::new();
    let collect = async {
        while let Some(output) = handle.next_output().await {
            let done = matches!(output, RunOutput::Finished { .. } | RunOutput::Halted { .. });
            outputs.push(output);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), collect).await.unwrap();
    outputs
}

fn trimmed(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

#[tokio::test]
async fn upstream_reaches_relay_anonymously() {
    let params = ProtocolParams {
        up_cell_size: 64,
        down_cell_size: 64,
        relay_reporting_limit: 20,
        ..ProtocolParams::new(2, 1)
    };
    let mut arena = RunArena::new(SystemEnv::new(), fast_config(params)).unwrap();
    let run = arena.start_run().unwrap();
    let handle = arena.run_mut(run).unwrap();

    handle.send_upstream(0, b"from zero".to_vec()).unwrap();
    handle.send_upstream(1, b"from one".to_vec()).unwrap();

    let outputs = drain(handle).await;
    assert_eq!(outputs.last(), Some(&RunOutput::Finished { rounds: 20 }));

    let upstream: Vec<&[u8]> = outputs
        .iter()
        .filter_map(|output| match output {
            RunOutput::Upstream { data, .. } => Some(trimmed(data)),
            _ => None,
        })
        .filter(|data| !data.is_empty())
        .collect();
    assert!(upstream.contains(&&b"from zero"[..]));
    assert!(upstream.contains(&&b"from one"[..]));

    // every upstream cell is a full cell
    assert!(outputs.iter().all(|output| match output {
        RunOutput::Upstream { data, .. } => data.len() == 64,
        _ => true,
    }));
}

#[tokio::test]
async fn downstream_reaches_every_client() {
    let params = ProtocolParams {
        up_cell_size: 32,
        down_cell_size: 32,
        relay_reporting_limit: 10,
        ..ProtocolParams::new(3, 2)
    };
    let mut arena = RunArena::new(SystemEnv::new(), fast_config(params)).unwrap();
    let run = arena.start_run().unwrap();
    let handle = arena.run_mut(run).unwrap();

    handle.send_downstream(b"broadcast".to_vec()).unwrap();
    let outputs = drain(handle).await;

    for client_id in 0..3 {
        assert!(
            outputs.iter().any(|output| matches!(
                output,
                RunOutput::Downstream { client_id: id, data, .. }
                    if *id == client_id && data == b"broadcast"
            )),
            "client {client_id} missed the broadcast"
        );
    }
}

#[tokio::test]
async fn latency_probes_report_round_trips() {
    let params = ProtocolParams {
        up_cell_size: 32,
        down_cell_size: 32,
        relay_reporting_limit: 12,
        do_latency_tests: true,
        ..ProtocolParams::new(2, 1)
    };
    let mut arena = RunArena::new(SystemEnv::new(), fast_config(params)).unwrap();
    let run = arena.start_run().unwrap();
    let handle = arena.run_mut(run).unwrap();

    let outputs = drain(handle).await;
    assert!(outputs.iter().any(|output| matches!(output, RunOutput::Latency { .. })));
    // probes are echoed, never handed to the application as data
    assert!(outputs.iter().all(|output| match output {
        RunOutput::Upstream { data, .. } => !prifi_core::latency::is_probe(data),
        _ => true,
    }));
}

#[tokio::test]
async fn resync_restarts_setup_and_keeps_running() {
    let params = ProtocolParams {
        up_cell_size: 32,
        down_cell_size: 32,
        relay_reporting_limit: 15,
        ..ProtocolParams::new(2, 1)
    };
    let mut arena = RunArena::new(SystemEnv::new(), fast_config(params)).unwrap();
    let run = arena.start_run().unwrap();
    let handle = arena.run_mut(run).unwrap();

    // wait for the first decoded round, then resync mid-run
    let first = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Some(RunOutput::Upstream { round, .. }) = handle.next_output().await {
                return round;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(first, 0);
    handle.resync().unwrap();

    // the new run counts from zero again
    let outputs = drain(handle).await;
    assert_eq!(outputs.last(), Some(&RunOutput::Finished { rounds: 15 }));
    assert!(outputs.iter().any(|output| matches!(output, RunOutput::Upstream { round: 0, .. })));
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    let params = ProtocolParams {
        up_cell_size: 16,
        down_cell_size: 16,
        relay_reporting_limit: 8,
        ..ProtocolParams::new(2, 1)
    };
    let mut arena = RunArena::new(SystemEnv::new(), fast_config(params)).unwrap();
    let first = arena.start_run().unwrap();
    let second = arena.start_run().unwrap();

    arena.run_mut(first).unwrap().send_upstream(0, b"run one".to_vec()).unwrap();
    arena.run_mut(second).unwrap().send_upstream(0, b"run two".to_vec()).unwrap();

    let one = drain(arena.run_mut(first).unwrap()).await;
    let two = drain(arena.run_mut(second).unwrap()).await;

    let carried = |outputs: &[RunOutput], needle: &[u8]| {
        outputs.iter().any(|output| matches!(
            output,
            RunOutput::Upstream { data, .. } if trimmed(data) == needle
        ))
    };
    assert!(carried(&one, b"run one") && !carried(&one, b"run two"));
    assert!(carried(&two, b"run two") && !carried(&two, b"run one"));
}
