//! The tokio node runtime under Turmoil's virtual clock.

use std::time::Duration;

use prifi_core::Environment;
use prifi_harness::{SIM_EPOCH_MILLIS, SimEnv};
use prifi_node::{NodeConfig, RunArena, RunHandle, RunOutput};
use prifi_proto::ProtocolParams;

fn config(limit: u32) -> NodeConfig {
    NodeConfig {
        params: ProtocolParams {
            up_cell_size: 32,
            down_cell_size: 32,
            relay_reporting_limit: limit,
            ..ProtocolParams::new(2, 1)
        },
        ..NodeConfig::default()
    }
}

async fn until_finished(handle: &mut RunHandle) -> Vec<RunOutput> {
    let mut outputs = Vec::new();
    while let Some(output) = handle.next_output().await {
        let done = matches!(output, RunOutput::Finished { .. } | RunOutput::Halted { .. });
        outputs.push(output);
        if done {
            break;
        }
    }
    outputs
}

fn carried(outputs: &[RunOutput], needle: &[u8]) -> bool {
    outputs.iter().any(|output| match output {
        RunOutput::Upstream { data, .. } => data.starts_with(needle),
        _ => false,
    })
}

#[test]
fn node_run_completes_in_virtual_time() {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(60)).build();

    sim.client("node", async {
        let env = SimEnv::virtual_time(7);
        let mut arena = RunArena::new(env.clone(), config(10))?;
        let run = arena.start_run()?;
        let handle = arena.run_mut(run)?;
        handle.send_upstream(1, b"virtual".to_vec())?;

        let start = tokio::time::Instant::now();
        let outputs = until_finished(handle).await;

        assert_eq!(outputs.last(), Some(&RunOutput::Finished { rounds: 10 }));
        assert!(carried(&outputs, b"virtual"));
        // trustees pace the rounds: nine gaps at the full-rate interval
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(env.wall_clock_millis() - SIM_EPOCH_MILLIS >= 90);
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn arena_hosts_parallel_runs() {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(60)).build();

    sim.client("node", async {
        let mut arena = RunArena::new(SimEnv::virtual_time(8), config(6))?;
        let first = arena.start_run()?;
        let second = arena.start_run()?;
        arena.run_mut(first)?.send_upstream(0, b"first".to_vec())?;
        arena.run_mut(second)?.send_upstream(0, b"second".to_vec())?;

        let one = until_finished(arena.run_mut(first)?).await;
        let two = until_finished(arena.run_mut(second)?).await;

        assert!(carried(&one, b"first") && !carried(&one, b"second"));
        assert!(carried(&two, b"second") && !carried(&two, b"first"));

        arena.stop_run(first)?;
        assert_eq!(arena.run_ids().collect::<Vec<_>>(), vec![second]);
        Ok(())
    });

    sim.run().unwrap();
}
