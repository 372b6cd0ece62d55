//! End-to-end node tests
//!
//! A full node (scheduler, pipeline, sync and tuning) driven over the
//! in-process transport against the simulated front-end. Time is paused, so
//! the multi-second PPS and capture waits run instantly.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tilesync::config::{NodeConfig, WeightsTable};
use tilesync::radio::{
    bring_up, Direction, RadioDevice, RegisterSwitch, SimOptions, SimRadio, SynthMode,
};
use tilesync::scheduler::{CommandScheduler, SchedulerError};
use tilesync::transport::{
    pump_lines, ChannelTransport, ControllerHandle, LineTransport, OutboundEvent,
};

const WAIT: Duration = Duration::from_secs(30);

struct Node {
    sim: Arc<SimRadio>,
    config: Arc<NodeConfig>,
    ctl: ControllerHandle,
    task: JoinHandle<Result<(), SchedulerError>>,
    data_dir: tempfile::TempDir,
}

impl Node {
    async fn start() -> Self {
        let (scheduler, sim, config, data_dir) = build().await;
        let (mut transport, ctl) = ChannelTransport::pair(64);
        let task = tokio::spawn(async move {
            scheduler
                .run(&mut transport, CancellationToken::new())
                .await
        });
        Self {
            sim,
            config,
            ctl,
            task,
            data_dir,
        }
    }

    async fn command(&mut self, line: &str) -> OutboundEvent {
        self.ctl.send_line(line).await.unwrap();
        self.ctl.next_event(WAIT).await.unwrap()
    }

    async fn sync(&mut self, session: &str) -> OutboundEvent {
        assert_eq!(self.command(&format!("SYNC {session}")).await.to_string(), "ACK SYNC");
        self.ctl.wait_for("synced", WAIT).await.unwrap()
    }

    async fn state(&mut self) -> String {
        let status = self.command("STATUS STATE").await;
        status.value("state").unwrap().to_string()
    }
}

async fn build() -> (CommandScheduler, Arc<SimRadio>, Arc<NodeConfig>, tempfile::TempDir) {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::default();
    config.node.tile = "tile-01".into();
    config.node.data_dir = data_dir.path().to_path_buf();
    config.radio.sample_rate = 100e3;
    let config = Arc::new(config);

    let sim = Arc::new(SimRadio::new(SimOptions::default()));
    let radio: Arc<dyn RadioDevice> = sim.clone();
    let setup = bring_up(&radio, &config).await.unwrap();
    let cal = &config.calibration;
    let switch = Arc::new(RegisterSwitch::new(
        radio.clone(),
        cal.switch_bank,
        cal.switch_addr,
        cal.switch_loopback_value,
        cal.switch_reset_value,
    ));
    let scheduler = CommandScheduler::new(
        radio,
        switch,
        Arc::clone(&config),
        WeightsTable::default(),
        Some(setup),
    );
    (scheduler, sim, config, data_dir)
}

// ============================================================================
// Scenario: SYNC aligns time and tunes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sync_aligns_time_and_locks_lo() {
    let mut node = Node::start().await;
    assert!(node.sim.time_now().await.unwrap().as_secs() > 1000.0);

    let synced = node.sync("abc").await;
    assert_eq!(synced.value("session"), Some("abc"));
    let latched: f64 = synced.value("time").unwrap().parse().unwrap();
    let settle = node.config.timing.pps_settle().as_secs_f64();
    assert!((0.0..=settle).contains(&latched), "latched at {latched}");

    let before = node.sim.time_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(node.sim.time_now().await.unwrap() > before);

    let tunes = node.sim.tune_log();
    let channels = &node.config.radio.channels;
    assert_eq!(tunes.len(), channels.len() * 2);
    let at = tunes[0].at;
    for record in &tunes {
        assert_eq!(record.at, at);
        match record.direction {
            Direction::Tx => {
                assert_eq!(record.request.synth_mode, SynthMode::Integer);
                assert!((record.request.target_freq - 920e6).abs() < 1.0);
            }
            Direction::Rx => {
                assert_eq!(record.request.synth_mode, SynthMode::Fractional);
                assert!((record.request.target_freq - (920e6 - 1e3)).abs() < 1.0);
            }
        }
    }

    let setup = node.command("STATUS SETUP").await;
    assert_eq!(setup.value("lo_locked"), Some("true"));
    assert_eq!(node.state().await, "READY");
}

// ============================================================================
// Scenario: timed CAL
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timed_cal_measures_once_at_requested_instant() {
    let mut node = Node::start().await;
    node.sync("abc").await;

    let now = node.sim.time_now().await.unwrap();
    let at_ms = u64::try_from(now.as_millis()).unwrap() + 7_000;
    let ack = node
        .command(&format!("CAL at_ms={at_ms} duration_ms=2000 mode=LB"))
        .await;
    assert_eq!(ack.to_string(), "ACK CAL");

    let done = node.ctl.wait_for("cal-done", WAIT).await.unwrap();
    assert_eq!(done.value("degraded"), Some("false"));
    let finished = node.sim.time_now().await.unwrap().as_secs();
    let at = at_ms as f64 / 1000.0;
    assert!(finished >= at + 2.0, "result at {finished} before capture end");

    let bursts = node.sim.bursts();
    assert_eq!(bursts.len(), 1);
    assert!((bursts[0].start.as_secs() - at).abs() < 1e-9);
    assert!(!bursts[0].late);
    assert!(bursts[0].end.unwrap().as_secs() >= at + 2.0);

    // Switch engaged before the burst, reset after join.
    assert_eq!(node.sim.register_writes(), vec![(1, 0, 0x6), (1, 0, 0x0)]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(node.ctl.try_next_event().is_none(), "more than one result delivered");
    assert_eq!(node.state().await, "READY");

    let log = std::fs::read_to_string(node.data_dir.path().join("data_tile-01_abc.txt")).unwrap();
    assert_eq!(log.lines().count(), 2);
}

// ============================================================================
// Scenario: ABORT mid-measurement
// ============================================================================

#[tokio::test(start_paused = true)]
async fn abort_mid_measurement_resets_switch_and_stops() {
    let mut node = Node::start().await;
    node.sync("abc").await;

    assert_eq!(
        node.command("CAL delay_ms=1000 duration_ms=2000").await.to_string(),
        "ACK CAL"
    );
    tokio::time::sleep(Duration::from_millis(1_800)).await;
    assert_eq!(node.sim.register(1, 0), Some(0x6));
    assert_eq!(node.state().await, "MEASURING");
    let setup = node.command("STATUS SETUP").await;
    assert_eq!(setup.value("loopback"), Some("true"));

    let started = Instant::now();
    assert_eq!(node.command("ABORT").await.to_string(), "ACK ABORT");
    node.ctl.wait_for("stopped", WAIT).await.unwrap();
    let timing = &node.config.timing;
    assert!(started.elapsed() <= timing.join_grace() + timing.scheduling_slack());

    assert_eq!(node.sim.register(1, 0), Some(0x0));
    assert_eq!(node.state().await, "STOPPED");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(node.ctl.try_next_event().is_none());

    // A new session can start from Stopped.
    node.sync("def").await;
    assert_eq!(node.state().await, "READY");
}

// ============================================================================
// Scenario: past instants are rejected
// ============================================================================

#[tokio::test(start_paused = true)]
async fn past_instant_is_rejected_before_hardware() {
    let mut node = Node::start().await;
    node.sync("abc").await;
    let writes = node.sim.register_writes().len();

    let nack = node.command("CAL at_ms=100 mode=LB").await;
    assert_eq!(nack.to_string(), "NACK CAL reason=late");
    let nack = node.command("START at_ms=100 direction=tx").await;
    assert_eq!(nack.value("reason"), Some("late"));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(node.sim.bursts().is_empty());
    assert_eq!(node.sim.register_writes().len(), writes);
    assert_eq!(node.state().await, "READY");
}

#[tokio::test(start_paused = true)]
async fn oversized_duration_is_rejected_before_hardware() {
    let mut node = Node::start().await;
    node.sync("abc").await;
    let writes = node.sim.register_writes().len();

    let nack = node
        .command(&format!("CAL delay_ms=1000 duration_ms={} mode=LB", u64::MAX))
        .await;
    assert_eq!(nack.to_string(), "NACK CAL reason=invalid-duration_ms");

    let too_long = node.config.timing.max_capture_ms + 1;
    let nack = node
        .command(&format!("START delay_ms=1000 direction=rx duration_ms={too_long}"))
        .await;
    assert_eq!(nack.to_string(), "NACK START reason=invalid-duration_ms");

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(node.ctl.try_next_event().is_none());
    assert_eq!(node.sim.register_writes().len(), writes);
    assert_eq!(node.state().await, "READY");
}

#[tokio::test(start_paused = true)]
async fn conflicting_time_arguments_are_rejected() {
    let mut node = Node::start().await;
    node.sync("abc").await;
    let nack = node.command("CAL at_ms=90000 delay_ms=100").await;
    assert_eq!(nack.value("reason"), Some("conflicting-time"));
}

// ============================================================================
// Line protocol
// ============================================================================

#[tokio::test(start_paused = true)]
async fn line_protocol_round_trip() {
    let (scheduler, _sim, _config, _data_dir) = build().await;
    let (mut queue, handle) = ChannelTransport::pair(64);
    let cancel = CancellationToken::new();

    let (controller_side, node_side) = tokio::io::duplex(4096);
    let (node_read, node_write) = tokio::io::split(node_side);
    let (ctl_read, mut ctl_write) = tokio::io::split(controller_side);
    let mut lines = BufReader::new(ctl_read).lines();

    let pump = tokio::spawn(pump_lines(
        LineTransport::new(node_read, node_write, "duplex"),
        handle,
        cancel.clone(),
    ));
    let node = tokio::spawn(async move {
        scheduler
            .run(&mut queue, CancellationToken::new())
            .await
    });

    ctl_write.write_all(b"STATUS query=STATE\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.starts_with("STATUS query=STATE state=IDLE"), "{reply}");

    ctl_write.write_all(b"BOGUS now\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "NACK BOGUS reason=unknown-command");

    ctl_write.write_all(b"SYNC abc\n").await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "ACK SYNC");
    let synced = lines.next_line().await.unwrap().unwrap();
    assert!(synced.starts_with("synced session=abc time="), "{synced}");

    ctl_write.shutdown().await.unwrap();
    pump.await.unwrap().unwrap();
    node.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn controller_hangup_stops_node() {
    let node = Node::start().await;
    drop(node.ctl);
    node.task.await.unwrap().unwrap();
}
