//! In-memory front-end.
//!
//! Implements the full [`RadioDevice`] contract without hardware, driven by
//! the tokio clock so tests can run against paused time:
//!
//! - PPS edges every `pps_period` of simulated time; time resets requested
//!   with `set_time_next_pps` latch lazily on the next edge
//! - `ref_locked` / `lo_locked` sensors with configurable settle delays (or never)
//! - a user register bank holding the loopback switch
//! - tx bursts recorded with their start time, per-channel amplitude and phase
//! - rx capture synthesizing the reference tone on the reference channel and,
//!   while a burst is on air, the transmitted tone on the loopback-rx channel
//!   (through the loopback path when the switch is engaged, over the air otherwise)

use async_trait::async_trait;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::defaults;

use super::{
    ClockSource, Direction, HwTime, RadioDevice, RadioError, RadioResult, RxCapture, RxStream,
    Sample, SynthMode, TimeSource, TuneRequest, TuneResult, TxEvent, TxEventKind, TxEventSource,
    TxHandles, TxMetadata, TxStream,
};

/// Resolution of the integer-N synthesizer.
const INTEGER_N_STEP_HZ: f64 = 1e6;

/// Rate assumed for chains that were never configured.
const DEFAULT_SIM_RATE: f64 = 1e6;

/// Packets the tx path may run ahead of the air interface.
const TX_LEAD_PACKETS: u32 = 4;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub boards: usize,
    pub channels: usize,
    /// Delay after selecting the external reference until `ref_locked`; `None` = never.
    pub ref_lock_delay: Option<Duration>,
    /// Board whose reference never locks.
    pub unlockable_board: Option<usize>,
    /// Delay after the last tune until `lo_locked`; `None` = never.
    pub lo_lock_delay: Option<Duration>,
    pub pps_period: Duration,
    /// Free-running counter value at power-up.
    pub initial_time: f64,
    pub registers_available: bool,
    pub switch_bank: usize,
    pub switch_addr: u32,
    pub switch_loopback_value: u32,
    pub ref_channel: usize,
    pub free_tx_channel: usize,
    pub loopback_tx_channel: usize,
    pub loopback_rx_channel: usize,
    pub reference_amplitude: f32,
    pub reference_phase: f64,
    pub loopback_gain: f32,
    /// Phase added by the internal loopback path.
    pub loopback_phase: f64,
    pub air_gain: f32,
    /// Phase added by the over-the-air path.
    pub air_phase: f64,
    pub max_samples_per_packet: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            boards: 1,
            channels: 2,
            ref_lock_delay: Some(Duration::from_millis(5)),
            unlockable_board: None,
            lo_lock_delay: Some(Duration::from_millis(20)),
            pps_period: Duration::from_millis(defaults::PPS_PERIOD_MS),
            initial_time: 1234.5,
            registers_available: true,
            switch_bank: 1,
            switch_addr: 0,
            switch_loopback_value: 0x6,
            ref_channel: 0,
            free_tx_channel: 0,
            loopback_tx_channel: 1,
            loopback_rx_channel: 1,
            reference_amplitude: 0.5,
            reference_phase: 0.3,
            loopback_gain: 0.5,
            loopback_phase: 1.1,
            air_gain: 0.1,
            air_phase: -0.4,
            max_samples_per_packet: 1000,
        }
    }
}

// ============================================================================
// Recorded Activity
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TuneRecord {
    pub direction: Direction,
    pub channel: usize,
    pub request: TuneRequest,
    pub at: HwTime,
}

/// One transmitted burst as seen by the simulated air interface.
#[derive(Debug, Clone, PartialEq)]
pub struct SimBurst {
    pub start: HwTime,
    /// Set once end-of-burst was received.
    pub end: Option<HwTime>,
    pub channels: Vec<usize>,
    pub amplitudes: Vec<f32>,
    pub phases: Vec<f64>,
    pub samples: u64,
    /// The time spec had already passed when the first packet arrived.
    pub late: bool,
}

impl SimBurst {
    fn is_on_air(&self, t: f64) -> bool {
        t >= self.start.as_secs() && self.end.map_or(true, |end| t < end.as_secs())
    }

    fn tone_of(&self, channel: usize) -> Option<(f32, f64)> {
        self.channels
            .iter()
            .position(|&c| c == channel)
            .map(|i| (self.amplitudes[i], self.phases[i]))
    }
}

// ============================================================================
// State
// ============================================================================

struct DeviceClock {
    anchor: Instant,
    value: f64,
    pending: Option<(Instant, f64)>,
}

struct SimState {
    opts: SimOptions,
    epoch: Instant,
    clock: DeviceClock,
    clock_source: ClockSource,
    time_source: TimeSource,
    clock_selected_at: Option<Instant>,
    last_tune_at: Option<Instant>,
    master_clock_rate: f64,
    rates: HashMap<(Direction, usize), f64>,
    bandwidths: HashMap<usize, f64>,
    gains: HashMap<(Direction, usize), f64>,
    frontends: HashMap<usize, (bool, bool)>,
    freqs: HashMap<(Direction, usize), f64>,
    tune_log: Vec<TuneRecord>,
    registers: HashMap<(usize, u32), u32>,
    register_writes: Vec<(usize, u32, u32)>,
    bursts: Vec<SimBurst>,
    pps_resets: usize,
}

impl SimState {
    fn latch(&mut self, now: Instant) {
        if let Some((edge, value)) = self.clock.pending {
            if now >= edge {
                self.clock.anchor = edge;
                self.clock.value = value;
                self.clock.pending = None;
            }
        }
    }

    fn hw_time(&mut self, now: Instant) -> HwTime {
        self.latch(now);
        let elapsed = now.saturating_duration_since(self.clock.anchor).as_secs_f64();
        HwTime::from_secs(self.clock.value + elapsed)
    }

    fn next_pps_edge(&self, now: Instant) -> Instant {
        let period = self.opts.pps_period.as_secs_f64();
        let elapsed = now.saturating_duration_since(self.epoch).as_secs_f64();
        let k = (elapsed / period).floor() + 1.0;
        self.epoch + Duration::from_secs_f64(k * period)
    }

    /// Host instant at which the device clock reads `t`.
    fn instant_at(&mut self, t: HwTime, now: Instant) -> Instant {
        let current = self.hw_time(now);
        t.duration_since(current).map_or(now, |ahead| now + ahead)
    }

    fn rate(&self, direction: Direction, channel: usize) -> f64 {
        self.rates
            .get(&(direction, channel))
            .copied()
            .unwrap_or(DEFAULT_SIM_RATE)
    }

    fn check_channel(&self, channel: usize) -> RadioResult<()> {
        if channel < self.opts.channels {
            Ok(())
        } else {
            Err(RadioError::InvalidChannel(channel))
        }
    }

    fn switch_engaged(&self) -> bool {
        self.registers
            .get(&(self.opts.switch_bank, self.opts.switch_addr))
            .is_some_and(|&v| v == self.opts.switch_loopback_value)
    }

    fn baseband_offset(&self, tx_channel: usize, rx_channel: usize) -> f64 {
        match (
            self.freqs.get(&(Direction::Tx, tx_channel)),
            self.freqs.get(&(Direction::Rx, rx_channel)),
        ) {
            (Some(tx), Some(rx)) => tx - rx,
            _ => 0.0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn synthesize(&self, channel: usize, t: f64) -> Sample {
        let opts = &self.opts;
        if channel == opts.ref_channel {
            let f = self.baseband_offset(opts.free_tx_channel, channel);
            return Sample::from_polar(
                opts.reference_amplitude,
                ((opts.reference_phase + TAU * f * t) % TAU) as f32,
            );
        }
        if channel != opts.loopback_rx_channel {
            return Sample::new(0.0, 0.0);
        }

        let (source, gain, path_phase) = if self.switch_engaged() {
            (opts.loopback_tx_channel, opts.loopback_gain, opts.loopback_phase)
        } else {
            (opts.free_tx_channel, opts.air_gain, opts.air_phase)
        };
        let on_air = self
            .bursts
            .iter()
            .rev()
            .find(|b| b.is_on_air(t))
            .and_then(|b| b.tone_of(source));
        match on_air {
            Some((amplitude, phase)) => {
                let f = self.baseband_offset(source, channel);
                let theta = (phase + path_phase + TAU * f * t) % TAU;
                Sample::from_polar(gain * amplitude, theta as f32)
            }
            None => Sample::new(0.0, 0.0),
        }
    }
}

// ============================================================================
// SimRadio
// ============================================================================

/// Simulated front-end. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimRadio {
    pub fn new(opts: SimOptions) -> Self {
        let now = Instant::now();
        let initial_time = opts.initial_time;
        Self {
            state: Arc::new(Mutex::new(SimState {
                opts,
                epoch: now,
                clock: DeviceClock {
                    anchor: now,
                    value: initial_time,
                    pending: None,
                },
                clock_source: ClockSource::Internal,
                time_source: TimeSource::Internal,
                clock_selected_at: None,
                last_tune_at: None,
                master_clock_rate: 0.0,
                rates: HashMap::new(),
                bandwidths: HashMap::new(),
                gains: HashMap::new(),
                frontends: HashMap::new(),
                freqs: HashMap::new(),
                tune_log: Vec::new(),
                registers: HashMap::new(),
                register_writes: Vec::new(),
                bursts: Vec::new(),
                pps_resets: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, bank: usize, addr: u32) -> Option<u32> {
        self.lock().registers.get(&(bank, addr)).copied()
    }

    /// Every `(bank, addr, value)` written, in order.
    pub fn register_writes(&self) -> Vec<(usize, u32, u32)> {
        self.lock().register_writes.clone()
    }

    pub fn tune_log(&self) -> Vec<TuneRecord> {
        self.lock().tune_log.clone()
    }

    pub fn bursts(&self) -> Vec<SimBurst> {
        self.lock().bursts.clone()
    }

    pub fn clock_source(&self) -> ClockSource {
        self.lock().clock_source
    }

    pub fn time_source(&self) -> TimeSource {
        self.lock().time_source
    }

    pub fn pps_resets(&self) -> usize {
        self.lock().pps_resets
    }

    pub fn frequency(&self, direction: Direction, channel: usize) -> Option<f64> {
        self.lock().freqs.get(&(direction, channel)).copied()
    }

    pub fn gain(&self, direction: Direction, channel: usize) -> Option<f64> {
        self.lock().gains.get(&(direction, channel)).copied()
    }

    pub fn rx_frontend(&self, channel: usize) -> Option<(bool, bool)> {
        self.lock().frontends.get(&channel).copied()
    }

    pub fn bandwidth(&self, channel: usize) -> Option<f64> {
        self.lock().bandwidths.get(&channel).copied()
    }

    pub fn master_clock_rate(&self) -> f64 {
        self.lock().master_clock_rate
    }

    pub fn options(&self) -> SimOptions {
        self.lock().opts.clone()
    }
}

#[async_trait]
impl RadioDevice for SimRadio {
    fn description(&self) -> String {
        let st = self.lock();
        format!(
            "SimRadio ({} board(s), {} channel(s))",
            st.opts.boards, st.opts.channels
        )
    }

    fn num_boards(&self) -> usize {
        self.lock().opts.boards
    }

    fn num_channels(&self) -> usize {
        self.lock().opts.channels
    }

    async fn set_master_clock_rate(&self, rate: f64) -> RadioResult<f64> {
        self.lock().master_clock_rate = rate;
        Ok(rate)
    }

    async fn set_clock_source(&self, source: ClockSource) -> RadioResult<()> {
        let mut st = self.lock();
        st.clock_source = source;
        st.clock_selected_at = Some(Instant::now());
        Ok(())
    }

    async fn set_time_source(&self, source: TimeSource) -> RadioResult<()> {
        self.lock().time_source = source;
        Ok(())
    }

    async fn ref_locked(&self, board: usize) -> RadioResult<bool> {
        let st = self.lock();
        if board >= st.opts.boards {
            return Err(RadioError::InvalidBoard(board));
        }
        if st.clock_source == ClockSource::Internal {
            return Ok(true);
        }
        if st.opts.unlockable_board == Some(board) {
            return Ok(false);
        }
        let locked = match (st.opts.ref_lock_delay, st.clock_selected_at) {
            (Some(delay), Some(selected)) => Instant::now() >= selected + delay,
            _ => false,
        };
        Ok(locked)
    }

    async fn lo_locked(&self, _direction: Direction) -> RadioResult<bool> {
        let st = self.lock();
        let locked = match st.opts.lo_lock_delay {
            None => false,
            Some(delay) => st
                .last_tune_at
                .map_or(true, |tuned| Instant::now() >= tuned + delay),
        };
        Ok(locked)
    }

    async fn set_rate(&self, direction: Direction, channel: usize, rate: f64) -> RadioResult<f64> {
        let mut st = self.lock();
        st.check_channel(channel)?;
        st.rates.insert((direction, channel), rate);
        Ok(rate)
    }

    async fn set_rx_bandwidth(&self, channel: usize, bandwidth: f64) -> RadioResult<f64> {
        let mut st = self.lock();
        st.check_channel(channel)?;
        st.bandwidths.insert(channel, bandwidth);
        Ok(bandwidth)
    }

    async fn set_gain(
        &self,
        direction: Direction,
        channel: usize,
        gain_db: f64,
    ) -> RadioResult<()> {
        let mut st = self.lock();
        st.check_channel(channel)?;
        st.gains.insert((direction, channel), gain_db);
        Ok(())
    }

    async fn set_rx_frontend(&self, channel: usize, dc_offset: bool, agc: bool) -> RadioResult<()> {
        let mut st = self.lock();
        st.check_channel(channel)?;
        st.frontends.insert(channel, (dc_offset, agc));
        Ok(())
    }

    async fn tune_channel(
        &self,
        direction: Direction,
        channel: usize,
        request: &TuneRequest,
        at: HwTime,
    ) -> RadioResult<TuneResult> {
        let mut st = self.lock();
        st.check_channel(channel)?;

        let actual_rf = match request.synth_mode {
            SynthMode::Integer => (request.rf_freq / INTEGER_N_STEP_HZ).round() * INTEGER_N_STEP_HZ,
            SynthMode::Fractional => request.rf_freq,
        };
        let actual_dsp = request.target_freq - actual_rf;

        st.freqs.insert((direction, channel), actual_rf + actual_dsp);
        st.last_tune_at = Some(Instant::now());
        st.tune_log.push(TuneRecord {
            direction,
            channel,
            request: request.clone(),
            at,
        });

        Ok(TuneResult {
            target_rf_freq: request.rf_freq,
            actual_rf_freq: actual_rf,
            target_dsp_freq: request.dsp_freq,
            actual_dsp_freq: actual_dsp,
        })
    }

    async fn time_now(&self) -> RadioResult<HwTime> {
        Ok(self.lock().hw_time(Instant::now()))
    }

    async fn set_time_next_pps(&self, time: HwTime) -> RadioResult<()> {
        let mut st = self.lock();
        let now = Instant::now();
        st.latch(now);
        let edge = st.next_pps_edge(now);
        st.clock.pending = Some((edge, time.as_secs()));
        st.pps_resets += 1;
        debug!(value = %time, "[SimRadio] Time reset armed for next PPS edge");
        Ok(())
    }

    async fn open_tx_stream(&self, channels: &[usize]) -> RadioResult<TxHandles> {
        let spp = {
            let st = self.lock();
            for &c in channels {
                st.check_channel(c)?;
            }
            st.opts.max_samples_per_packet
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(TxHandles {
            stream: Box::new(SimTxStream {
                state: Arc::clone(&self.state),
                channels: channels.to_vec(),
                spp,
                events: events_tx,
                burst: None,
            }),
            events: Box::new(SimTxEvents { rx: events_rx }),
        })
    }

    async fn open_rx_stream(&self, channels: &[usize]) -> RadioResult<Box<dyn RxStream>> {
        let spp = {
            let st = self.lock();
            for &c in channels {
                st.check_channel(c)?;
            }
            st.opts.max_samples_per_packet
        };
        Ok(Box::new(SimRxStream {
            state: Arc::clone(&self.state),
            channels: channels.to_vec(),
            spp,
        }))
    }

    async fn poke32(&self, bank: usize, addr: u32, value: u32) -> RadioResult<()> {
        let mut st = self.lock();
        if !st.opts.registers_available {
            return Err(RadioError::Register {
                bank,
                addr,
                reason: "user settings interface not available".into(),
            });
        }
        st.registers.insert((bank, addr), value);
        st.register_writes.push((bank, addr, value));
        Ok(())
    }

    async fn peek32(&self, bank: usize, addr: u32) -> RadioResult<u32> {
        let st = self.lock();
        if !st.opts.registers_available {
            return Err(RadioError::Register {
                bank,
                addr,
                reason: "user settings interface not available".into(),
            });
        }
        Ok(st.registers.get(&(bank, addr)).copied().unwrap_or(0))
    }
}

// ============================================================================
// Streams
// ============================================================================

struct ActiveBurst {
    index: usize,
    start_instant: Instant,
    rate: f64,
    sent: u64,
}

struct SimTxStream {
    state: Arc<Mutex<SimState>>,
    channels: Vec<usize>,
    spp: usize,
    events: mpsc::UnboundedSender<TxEvent>,
    burst: Option<ActiveBurst>,
}

impl SimTxStream {
    fn emit(&self, kind: TxEventKind, time: Option<HwTime>) {
        let channel = self.channels.first().copied().unwrap_or(0);
        // Receiver side may already be gone; events are advisory.
        let _ = self.events.send(TxEvent { kind, channel, time });
    }
}

#[async_trait]
impl TxStream for SimTxStream {
    fn channels(&self) -> &[usize] {
        &self.channels
    }

    fn max_samples_per_packet(&self) -> usize {
        self.spp
    }

    #[allow(clippy::cast_precision_loss)]
    async fn send(&mut self, buffers: &[Vec<Sample>], metadata: &TxMetadata) -> RadioResult<usize> {
        if buffers.len() != self.channels.len() {
            return Err(RadioError::Stream(format!(
                "expected {} buffers, got {}",
                self.channels.len(),
                buffers.len()
            )));
        }
        let n = buffers.first().map_or(0, Vec::len);
        let now = Instant::now();

        let pace_until = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            if self.burst.is_none() {
                if metadata.end_of_burst {
                    return Ok(n);
                }
                let now_hw = st.hw_time(now);
                let (start, late) = match metadata.time_spec {
                    Some(t) if t >= now_hw => (t, false),
                    Some(_) => (now_hw, true),
                    None => (now_hw, false),
                };
                let rate = st.rate(Direction::Tx, self.channels[0]);
                st.bursts.push(SimBurst {
                    start,
                    end: None,
                    channels: self.channels.clone(),
                    amplitudes: buffers
                        .iter()
                        .map(|b| b.first().map_or(0.0, |s| s.norm()))
                        .collect(),
                    phases: buffers
                        .iter()
                        .map(|b| b.first().map_or(0.0, |s| f64::from(s.arg())))
                        .collect(),
                    samples: 0,
                    late,
                });
                let start_instant = st.instant_at(start, now);
                self.burst = Some(ActiveBurst {
                    index: st.bursts.len() - 1,
                    start_instant,
                    rate,
                    sent: 0,
                });
                if late {
                    drop(st);
                    self.emit(TxEventKind::TimeError, Some(now_hw));
                    st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                }
                trace!(start = %start, late, "[SimRadio] Burst started");
            }

            let Some(burst) = self.burst.as_mut() else {
                return Ok(n);
            };

            if metadata.end_of_burst {
                let record = &mut st.bursts[burst.index];
                let end = record.start + Duration::from_secs_f64(burst.sent as f64 / burst.rate);
                record.end = Some(end);
                drop(st);
                self.burst = None;
                self.emit(TxEventKind::BurstAck, Some(end));
                return Ok(n);
            }

            burst.sent += n as u64;
            st.bursts[burst.index].samples = burst.sent;
            let ahead = u64::from(TX_LEAD_PACKETS) * self.spp as u64;
            let paced = burst.sent.saturating_sub(ahead) as f64 / burst.rate;
            burst.start_instant + Duration::from_secs_f64(paced)
        };

        tokio::time::sleep_until(pace_until).await;
        Ok(n)
    }
}

struct SimTxEvents {
    rx: mpsc::UnboundedReceiver<TxEvent>,
}

#[async_trait]
impl TxEventSource for SimTxEvents {
    async fn recv_event(&mut self, timeout: Duration) -> RadioResult<Option<TxEvent>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(event) => Ok(event),
            Err(_) => Ok(None),
        }
    }
}

struct SimRxStream {
    state: Arc<Mutex<SimState>>,
    channels: Vec<usize>,
    spp: usize,
}

#[async_trait]
impl RxStream for SimRxStream {
    fn channels(&self) -> &[usize] {
        &self.channels
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    async fn receive(
        &mut self,
        start: HwTime,
        duration: Duration,
        quit: &CancellationToken,
    ) -> RadioResult<RxCapture> {
        let now = Instant::now();
        let (rate, start_instant) = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now_hw = st.hw_time(now);
            if start < now_hw {
                return Err(RadioError::Late { at: start, now: now_hw });
            }
            let rate = st.rate(Direction::Rx, self.channels.first().copied().unwrap_or(0));
            (rate, st.instant_at(start, now))
        };

        let total = (duration.as_secs_f64() * rate).round() as usize;
        // Buffers grow per packet; `total` comes straight from the command.
        let mut samples: Vec<Vec<Sample>> = vec![Vec::new(); self.channels.len()];
        let mut produced = 0;
        let mut truncated = false;

        while produced < total {
            let n = self.spp.min(total - produced);
            let chunk_end =
                start_instant + Duration::from_secs_f64((produced + n) as f64 / rate);
            tokio::select! {
                () = tokio::time::sleep_until(chunk_end) => {}
                () = quit.cancelled() => {
                    truncated = true;
                    break;
                }
            }

            let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            for (buffer, &channel) in samples.iter_mut().zip(&self.channels) {
                buffer.reserve(n);
                buffer.extend((produced..produced + n).map(|i| {
                    st.synthesize(channel, start.as_secs() + i as f64 / rate)
                }));
            }
            produced += n;
        }

        Ok(RxCapture {
            channels: self.channels.clone(),
            samples,
            start,
            sample_rate: rate,
            truncated,
        })
    }
}
