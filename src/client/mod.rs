//! Interference detection: the client side of the channel-selection plane.
//!
//! Every mesh node runs one of these. The FSM thread alternates between
//! traffic monitoring, error monitoring and off-channel scans, reporting
//! scan scores and BCQI alerts to the orchestrator over multicast. Receive
//! threads forward switch commands into a bounded channel; the FSM thread is
//! the single consumer and executes them with priority over its idle tick.

pub mod fsm;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::comms::codec::{self, Action, ChannelObservation, ControlMessage, DedupCache, Payload};
use crate::comms::{self, ChannelSink, MAX_FRAME_SIZE, MessageSink, MulticastChannel};
use crate::config::Config;
use crate::probe::TrafficProbe;
use crate::radio::RadioControl;
use crate::scan::QualityScorer;
use fsm::{ClientAction, ClientEvent, ClientState, UniqueEventQueue, transition};

/// Idle tick of the client FSM driver loop.
const CLIENT_TICK: Duration = Duration::from_secs(5);

/// Depth of the external-command channel (receive threads -> FSM driver).
const EXTERNAL_QUEUE_SIZE: usize = 16;

/// Commands received from the orchestrator over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCommand {
    /// Switch to (or converge on) the announced frequency.
    Switch { freq: u32 },
}

/// Client FSM runtime and the state it carries between actions.
pub struct InterferenceDetection {
    state: ClientState,
    queue: UniqueEventQueue,

    radio: Arc<dyn RadioControl>,
    probe: Arc<dyn TrafficProbe>,
    scorer: Arc<dyn QualityScorer>,
    sink: Arc<dyn MessageSink>,

    mac_address: String,
    freq_list: Vec<u32>,
    channel_bandwidth: u16,
    client_beacon_count: u32,
    traffic_threshold: u64,
    channel_quality_index_threshold: u32,
    phy_error_limit: u64,
    tx_timeout_limit: u64,
    air_time_limit: f64,
    max_error_check: u32,
    max_switch_retries: u32,

    freq_index: isize,
    scan_freq: u32,
    operating_frequency: u32,
    switching_frequency: u32,
    channel_quality_index: Option<u32>,
    traffic_rate: u64,
    phy_error: u64,
    tx_timeout: u64,
    num_retries: u32,
}

impl InterferenceDetection {
    pub fn new(
        config: &Config,
        mac_address: String,
        radio: Arc<dyn RadioControl>,
        probe: Arc<dyn TrafficProbe>,
        scorer: Arc<dyn QualityScorer>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let r = &config.rmacs;
        let operating_frequency = match radio.current_freq() {
            Ok(freq) => freq,
            Err(e) => {
                log::warn!("Could not read mesh frequency at startup: {e}");
                r.starting_frequency
            }
        };
        InterferenceDetection {
            state: ClientState::Idle,
            queue: UniqueEventQueue::new(),
            radio,
            probe,
            scorer,
            sink,
            mac_address,
            freq_list: r.freq_list.clone(),
            channel_bandwidth: r.channel_bandwidth,
            client_beacon_count: r.client_beacon_count,
            traffic_threshold: r.traffic_threshold,
            channel_quality_index_threshold: r.channel_quality_index_threshold,
            phy_error_limit: r.phy_error_limit,
            tx_timeout_limit: r.tx_timeout_limit,
            air_time_limit: r.air_time_limit,
            max_error_check: r.max_error_check,
            max_switch_retries: r.max_switch_retries,
            freq_index: -1,
            scan_freq: r.starting_frequency,
            operating_frequency,
            switching_frequency: r.starting_frequency,
            channel_quality_index: None,
            traffic_rate: 0,
            phy_error: 0,
            tx_timeout: 0,
            num_retries: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Drive the FSM until the shutdown flag is raised.
    ///
    /// External commands wake the loop immediately; otherwise one
    /// TRAFFIC_MONITOR tick is queued per [`CLIENT_TICK`] while idle.
    pub fn run(&mut self, external: Receiver<ExternalCommand>, shutdown: &AtomicBool) {
        log::info!("RMACS client FSM is running");
        while !shutdown.load(Ordering::Relaxed) {
            match external.recv_timeout(CLIENT_TICK) {
                Ok(ExternalCommand::Switch { freq }) => self.handle_external_switch(freq),
                Err(RecvTimeoutError::Timeout) => {
                    if self.state == ClientState::Idle {
                        self.dispatch(ClientEvent::TrafficMonitor);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("RMACS client FSM stopped");
    }

    /// Queue one internal event and drain the queue to quiescence.
    pub fn dispatch(&mut self, event: ClientEvent) {
        self.queue.push(event);
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(event) = self.queue.pop() {
            self.process(event);
        }
    }

    fn process(&mut self, event: ClientEvent) {
        match transition(self.state, event) {
            Some((next, action)) => {
                log::info!("{:?} -> {next:?}", self.state);
                self.state = next;
                if let Some(action) = action {
                    self.run_action(action);
                }
            }
            None => {
                log::warn!("No transition for event {event:?} in state {:?}", self.state);
            }
        }
    }

    fn run_action(&mut self, action: ClientAction) {
        match action {
            ClientAction::MonitorTraffic => self.traffic_monitoring(),
            ClientAction::MonitorErrors => self.error_monitoring(),
            ClientAction::OffChannelScan => self.off_channel_scan(),
            ClientAction::OperatingChannelScan => self.operating_channel_scan(),
            ClientAction::SendBcqi => self.send_bcqi(),
            ClientAction::ReportChannelQuality => self.report_channel_quality(),
        }
    }

    /// Priority path for switch commands received from the orchestrator.
    ///
    /// Overrides whatever state the FSM is in. The announced frequency is
    /// recorded as the mesh operating frequency either way; the switch runs
    /// only when the local radio disagrees with it.
    pub fn handle_external_switch(&mut self, freq: u32) {
        log::info!(
            "External switch event in state {:?}: requested freq {freq}",
            self.state
        );
        self.operating_frequency = freq;
        let cur_freq = match self.radio.current_freq() {
            Ok(cur) => cur,
            Err(e) => {
                log::warn!("Could not read mesh frequency: {e}");
                self.switching_frequency
            }
        };
        if cur_freq == freq {
            log::debug!("Already operating at announced frequency {freq}");
            return;
        }
        self.switching_frequency = freq;
        self.state = ClientState::ChannelSwitch;
        self.switch_frequency();
        self.drain();
    }

    fn traffic_monitoring(&mut self) {
        let rate = match self.probe.tx_rate_kbps() {
            Ok(rate) => rate,
            Err(e) => {
                log::warn!("Traffic probe failed: {e}");
                0
            }
        };
        self.traffic_rate = rate;
        if rate > self.traffic_threshold {
            log::info!("Traffic rate: {rate} kbps");
            self.queue.push(ClientEvent::Traffic);
        } else {
            log::info!("No traffic, moving on to channel scan");
            self.queue.push(ClientEvent::NoTraffic);
        }
    }

    /// Sample the error counters until either a clean sample shows up or
    /// `max_error_check` consecutive samples exceeded a limit.
    fn error_monitoring(&mut self) {
        let mut error_count = 0;
        loop {
            if error_count >= self.max_error_check {
                log::info!(
                    "Reporting errors in ongoing traffic: phy_error {} tx_timeout {}",
                    self.phy_error,
                    self.tx_timeout
                );
                self.queue.push(ClientEvent::Error);
                return;
            }
            let sample = self.sample_errors();
            match sample {
                Some(true) => {
                    error_count += 1;
                    log::info!("Observed error in ongoing traffic: count = {error_count}");
                }
                Some(false) | None => {
                    log::info!("Observed no error in ongoing traffic");
                    self.queue.push(ClientEvent::NoError);
                    return;
                }
            }
        }
    }

    /// One error-monitor sample; `None` when the probe itself failed.
    fn sample_errors(&mut self) -> Option<bool> {
        let phy_error = self.probe.phy_error_delta().ok()?;
        let tx_timeout = self.probe.tx_timeout_delta().ok()?;
        let air_time = self.probe.air_time_percent().ok()?;
        self.phy_error = phy_error;
        self.tx_timeout = tx_timeout;
        Some(
            phy_error > self.phy_error_limit
                || tx_timeout > self.tx_timeout_limit
                || air_time > self.air_time_limit,
        )
    }

    /// Score the next candidate frequency in round-robin order.
    fn off_channel_scan(&mut self) {
        self.freq_index = (self.freq_index + 1).rem_euclid(self.freq_list.len() as isize);
        self.scan_freq = self.freq_list[self.freq_index as usize];
        self.channel_quality_index = match self.scorer.score(self.scan_freq) {
            Ok(quality) => {
                log::info!(
                    "Performed channel scan at freq {} with channel quality index {quality}",
                    self.scan_freq
                );
                Some(quality)
            }
            Err(e) => {
                log::info!("Channel scan at freq {} failed: {e}", self.scan_freq);
                None
            }
        };
        self.queue.push(ClientEvent::PerformedChannelScan);
    }

    /// Score the operating frequency and compare against the threshold.
    fn operating_channel_scan(&mut self) {
        let freq = match self.radio.current_freq() {
            Ok(freq) => freq,
            Err(e) => {
                log::warn!("Could not read mesh frequency: {e}");
                self.operating_frequency
            }
        };
        self.scan_freq = freq;
        match self.scorer.score(freq) {
            Ok(quality) => {
                self.channel_quality_index = Some(quality);
                if quality > self.channel_quality_index_threshold {
                    log::info!("Triggering bad channel quality index ({quality})");
                    self.queue.push(ClientEvent::BadChannelQualityIndex);
                } else {
                    log::info!("Triggering good channel quality index ({quality})");
                    self.queue.push(ClientEvent::GoodChannelQualityIndex);
                }
            }
            Err(e) => {
                log::info!("Operating channel scan failed: {e}");
                self.channel_quality_index = None;
                self.queue.push(ClientEvent::GoodChannelQualityIndex);
            }
        }
    }

    fn observation(&self) -> ChannelObservation {
        ChannelObservation {
            quality: self.channel_quality_index.unwrap_or_default(),
            tx_rate: self.traffic_rate,
            phy_error: self.phy_error,
            tx_timeout: self.tx_timeout,
        }
    }

    /// Send the BCQI alert, twice per socket.
    fn send_bcqi(&mut self) {
        let payload = Payload::bcqi(&self.mac_address, self.scan_freq, self.observation());
        let message = ControlMessage::command(payload);
        log::info!("Sending BCQI report to multicast group: freq {}", self.scan_freq);
        self.sink.deliver(&message, 2);
        self.queue.push(ClientEvent::SentBadChannelQualityIndex);
    }

    /// Report the off-channel scan score, once per socket.
    ///
    /// A failed scan produced no quality index; the report is skipped so the
    /// orchestrator's ledger never sees an empty quality.
    fn report_channel_quality(&mut self) {
        match self.channel_quality_index {
            Some(_) => {
                let payload =
                    Payload::quality_report(&self.mac_address, self.scan_freq, self.observation());
                let message = ControlMessage::command(payload);
                log::info!(
                    "Sending channel quality report to multicast group: freq {}",
                    self.scan_freq
                );
                self.sink.deliver(&message, 1);
            }
            None => {
                log::info!("Skipping channel quality report, scan yielded no index");
            }
        }
        self.queue.push(ClientEvent::ReportedChannelQuality);
    }

    /// Execute a requested channel switch and verify the outcome.
    fn switch_frequency(&mut self) {
        let cur_freq = match self.radio.current_freq() {
            Ok(cur) => cur,
            Err(e) => {
                log::warn!("Could not read mesh frequency before switch: {e}");
                self.bump_retry();
                self.queue.push(ClientEvent::SwitchUnsuccessful);
                return;
            }
        };
        log::info!(
            "Current operating frequency {cur_freq}, requested switch frequency {}",
            self.switching_frequency
        );
        if cur_freq == self.switching_frequency {
            log::info!("Mesh node already operating at requested frequency {cur_freq}");
            self.queue.push(ClientEvent::SwitchNotRequired);
            return;
        }

        if let Err(e) = self.radio.switch_freq(
            self.switching_frequency,
            self.channel_bandwidth,
            self.client_beacon_count,
        ) {
            log::warn!("Switching frequency error occurred: {e}");
            self.bump_retry();
            self.queue.push(ClientEvent::SwitchUnsuccessful);
            return;
        }

        // Let the CSA beacons go out before verifying.
        thread::sleep(Duration::from_secs(u64::from(self.client_beacon_count)));
        match self.radio.current_freq() {
            Ok(now) if now == self.switching_frequency => {
                log::info!("Frequency switch successful, operating frequency: {now}");
                self.num_retries = 0;
                self.operating_frequency = now;
                self.queue.push(ClientEvent::SwitchSuccessful);
            }
            Ok(now) => {
                log::info!(
                    "Frequency switch unsuccessful, still at {now} (retry {})",
                    self.num_retries
                );
                self.bump_retry();
                self.queue.push(ClientEvent::SwitchUnsuccessful);
            }
            Err(e) => {
                log::warn!("Could not verify switch: {e}");
                self.bump_retry();
                self.queue.push(ClientEvent::SwitchUnsuccessful);
            }
        }
    }

    fn bump_retry(&mut self) {
        if self.num_retries < self.max_switch_retries {
            self.num_retries += 1;
        } else {
            log::warn!(
                "Frequency switch failed {} times, giving up until the next command",
                self.num_retries
            );
            self.num_retries = 0;
        }
    }
}

/// Running client: FSM driver thread plus one receive thread per socket.
pub struct ClientHandle {
    pub threads: Vec<JoinHandle<()>>,
}

/// Start the client role: open control channels, spawn the receive threads
/// and the FSM driver.
pub fn start(
    config: &Config,
    mac_address: String,
    radio: Arc<dyn RadioControl>,
    probe: Arc<dyn TrafficProbe>,
    scorer: Arc<dyn QualityScorer>,
    shutdown: Arc<AtomicBool>,
) -> ClientHandle {
    let channels = comms::open_channels(&config.rmacs.radio_interfaces, |interface| {
        config.endpoint(interface).map(|e| e.clone())
    });
    let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink::new(channels.clone()));
    let dedup = Arc::new(Mutex::new(DedupCache::new()));
    let (external_tx, external_rx) = bounded(EXTERNAL_QUEUE_SIZE);

    let mut threads = Vec::new();
    for channel in channels {
        let dedup = Arc::clone(&dedup);
        let external_tx = external_tx.clone();
        let shutdown = Arc::clone(&shutdown);
        let name = format!("rmacs-client-rx-{}", channel.interface());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || receive_loop(channel, dedup, external_tx, shutdown))
            .expect("failed to spawn client receive thread");
        threads.push(handle);
    }

    let mut client = InterferenceDetection::new(config, mac_address, radio, probe, scorer, sink);
    let driver_shutdown = Arc::clone(&shutdown);
    let driver = thread::Builder::new()
        .name("rmacs-client-fsm".to_string())
        .spawn(move || client.run(external_rx, &driver_shutdown))
        .expect("failed to spawn client FSM thread");
    threads.push(driver);

    ClientHandle { threads }
}

/// Per-socket receive loop: decode, de-duplicate, forward switch commands.
fn receive_loop(
    channel: Arc<MulticastChannel>,
    dedup: Arc<Mutex<DedupCache>>,
    external_tx: Sender<ExternalCommand>,
    shutdown: Arc<AtomicBool>,
) {
    let interface = channel.interface().to_string();
    log::info!("Listening on interface: {interface}");
    let mut buf = [0u8; MAX_FRAME_SIZE];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, _addr) = match channel.recv(&mut buf) {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                log::warn!("Connection forcibly closed on {interface}");
                break;
            }
            Err(e) => {
                log::error!("Receive error on {interface}: {e}");
                continue;
            }
        };
        let message = match codec::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to decode frame on {interface}: {e}");
                continue;
            }
        };
        let payload = message.payload;
        if !dedup.lock().observe(payload.message_id, Instant::now()) {
            log::debug!(
                "Duplicate message {} received on {interface}, ignoring",
                payload.message_id
            );
            continue;
        }
        match payload.a_id {
            Action::SwitchFrequency | Action::OperatingFrequency => {
                log::info!(
                    "Handling {} for freq {} received on {interface}",
                    payload.a_id,
                    payload.freq
                );
                if external_tx
                    .try_send(ExternalCommand::Switch { freq: payload.freq })
                    .is_err()
                {
                    log::warn!("External command queue full, dropping switch command");
                }
            }
            // Reports flow client -> orchestrator only.
            Action::BadChannelQualityIndex | Action::ChannelQualityReport => {}
        }
    }
    log::info!("Receive loop on {interface} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{Error, Result};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct FakeRadio {
        freq: StdMutex<u32>,
        switches: StdMutex<Vec<u32>>,
        apply_switch: bool,
    }

    impl FakeRadio {
        fn new(freq: u32, apply_switch: bool) -> Self {
            FakeRadio {
                freq: StdMutex::new(freq),
                switches: StdMutex::new(Vec::new()),
                apply_switch,
            }
        }
    }

    impl RadioControl for FakeRadio {
        fn current_freq(&self) -> Result<u32> {
            Ok(*self.freq.lock().unwrap())
        }

        fn switch_freq(&self, freq: u32, _bandwidth: u16, _beacons: u32) -> Result<()> {
            self.switches.lock().unwrap().push(freq);
            if self.apply_switch {
                *self.freq.lock().unwrap() = freq;
            }
            Ok(())
        }
    }

    /// Scripted probe. The phy-error read pops the next (phy, timeout, air)
    /// tuple, matching the order `sample_errors` reads the counters in.
    struct FakeProbe {
        rates: StdMutex<VecDeque<u64>>,
        errors: StdMutex<VecDeque<(u64, u64, f64)>>,
        current: StdMutex<(u64, u64, f64)>,
    }

    impl FakeProbe {
        fn new(rates: Vec<u64>, errors: Vec<(u64, u64, f64)>) -> Self {
            FakeProbe {
                rates: StdMutex::new(rates.into()),
                errors: StdMutex::new(errors.into()),
                current: StdMutex::new((0, 0, 0.0)),
            }
        }
    }

    impl TrafficProbe for FakeProbe {
        fn tx_rate_kbps(&self) -> Result<u64> {
            Ok(self.rates.lock().unwrap().pop_front().unwrap_or(0))
        }

        fn phy_error_delta(&self) -> Result<u64> {
            let sample = self.errors.lock().unwrap().pop_front().unwrap_or((0, 0, 0.0));
            *self.current.lock().unwrap() = sample;
            Ok(sample.0)
        }

        fn tx_timeout_delta(&self) -> Result<u64> {
            Ok(self.current.lock().unwrap().1)
        }

        fn air_time_percent(&self) -> Result<f64> {
            Ok(self.current.lock().unwrap().2)
        }
    }

    struct FakeScorer {
        scores: StdMutex<VecDeque<Result<u32>>>,
        scanned: StdMutex<Vec<u32>>,
    }

    impl FakeScorer {
        fn new(scores: Vec<Result<u32>>) -> Self {
            FakeScorer {
                scores: StdMutex::new(scores.into()),
                scanned: StdMutex::new(Vec::new()),
            }
        }
    }

    impl QualityScorer for FakeScorer {
        fn score(&self, freq: u32) -> Result<u32> {
            self.scanned.lock().unwrap().push(freq);
            self.scores
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::Scan("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(ControlMessage, usize)>>,
    }

    impl MessageSink for RecordingSink {
        fn deliver(&self, message: &ControlMessage, repeat: usize) {
            self.sent.lock().unwrap().push((message.clone(), repeat));
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.rmacs.freq_list = vec![5180, 5200, 5220];
        config.rmacs.starting_frequency = 5180;
        config.rmacs.channel_quality_index_threshold = 5;
        config.rmacs.traffic_threshold = 100;
        config.rmacs.max_error_check = 3;
        // Keep the tests free of CSA settle sleeps.
        config.rmacs.client_beacon_count = 0;
        config
    }

    fn client_with(
        radio: Arc<FakeRadio>,
        probe: Arc<FakeProbe>,
        scorer: Arc<FakeScorer>,
        sink: Arc<RecordingSink>,
    ) -> InterferenceDetection {
        InterferenceDetection::new(
            &test_config(),
            "aa:bb:cc:dd:ee:ff".to_string(),
            radio,
            probe,
            scorer,
            sink,
        )
    }

    #[test]
    fn off_channel_scans_walk_the_freq_list_round_robin() {
        let radio = Arc::new(FakeRadio::new(5180, true));
        let probe = Arc::new(FakeProbe::new(vec![0, 0, 0, 0], Vec::new()));
        let scorer = Arc::new(FakeScorer::new(vec![Ok(1), Ok(2), Ok(3), Ok(4)]));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(radio, probe, Arc::clone(&scorer), sink);

        for _ in 0..4 {
            assert_eq!(client.state(), ClientState::Idle);
            client.dispatch(ClientEvent::TrafficMonitor);
        }
        assert_eq!(*scorer.scanned.lock().unwrap(), vec![5180, 5200, 5220, 5180]);
    }

    #[test]
    fn good_quality_resumes_traffic_monitoring() {
        let radio = Arc::new(FakeRadio::new(5180, true));
        // First tick sees traffic, the follow-up monitor round sees none and
        // drops into an off-channel scan.
        let probe = Arc::new(FakeProbe::new(
            vec![500, 0],
            vec![(300, 0, 0.0), (300, 0, 0.0), (300, 0, 0.0)],
        ));
        // Operating scan scores 3 (good), then the off-channel scan scores 1.
        let scorer = Arc::new(FakeScorer::new(vec![Ok(3), Ok(1)]));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(radio, probe, Arc::clone(&scorer), Arc::clone(&sink));

        client.dispatch(ClientEvent::TrafficMonitor);

        assert_eq!(client.state(), ClientState::Idle);
        // Operating scan scored the current freq, then the cursor scan hit 5180.
        assert_eq!(*scorer.scanned.lock().unwrap(), vec![5180, 5180]);
        // Only the quality report went out, once per socket.
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.payload.a_id, Action::ChannelQualityReport);
        assert_eq!(sent[0].1, 1);
    }

    #[test]
    fn bad_quality_sends_bcqi_twice_per_socket() {
        let radio = Arc::new(FakeRadio::new(5200, true));
        let probe = Arc::new(FakeProbe::new(
            vec![500],
            vec![(300, 0, 0.0), (300, 0, 0.0), (300, 0, 0.0)],
        ));
        let scorer = Arc::new(FakeScorer::new(vec![Ok(8)]));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(radio, probe, scorer, Arc::clone(&sink));

        client.dispatch(ClientEvent::TrafficMonitor);

        assert_eq!(client.state(), ClientState::Idle);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (message, repeat) = &sent[0];
        assert_eq!(message.payload.a_id, Action::BadChannelQualityIndex);
        assert_eq!(message.payload.freq, 5200);
        assert_eq!(message.payload.qual, Some(8));
        assert_eq!(*repeat, 2);
    }

    #[test]
    fn external_switch_overrides_any_state_and_verifies() {
        let radio = Arc::new(FakeRadio::new(5180, true));
        let probe = Arc::new(FakeProbe::new(Vec::new(), Vec::new()));
        let scorer = Arc::new(FakeScorer::new(Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(Arc::clone(&radio), probe, scorer, sink);
        client.state = ClientState::MonitorTraffic;
        client.num_retries = 2;

        client.handle_external_switch(5200);

        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(*radio.switches.lock().unwrap(), vec![5200]);
        assert_eq!(client.operating_frequency, 5200);
        assert_eq!(client.num_retries, 0);
    }

    #[test]
    fn external_switch_to_current_freq_is_not_required() {
        let radio = Arc::new(FakeRadio::new(5180, true));
        let probe = Arc::new(FakeProbe::new(Vec::new(), Vec::new()));
        let scorer = Arc::new(FakeScorer::new(Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(Arc::clone(&radio), probe, scorer, sink);

        client.handle_external_switch(5180);

        assert_eq!(client.state(), ClientState::Idle);
        assert!(radio.switches.lock().unwrap().is_empty());
    }

    #[test]
    fn unverified_switch_counts_a_retry() {
        // The radio accepts the command but never actually moves.
        let radio = Arc::new(FakeRadio::new(5180, false));
        let probe = Arc::new(FakeProbe::new(Vec::new(), Vec::new()));
        let scorer = Arc::new(FakeScorer::new(Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(Arc::clone(&radio), probe, scorer, sink);

        client.handle_external_switch(5200);

        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(client.num_retries, 1);
        assert_eq!(*radio.switches.lock().unwrap(), vec![5200]);
    }

    #[test]
    fn failed_scan_still_completes_the_report_cycle_without_sending() {
        let radio = Arc::new(FakeRadio::new(5180, true));
        let probe = Arc::new(FakeProbe::new(vec![0], Vec::new()));
        let scorer = Arc::new(FakeScorer::new(vec![Err(Error::Scan("no samples".into()))]));
        let sink = Arc::new(RecordingSink::default());
        let mut client = client_with(radio, probe, scorer, Arc::clone(&sink));

        client.dispatch(ClientEvent::TrafficMonitor);

        assert_eq!(client.state(), ClientState::Idle);
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
