//! Orchestrator: frequency selection and partial frequency hopping.
//!
//! The single orchestrator node aggregates client reports into the quality
//! ledger, reacts to BCQI alerts by probing the top-ranked candidate
//! frequencies in rotation, and settles on the best one once it has stayed
//! best for `stability_threshold` consecutive re-evaluations. The ledger is
//! owned exclusively by the FSM thread; receive threads forward decoded
//! payloads over a bounded inbox channel.

pub mod fsm;
pub mod ledger;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::comms::codec::{self, Action, ControlMessage, DedupCache, Payload};
use crate::comms::{self, ChannelSink, MAX_FRAME_SIZE, MessageSink, MulticastChannel};
use crate::config::Config;
use crate::radio::RadioControl;
use fsm::{ServerAction, ServerEvent, ServerState, transition};
use ledger::QualityLedger;

/// Driver loop tick of the server FSM.
const SERVER_TICK: Duration = Duration::from_secs(2);

/// Depth of the inbox channel (receive threads -> FSM driver).
const INBOX_QUEUE_SIZE: usize = 64;

/// Client messages forwarded by the receive threads.
#[derive(Debug, Clone)]
pub enum ServerInbox {
    Bcqi(Payload),
    Report(Payload),
}

/// Orchestrator runtime and the hopping state it carries between actions.
pub struct RmacsServer {
    state: ServerState,
    queue: VecDeque<ServerEvent>,
    ledger: QualityLedger,

    radio: Arc<dyn RadioControl>,
    sink: Arc<dyn MessageSink>,
    mac_address: String,

    seq_limit: usize,
    hop_interval: Duration,
    stability_threshold: u32,
    channel_bandwidth: u16,
    beacon_count: u32,
    buffer_period: Duration,
    bcqi_debounce: Duration,
    broadcast_interval: Duration,

    operating_frequency: u32,
    switch_freq: u32,
    top_freq: Option<u32>,
    pfh_index: usize,
    stability_counter: u32,
    last_broadcast: Instant,
    last_bcqi_accept: Option<Instant>,
    pending_bcqi: Option<Payload>,
    pending_reports: VecDeque<Payload>,
    /// Clone of the inbox receiver, drained mid-hop so reports arriving
    /// during a hopping pass reach the ledger before the next re-rank.
    inbox: Option<Receiver<ServerInbox>>,
}

impl RmacsServer {
    pub fn new(
        config: &Config,
        mac_address: String,
        radio: Arc<dyn RadioControl>,
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
        RmacsServer {
            state: ServerState::Idle,
            queue: VecDeque::new(),
            ledger: QualityLedger::new(config.report_expiry_window()),
            radio,
            sink,
            mac_address,
            seq_limit: r.seq_limit,
            hop_interval: config.hop_interval(),
            stability_threshold: r.stability_threshold,
            channel_bandwidth: r.channel_bandwidth,
            beacon_count: r.beacon_count,
            buffer_period: Duration::from_secs(r.buffer_period),
            bcqi_debounce: config.bcqi_debounce_window(),
            broadcast_interval: config.broadcast_interval(),
            operating_frequency,
            switch_freq: operating_frequency,
            top_freq: None,
            pfh_index: 0,
            stability_counter: 0,
            last_broadcast: Instant::now(),
            last_bcqi_accept: None,
            pending_bcqi: None,
            pending_reports: VecDeque::new(),
            inbox: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn operating_frequency(&self) -> u32 {
        self.operating_frequency
    }

    /// Drive the orchestrator until the shutdown flag is raised.
    pub fn run(&mut self, inbox: Receiver<ServerInbox>, shutdown: &AtomicBool) {
        log::info!("RMACS server FSM is running");
        self.inbox = Some(inbox.clone());
        while !shutdown.load(Ordering::Relaxed) {
            match inbox.recv_timeout(SERVER_TICK) {
                Ok(event) => self.accept(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(event) = inbox.try_recv() {
                self.accept(event);
            }
            self.tick();
        }
        self.reset();
        log::info!("RMACS server FSM stopped");
    }

    /// Buffer one forwarded client message, applying BCQI debouncing.
    pub fn accept(&mut self, event: ServerInbox) {
        self.accept_at(event, Instant::now());
    }

    fn accept_at(&mut self, event: ServerInbox, now: Instant) {
        match event {
            ServerInbox::Bcqi(payload) => {
                let operating = match self.radio.current_freq() {
                    Ok(freq) => freq,
                    Err(e) => {
                        log::warn!("Could not read mesh frequency: {e}");
                        self.operating_frequency
                    }
                };
                if payload.freq != operating {
                    log::info!(
                        "BCQI for freq {} is not for the operating freq {operating}, \
                         not triggering partial frequency hopping",
                        payload.freq
                    );
                    return;
                }
                let accept = match self.last_bcqi_accept {
                    Some(last) => now.duration_since(last) > self.bcqi_debounce,
                    None => true,
                };
                if accept {
                    log::info!(
                        "Accepted BCQI for operating freq {} from {}",
                        payload.freq,
                        payload.device
                    );
                    self.last_bcqi_accept = Some(now);
                    self.pending_bcqi = Some(payload);
                } else {
                    log::info!(
                        "BCQI from {} within the debounce window, a similar alert \
                         was already addressed",
                        payload.device
                    );
                }
            }
            ServerInbox::Report(payload) => {
                self.pending_reports.push_back(payload);
            }
        }
    }

    /// One driver-loop tick: promote buffered messages into FSM events.
    pub fn tick(&mut self) {
        if self.state == ServerState::Idle {
            if let Some(payload) = self.pending_bcqi.take() {
                self.ingest(&payload);
                self.dispatch(ServerEvent::BadChannelQualityIndex);
            } else if self.last_broadcast.elapsed() >= self.broadcast_interval {
                log::info!("Broadcasting operating frequency");
                self.last_broadcast = Instant::now();
                self.dispatch(ServerEvent::PeriodicOperatingFreqBroadcast);
            }
        }
        if !self.pending_reports.is_empty() {
            self.dispatch(ServerEvent::ChannelQualityReport);
        }
    }

    /// Queue one event and drain the queue to quiescence.
    pub fn dispatch(&mut self, event: ServerEvent) {
        self.queue.push_back(event);
        while let Some(event) = self.queue.pop_front() {
            self.process(event);
        }
    }

    fn process(&mut self, event: ServerEvent) {
        match transition(self.state, event) {
            Some((next, action)) => {
                log::info!("{:?} -> {next:?}", self.state);
                self.state = next;
                if let Some(action) = action {
                    self.run_action(action);
                }
            }
            None => {
                log::info!("No transition for event {event:?} in state {:?}", self.state);
            }
        }
    }

    fn run_action(&mut self, action: ServerAction) {
        match action {
            ServerAction::PartialFrequencyHopping => self.partial_frequency_hopping(),
            ServerAction::IngestReports => self.ingest_reports(),
            ServerAction::BroadcastOperatingFreq => self.broadcast_operating_freq(),
            ServerAction::SendSwitchRequest => self.send_switch_request(),
        }
    }

    /// Fold one quality-bearing payload into the ledger.
    fn ingest(&mut self, payload: &Payload) {
        let Some(quality) = payload.qual else {
            log::warn!(
                "Ignoring {} from {} without a quality index",
                payload.a_id,
                payload.device
            );
            return;
        };
        self.ledger
            .ingest(payload.freq, &payload.device, quality, Instant::now());
    }

    /// UPDATE_FREQ_HOPPING_SEQUENCE: drain buffered channel quality reports.
    fn ingest_reports(&mut self) {
        while let Some(payload) = self.pending_reports.pop_front() {
            log::info!(
                "Updating channel quality report for freq {} from {}",
                payload.freq,
                payload.device
            );
            self.ingest(&payload);
        }
        self.queue.push_back(ServerEvent::ChannelQualityUpdateComplete);
    }

    /// BROADCAST_OPERATING_FREQ: announce the operating frequency everywhere.
    fn broadcast_operating_freq(&mut self) {
        let freq = match self.radio.current_freq() {
            Ok(freq) => freq,
            Err(e) => {
                log::warn!("Could not read mesh frequency: {e}");
                self.operating_frequency
            }
        };
        let payload = Payload::operating_frequency(&self.mac_address, freq);
        log::info!("Broadcasting operating freq {freq}");
        self.sink.deliver(&ControlMessage::command(payload), 1);
        self.queue.push_back(ServerEvent::BroadcastComplete);
    }

    /// SEND_CHANNEL_SWITCH_REQUEST: command all clients onto `switch_freq`.
    ///
    /// A request equal to the adopted operating frequency is suppressed; the
    /// orchestrator never commands a switch to the frequency the mesh is
    /// already settled on.
    fn send_switch_request(&mut self) {
        if self.switch_freq == self.operating_frequency {
            log::debug!(
                "Suppressing switch request for operating frequency {}",
                self.switch_freq
            );
        } else {
            let payload = Payload::switch_frequency(&self.mac_address, self.switch_freq);
            log::info!("Sending channel switch request for freq {}", self.switch_freq);
            self.sink.deliver(&ControlMessage::command(payload), 1);
        }
        self.queue.push_back(ServerEvent::ChannelSwitchRequestSent);
    }

    /// PARTIAL_FREQUENCY_HOPPING: one iteration of the adaptive hop.
    ///
    /// Probes the top `seq_limit` candidates in rotation. The candidate is
    /// switched to locally, then the ledger is re-ranked; reports that came
    /// in while the radio sat on the candidate are thereby observed. The hop
    /// ends once the best-ranked frequency survived `stability_threshold`
    /// consecutive re-rankings.
    fn partial_frequency_hopping(&mut self) {
        let scored = self.ledger.scored();
        if scored.is_empty() {
            log::warn!("No scored frequencies in the ledger, ending frequency hopping");
            self.finish_hopping();
            return;
        }
        if self.top_freq.is_none() {
            self.top_freq = Some(scored[0]);
        }
        if self.stability_counter > 0 {
            thread::sleep(self.hop_interval);
        }

        let limit = self.seq_limit.min(scored.len());
        let candidate = scored[self.pfh_index % limit];
        self.pfh_index = (self.pfh_index + 1) % limit;
        log::info!(
            "Executing partial frequency hopping, candidate {candidate}, stability count: {}",
            self.stability_counter
        );
        self.switch_freq = candidate;
        self.local_switch(candidate);

        // Re-rank with whatever reports arrived during the switch.
        self.absorb_pending_reports();
        let new_best = self.ledger.scored().first().copied().unwrap_or(candidate);
        if Some(new_best) == self.top_freq {
            self.stability_counter += 1;
            log::info!(
                "Top frequency {new_best} remained the same for {} consecutive checks",
                self.stability_counter
            );
        } else {
            self.stability_counter = 0;
            self.top_freq = Some(new_best);
            log::info!("Top frequency changed to {new_best}");
        }

        if self.stability_counter >= self.stability_threshold {
            let top = new_best;
            log::info!(
                "Top frequency {top} has been stable for {} consecutive checks, adopting it",
                self.stability_threshold
            );
            self.operating_frequency = top;
            self.switch_freq = top;
            self.local_switch(top);
            self.finish_hopping();
        } else {
            self.queue.push_back(ServerEvent::ChannelSwitchRequest);
        }
    }

    fn finish_hopping(&mut self) {
        self.stability_counter = 0;
        self.pfh_index = 0;
        self.top_freq = None;
        self.queue.push_back(ServerEvent::FrequencyHoppingComplete);
    }

    /// Fold reports that arrived mid-hop into the ledger.
    ///
    /// The driver loop cannot run while a hopping pass holds the FSM thread,
    /// so the hop drains the inbox itself before every re-rank.
    fn absorb_pending_reports(&mut self) {
        if let Some(inbox) = self.inbox.clone() {
            while let Ok(event) = inbox.try_recv() {
                self.accept(event);
            }
        }
        while let Some(payload) = self.pending_reports.pop_front() {
            self.ingest(&payload);
        }
    }

    /// Switch the local radio and verify the CSA outcome.
    ///
    /// Failures are logged and hopping continues; the next iteration gets
    /// another chance.
    fn local_switch(&mut self, freq: u32) {
        let cur_freq = match self.radio.current_freq() {
            Ok(cur) => cur,
            Err(e) => {
                log::warn!("Could not read mesh frequency before switch: {e}");
                return;
            }
        };
        if cur_freq == freq {
            log::info!("Mesh node already operating at requested freq {freq}");
            return;
        }
        if let Err(e) = self
            .radio
            .switch_freq(freq, self.channel_bandwidth, self.beacon_count)
        {
            log::error!("Channel switch announcement failed: {e}");
            return;
        }
        log::info!("Waiting for CSA to be established");
        thread::sleep(Duration::from_secs(u64::from(self.beacon_count)) + self.buffer_period);
        match self.radio.current_freq() {
            Ok(now) if now == freq => {
                log::info!("CSA successful, node switched to freq {now}");
            }
            Ok(now) => {
                log::info!("CSA not successful, current operating freq {now}");
            }
            Err(e) => {
                log::warn!("Could not verify CSA outcome: {e}");
            }
        }
    }

    /// Drop buffered client messages, the last duty before shutdown.
    fn reset(&mut self) {
        self.state = ServerState::ResetClientMessages;
        self.pending_bcqi = None;
        self.pending_reports.clear();
        log::info!("Server message buffers reset");
        self.state = ServerState::Idle;
    }
}

/// Running orchestrator: FSM driver plus one receive thread per socket.
pub struct ServerHandle {
    pub threads: Vec<JoinHandle<()>>,
}

/// Start the orchestrator role: open control channels, spawn the receive
/// threads and the FSM driver.
pub fn start(
    config: &Config,
    mac_address: String,
    radio: Arc<dyn RadioControl>,
    shutdown: Arc<AtomicBool>,
) -> ServerHandle {
    let channels = comms::open_channels(&config.rmacs.radio_interfaces, |interface| {
        config.endpoint(interface).map(|e| e.clone())
    });
    let sink: Arc<dyn MessageSink> = Arc::new(ChannelSink::new(channels.clone()));
    let dedup = Arc::new(Mutex::new(DedupCache::new()));
    let (inbox_tx, inbox_rx) = bounded(INBOX_QUEUE_SIZE);

    let mut threads = Vec::new();
    for channel in channels {
        let dedup = Arc::clone(&dedup);
        let inbox_tx = inbox_tx.clone();
        let shutdown = Arc::clone(&shutdown);
        let name = format!("rmacs-server-rx-{}", channel.interface());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || receive_loop(channel, dedup, inbox_tx, shutdown))
            .expect("failed to spawn server receive thread");
        threads.push(handle);
    }

    let mut server = RmacsServer::new(config, mac_address, radio, sink);
    let driver_shutdown = Arc::clone(&shutdown);
    let driver = thread::Builder::new()
        .name("rmacs-server-fsm".to_string())
        .spawn(move || server.run(inbox_rx, &driver_shutdown))
        .expect("failed to spawn server FSM thread");
    threads.push(driver);

    ServerHandle { threads }
}

/// Per-socket receive loop: decode, de-duplicate, forward client reports.
fn receive_loop(
    channel: Arc<MulticastChannel>,
    dedup: Arc<Mutex<DedupCache>>,
    inbox_tx: Sender<ServerInbox>,
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
        let forwarded = match payload.a_id {
            Action::BadChannelQualityIndex => {
                log::info!(
                    "Received BCQI report for freq {} from {} on {interface}",
                    payload.freq,
                    payload.device
                );
                inbox_tx.try_send(ServerInbox::Bcqi(payload))
            }
            Action::ChannelQualityReport => {
                log::info!(
                    "Received channel quality report for freq {} from {} on {interface}",
                    payload.freq,
                    payload.device
                );
                inbox_tx.try_send(ServerInbox::Report(payload))
            }
            // The orchestrator's own announcements echo back; nothing to do.
            Action::OperatingFrequency | Action::SwitchFrequency => Ok(()),
        };
        if forwarded.is_err() {
            log::warn!("Server inbox full, dropping message received on {interface}");
        }
    }
    log::info!("Receive loop on {interface} stopped");
}
