use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::fec::FecConfig;
use crate::media::DecodeSink;
use crate::packet::MAX_DATAGRAM_LEN;
use crate::pipeline::ReceivePipeline;
use crate::reassembly::ReassemblyConfig;
use crate::stats::{RateMeter, StreamStats};
use crate::transport::{DatagramSource, UdpTransport};

/// How long a receive call may block before the loop re-checks for stop.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between statistics snapshots.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// One byte past the largest valid datagram, so a longer one is seen as
/// oversize instead of silently truncated to a valid length.
const RECV_BUFFER_LEN: usize = MAX_DATAGRAM_LEN + 1;

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Local address the UDP socket binds to.
    pub bind_addr: String,
    pub recv_timeout: Duration,
    pub stats_interval: Duration,
    pub fec: FecConfig,
    pub reassembly: ReassemblyConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5600".to_string(),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            stats_interval: STATS_INTERVAL,
            fec: FecConfig::default(),
            reassembly: ReassemblyConfig::default(),
        }
    }
}

/// Connection state as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not started, or stopped.
    #[default]
    Idle,
    /// Started, no valid packet yet.
    Connecting,
    /// At least one valid packet received.
    Connected,
    /// The transport failed; the loop has exited and will not restart itself.
    Error(String),
}

type SharedSink = Arc<Mutex<Option<Box<dyn DecodeSink>>>>;

/// Observation points written by the worker, read by anyone.
#[derive(Default)]
struct Shared {
    stats: RwLock<StreamStats>,
    state: RwLock<ConnectionState>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!(old_state = ?*current, new_state = ?state, "state transition");
            *current = state;
        }
    }
}

/// Stream receiver: owns the socket and the worker thread that drives
/// datagrams through [`ReceivePipeline`] into a [`DecodeSink`].
///
/// ```no_run
/// use std::sync::mpsc;
/// use fecstream::{CodingUnit, Receiver, ReceiverConfig};
///
/// let (tx, rx) = mpsc::channel::<CodingUnit>();
/// let mut receiver = Receiver::new(ReceiverConfig::default());
/// receiver.start(Box::new(tx)).unwrap();
/// while let Ok(unit) = rx.recv() {
///     println!("unit type {} ({} bytes)", unit.unit_type, unit.data.len());
/// }
/// ```
pub struct Receiver {
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    sink: SharedSink,
    worker: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Shared::default()),
            sink: Arc::new(Mutex::new(None)),
            worker: None,
            local_addr: None,
        }
    }

    /// Bind the configured UDP address and start receiving into `sink`.
    ///
    /// If already running, only the sink is replaced.
    pub fn start(&mut self, sink: Box<dyn DecodeSink>) -> Result<()> {
        if self.is_running() {
            self.replace_sink(sink);
            return Ok(());
        }

        let transport = UdpTransport::bind(&self.config.bind_addr, self.config.recv_timeout)?;
        let local_addr = transport.local_addr()?;
        tracing::info!(addr = %local_addr, "stream receiver listening");

        self.start_with_transport(Box::new(transport), sink)?;
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Start receiving from an arbitrary datagram source.
    ///
    /// If already running, `source` is dropped and only the sink is replaced.
    pub fn start_with_transport(
        &mut self,
        source: Box<dyn DatagramSource>,
        sink: Box<dyn DecodeSink>,
    ) -> Result<()> {
        if self.is_running() {
            self.replace_sink(sink);
            return Ok(());
        }
        // Reap a worker that ended on its own after a transport failure.
        self.join_worker();

        *self.sink.lock() = Some(sink);
        *self.shared.stats.write() = StreamStats::default();
        self.shared.set_state(ConnectionState::Connecting);
        self.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            source,
            pipeline: ReceivePipeline::new(self.config.fec.clone(), self.config.reassembly.clone()),
            running: self.running.clone(),
            shared: self.shared.clone(),
            sink: self.sink.clone(),
            stats_interval: self.config.stats_interval,
        };

        let spawned = thread::Builder::new()
            .name("fecstream-recv".to_string())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.sink.lock().take();
                self.shared.set_state(ConnectionState::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Stop the worker, close the socket and release the sink.
    ///
    /// All FEC groups, fragment buffers and dedup history go with the
    /// worker; the next start begins from scratch.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join_worker();
        self.sink.lock().take();
        self.local_addr = None;
        self.shared.set_state(ConnectionState::Idle);
        tracing::info!("stream receiver stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest published statistics snapshot.
    pub fn stats(&self) -> StreamStats {
        *self.shared.stats.read()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    /// Address the UDP socket is bound to, when started via [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn replace_sink(&self, sink: Box<dyn DecodeSink>) {
        *self.sink.lock() = Some(sink);
        tracing::debug!("receiver already running, decode sink replaced");
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("receive worker panicked");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// State moved onto the receive thread.
struct Worker {
    source: Box<dyn DatagramSource>,
    pipeline: ReceivePipeline,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    sink: SharedSink,
    stats_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let mut meter = RateMeter::new(Instant::now());
        let mut next_publish = Instant::now() + self.stats_interval;
        let mut connected = false;

        while self.running.load(Ordering::SeqCst) {
            match self.source.receive(&mut buf) {
                Ok(Some(len)) => self.handle_datagram(&buf[..len], &mut connected),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "transport failure, receive loop exiting");
                    self.shared.set_state(ConnectionState::Error(e.to_string()));
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_publish {
                self.publish(now, &mut meter);
                next_publish = now + self.stats_interval;
            }
        }

        self.publish(Instant::now(), &mut meter);
        self.source.close();
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("receive loop exited");
    }

    fn handle_datagram(&mut self, datagram: &[u8], connected: &mut bool) {
        let units = match self.pipeline.process_datagram(datagram) {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!(len = datagram.len(), error = %e, "datagram dropped");
                return;
            }
        };

        if !*connected {
            *connected = true;
            self.shared.set_state(ConnectionState::Connected);
            tracing::info!("first packet received, stream connected");
        }

        if units.is_empty() {
            return;
        }
        let mut sink = self.sink.lock();
        if let Some(sink) = sink.as_mut() {
            for unit in units {
                sink.submit(unit);
            }
        }
    }

    fn publish(&self, now: Instant, meter: &mut RateMeter) {
        let mut stats = self.pipeline.stats();
        stats.frames_decoded = self
            .sink
            .lock()
            .as_ref()
            .map_or(0, |sink| sink.frames_decoded());
        stats.frames_per_second = meter.sample(now, stats.frames_delivered);

        tracing::debug!(
            packets = stats.packets_received,
            recovered = stats.fec_recovered,
            units = stats.units_reassembled,
            fps = stats.frames_per_second,
            "stream stats"
        );
        *self.shared.stats.write() = stats;
    }
}
