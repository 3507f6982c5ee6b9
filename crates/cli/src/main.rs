use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fecstream::{
    CodingUnit, DecodeSink, H264Packetizer, Receiver, ReceiverConfig, UdpTransport, UnitKind,
};

#[derive(Parser)]
#[command(
    name = "fecstream",
    about = "Send and receive FEC-protected H.264 streams over UDP"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive a stream and write the reassembled NAL units as Annex B
    Recv {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:5600")]
        bind: String,

        /// Output file; units are counted but discarded when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Packetize an Annex B file and send it
    Send {
        /// Receiver address (host:port)
        #[arg(long, short)]
        target: SocketAddr,

        /// H.264 Annex B input file
        #[arg(long, short)]
        input: PathBuf,

        /// Frames per second to pace the stream at
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Percentage of datagrams to drop on purpose
        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        /// Send parameter sets and key frames twice
        #[arg(long)]
        repeat_config: bool,
    },
}

/// Writes units to a byte-stream file, start code first.
struct AnnexBSink {
    out: Option<BufWriter<File>>,
    frames: u64,
}

impl DecodeSink for AnnexBSink {
    fn submit(&mut self, unit: CodingUnit) {
        if unit.kind().is_frame() {
            self.frames += 1;
        }
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if let Err(e) = out.write_all(&unit.to_annex_b()) {
            tracing::error!(error = %e, "write failed, output disabled");
            self.out = None;
        }
    }

    fn frames_decoded(&self) -> u64 {
        self.frames
    }
}

impl Drop for AnnexBSink {
    fn drop(&mut self) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
        }
    }
}

fn recv(bind: String, output: Option<PathBuf>) -> fecstream::Result<()> {
    let out = match output {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };

    let mut receiver = Receiver::new(ReceiverConfig {
        bind_addr: bind,
        ..ReceiverConfig::default()
    });
    receiver.start(Box::new(AnnexBSink { out, frames: 0 }))?;

    if let Some(addr) = receiver.local_addr() {
        println!("receiving on {addr}, press Enter to stop");
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut input = String::new();
        let _ = io::stdin().read_line(&mut input);
        let _ = stop_tx.send(());
    });

    loop {
        match stop_rx.recv_timeout(Duration::from_secs(1)) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stats = receiver.stats();
                tracing::info!(
                    state = ?receiver.connection_state(),
                    packets = stats.packets_received,
                    recovered = stats.fec_recovered,
                    units = stats.units_reassembled,
                    frames = stats.frames_decoded,
                    fps = format_args!("{:.1}", stats.frames_per_second),
                    "receiver"
                );
                if !receiver.is_running() {
                    break;
                }
            }
            _ => break,
        }
    }

    receiver.stop();
    Ok(())
}

fn send(
    target: SocketAddr,
    input: PathBuf,
    fps: u32,
    loss: f64,
    repeat_config: bool,
) -> fecstream::Result<()> {
    let data = std::fs::read(&input)?;
    let transport = UdpTransport::ephemeral()?;
    let mut packetizer = H264Packetizer::new().repeat_critical(repeat_config);
    let frame_interval = Duration::from_secs(1) / fps.max(1);
    let loss = (loss / 100.0).clamp(0.0, 1.0);

    let (mut sent, mut dropped) = (0u64, 0u64);
    for nal in H264Packetizer::extract_nal_units(&data) {
        for datagram in packetizer.packetize_nal(&nal) {
            if rand::random::<f64>() < loss {
                dropped += 1;
                continue;
            }
            transport.send_to(&datagram, target)?;
            sent += 1;
        }
        if UnitKind::from(nal[0]).is_frame() {
            thread::sleep(frame_interval);
        }
    }

    tracing::info!(sent, dropped, %target, "stream sent");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let result = match args.command {
        Command::Recv { bind, output } => recv(bind, output),
        Command::Send {
            target,
            input,
            fps,
            loss,
            repeat_config,
        } => send(target, input, fps, loss, repeat_config),
    };

    if let Err(e) = result {
        eprintln!("fecstream: {e}");
        std::process::exit(1);
    }
}
