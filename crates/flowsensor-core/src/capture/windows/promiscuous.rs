//! Primary Windows backend: one blocking capture task per requested device,
//! fanning packets into a single writer task over a bounded channel so a
//! slow write never applies backpressure to any one device's read loop.
//!
//! Uses the `pcap` crate for device enumeration and live capture.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::iface_map::map_interface_name;
use crate::capture::{CaptureError, TraceCapturer};
use crate::model::{CaptureRequest, TraceArtifact};

const CHANNEL_CAPACITY: usize = 1000;

pub fn is_available() -> bool {
    pcap::Device::list().map(|d| !d.is_empty()).unwrap_or(false)
}

fn resolve_devices(wanted: &[String]) -> Result<Vec<pcap::Device>, CaptureError> {
    let all = pcap::Device::list()
        .map_err(|e| CaptureError::Io(std::io::Error::other(e.to_string())))?;
    if wanted.is_empty() {
        return Ok(all);
    }
    let names: Vec<String> = all.iter().map(|d| d.desc.clone().unwrap_or_else(|| d.name.clone())).collect();
    let mut out = Vec::with_capacity(wanted.len());
    for w in wanted {
        match map_interface_name(w, &names) {
            Some(idx) => out.push(all[idx].clone()),
            None => {
                return Err(CaptureError::ToolFailed {
                    status: -1,
                    stderr: format!("no capture device matches interface {w:?}"),
                })
            }
        }
    }
    Ok(out)
}

struct Packet {
    data: Bytes,
    ts: Duration,
}

pub struct PromiscuousBackend;

impl PromiscuousBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TraceCapturer for PromiscuousBackend {
    async fn capture(
        &self,
        ctx: CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError> {
        let created_at = Utc::now();
        let dest = req
            .output_dir
            .join(format!("capture_{}.pcap", created_at.format("%Y%m%dT%H%M%SZ")));

        let wanted: Vec<String> = req
            .interfaces
            .iter()
            .filter(|i| !i.is_sentinel())
            .map(|i| i.as_str().to_string())
            .collect();
        let devices = resolve_devices(&wanted)?;

        let (tx, mut rx) = mpsc::channel::<Packet>(CHANNEL_CAPACITY);

        let mut producer_handles = Vec::with_capacity(devices.len());
        for device in devices {
            let tx = tx.clone();
            let window = req.window;
            let device_ctx = ctx.clone();
            producer_handles.push(tokio::task::spawn_blocking(move || {
                run_device_capture(device, window, tx, device_ctx)
            }));
        }
        drop(tx);

        let writer_dest = dest.clone();
        let writer_handle =
            tokio::task::spawn_blocking(move || write_packets_to_pcap(writer_dest, &mut rx));

        // writer_handle owns `rx` by move into the closure via spawn_blocking;
        // wait for producers to finish feeding it, then for the writer itself.
        for handle in producer_handles {
            let _ = handle.await;
        }
        let write_result = writer_handle
            .await
            .map_err(|e| CaptureError::Io(std::io::Error::other(e.to_string())))?;
        write_result?;

        if ctx.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        Ok(TraceArtifact {
            path: dest,
            created_at,
        })
    }
}

fn run_device_capture(
    device: pcap::Device,
    window: Duration,
    tx: mpsc::Sender<Packet>,
    ctx: CancellationToken,
) {
    let deadline = std::time::Instant::now() + window;
    let capture = match pcap::Capture::from_device(device)
        .and_then(|c| c.promisc(true).timeout(100).open())
    {
        Ok(c) => c,
        Err(_) => return,
    };
    let mut capture = capture;
    while std::time::Instant::now() < deadline && !ctx.is_cancelled() {
        match capture.next_packet() {
            Ok(packet) => {
                let data = Bytes::copy_from_slice(packet.data);
                let ts = Duration::new(
                    packet.header.ts.tv_sec as u64,
                    (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                );
                if tx.blocking_send(Packet { data, ts }).is_err() {
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(_) => break,
        }
    }
}

fn write_packets_to_pcap(
    dest: std::path::PathBuf,
    rx: &mut mpsc::Receiver<Packet>,
) -> Result<(), CaptureError> {
    // pcap::Capture requires a live/offline capture handle to create a
    // Savefile; a dead capture with a representative link type is enough to
    // obtain a writer without opening a device.
    let dead = pcap::Capture::dead(pcap::Linktype::ETHERNET)
        .map_err(|e| CaptureError::Io(std::io::Error::other(e.to_string())))?;
    let mut savefile = dead
        .savefile(&dest)
        .map_err(|e| CaptureError::Io(std::io::Error::other(e.to_string())))?;

    while let Some(packet) = rx.blocking_recv() {
        let header = pcap::PacketHeader {
            ts: libc_timeval(packet.ts),
            caplen: packet.data.len() as u32,
            len: packet.data.len() as u32,
        };
        let pkt = pcap::Packet {
            header: &header,
            data: &packet.data,
        };
        savefile.write(&pkt);
    }
    Ok(())
}

fn libc_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: (d.subsec_micros()) as libc::suseconds_t,
    }
}
