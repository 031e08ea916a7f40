//! UVC streaming core running against simulated capture, host and sensor

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use uvc_core::capture::SimulatedCapture;
use uvc_core::control::request::{CONTROL_INTERFACE, STREAM_INTERFACE};
use uvc_core::control::{
    selector, ControlRequest, FrameRate, ProbeCommit, RequestCode, SetupPacket, UnitId,
    VendorCommand, COMMIT_CONTROL, PROBE_CONTROL, PROBE_LEN,
};
use uvc_core::device::{Device, SimulatedRig};
use uvc_core::host::{Ep0Reply, HostReader, LoopbackHost, UsbSpeed};
use uvc_core::pipeline::StreamState;
use uvc_core::{Config, CONFIG};

const DEMO_FRAMES: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvc_core=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("uvc-core starting");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    CONFIG.store(Arc::new(config));

    let (device, rig) = Device::simulated()?;
    let SimulatedRig {
        capture,
        host,
        sensor: _sensor,
        reader,
    } = rig;

    // Host enumerates at super speed and negotiates 30 fps
    host.set_speed(UsbSpeed::Super);
    let host_side = HostSide {
        device: &device,
        host: host.clone(),
    };
    host_side.negotiate().await?;
    host_side
        .vendor(VendorCommand::FrameRate(FrameRate::Fps30))
        .await?;
    host_side.vendor(VendorCommand::RecordStart).await?;
    host_side.set_brightness(0x80).await?;

    let frame_len = capture.geometry().payload_capacity() * 3 + 5000;
    let feeder = tokio::spawn(feed_frames(capture.clone(), frame_len, DEMO_FRAMES));
    let consumer = tokio::spawn(read_frames(reader, DEMO_FRAMES));

    tokio::select! {
        res = consumer => match res? {
            Ok(frames) => info!(frames, "host received all frames"),
            Err(e) => error!(%e, "host side failed"),
        },
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }
    feeder.abort();

    host_side.vendor(VendorCommand::RecordEnd).await?;
    host_side.stop().await;

    info!(
        overflows = capture.overflows(),
        free_slots = capture.free_slots(),
        "session finished"
    );
    device.shutdown();
    Ok(())
}

/// Host driver stand-in: issues setup packets through the bus callbacks.
struct HostSide<'a> {
    device: &'a Device,
    host: Arc<LoopbackHost>,
}

impl HostSide<'_> {
    async fn transfer(&self, req: ControlRequest) -> Result<Ep0Reply> {
        if !self.device.bus().on_setup(req.setup, req.data) {
            return Err(eyre!("request not handled by the device"));
        }
        for _ in 0..100 {
            if let Some(reply) = self.host.take_ep0_replies().pop() {
                return Ok(reply);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(eyre!("control transfer timed out"))
    }

    async fn negotiate(&self) -> Result<()> {
        let def = ControlRequest::get(
            STREAM_INTERFACE,
            0,
            PROBE_CONTROL,
            RequestCode::GetDef,
            PROBE_LEN as u16,
        );
        let Ep0Reply::Data(bytes) = self.transfer(def).await? else {
            return Err(eyre!("probe GET_DEF stalled"));
        };
        let mut probe = ProbeCommit::from_bytes(&bytes)?;
        probe.frame_interval = 333_333;

        let set = ControlRequest::set_cur(
            STREAM_INTERFACE,
            0,
            PROBE_CONTROL,
            Bytes::copy_from_slice(&probe.to_bytes()),
        );
        self.expect_ack(set).await?;

        let cur = ControlRequest::get(
            STREAM_INTERFACE,
            0,
            PROBE_CONTROL,
            RequestCode::GetCur,
            PROBE_LEN as u16,
        );
        let Ep0Reply::Data(bytes) = self.transfer(cur).await? else {
            return Err(eyre!("probe GET_CUR stalled"));
        };
        let agreed = ProbeCommit::from_bytes(&bytes)?;
        info!(fps = agreed.frame_rate(), "probe agreed");

        let commit = ControlRequest::set_cur(
            STREAM_INTERFACE,
            0,
            COMMIT_CONTROL,
            Bytes::copy_from_slice(&agreed.to_bytes()),
        );
        self.expect_ack(commit).await
    }

    async fn vendor(&self, command: VendorCommand) -> Result<()> {
        let req = ControlRequest::set_cur(
            CONTROL_INTERFACE,
            UnitId::ExtensionUnit as u8,
            selector::XU_VENDOR_COMMAND,
            vec![command.id()],
        );
        self.expect_ack(req).await
    }

    async fn set_brightness(&self, value: u8) -> Result<()> {
        let req = ControlRequest::set_cur(
            CONTROL_INTERFACE,
            UnitId::ProcessingUnit as u8,
            selector::PU_BRIGHTNESS,
            vec![value],
        );
        self.expect_ack(req).await
    }

    async fn expect_ack(&self, req: ControlRequest) -> Result<()> {
        match self.transfer(req).await? {
            Ep0Reply::Ack => Ok(()),
            other => Err(eyre!("expected ack, got {other:?}")),
        }
    }

    /// SET_INTERFACE alternate setting 0 on the streaming interface
    async fn stop(&self) {
        let setup = SetupPacket::from_words(0x0000_0B01, 0x0000_0001);
        self.device.bus().on_setup(setup, Bytes::new());
        let wait = self.device.wait_for_state(StreamState::Idle);
        if tokio::time::timeout(Duration::from_secs(1), wait).await.is_err() {
            warn!("stream did not return to idle");
        }
        self.host.take_ep0_replies();
    }
}

/// Sensor stand-in: clocks frames in whenever the capture state machine is running.
async fn feed_frames(capture: Arc<SimulatedCapture>, frame_len: usize, frames: u64) {
    let mut frame = vec![0u8; frame_len];
    for n in 0..frames {
        while !capture.is_capturing() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        frame.fill(n as u8);
        if let Err(e) = capture.push_frame(&frame) {
            warn!(%e, frame = n, "frame dropped");
        }
    }
}

/// Reads packets until `frames` complete frames arrived, checking the frame id alternates.
async fn read_frames(reader: HostReader, frames: u64) -> Result<u64> {
    let mut received = 0;
    let mut bytes = 0;
    let mut last_fid = None;

    while received < frames {
        let packet = reader
            .read_packet()
            .await
            .ok_or_else(|| eyre!("video endpoint closed"))?;
        bytes += packet.payload().len();

        if packet.end_of_frame() {
            let fid = packet.frame_id();
            if last_fid == Some(fid) {
                return Err(eyre!("frame id did not toggle at frame {received}"));
            }
            last_fid = Some(fid);
            received += 1;
            info!(frame = received, bytes, fid, "frame received");
            bytes = 0;
        }
    }
    Ok(received)
}
