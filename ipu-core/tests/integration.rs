use std::sync::Arc;
use std::time::Duration;

use ipu_core::config::FrameIdConfig;
use ipu_core::protocol::{Connection, serve_connection};
use ipu_core::{
    Configuration, ConnectionInfo, ControlClient, DdrPaths, EventMask, FrameIdMode, IpuDevice,
    IpuError, PipelinePhase, Plane, PoolGeometry, RegionId, SimFrameSource, SimHardware, Size,
    SlotCounts, WakeReason,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SLOT: u64 = 0x20_0000;
const POOL_BASE: u64 = 0x6000_0000;

fn sim_device(slots: usize) -> (Arc<SimHardware>, Arc<IpuDevice>) {
    let geometry = PoolGeometry::new(POOL_BASE, slots as u64 * SLOT, SLOT, slots).unwrap();
    let hw = Arc::new(SimHardware::new(geometry.base, geometry.size));
    let device = Arc::new(IpuDevice::open(hw.clone(), geometry));
    (hw, device)
}

fn stamped() -> Configuration {
    let mut cfg = Configuration::hd_default();
    cfg.frame_id = FrameIdConfig {
        mode: FrameIdMode::Bytes,
        crop: true,
        scale: true,
    };
    cfg
}

async fn spawn_server(device: Arc<IpuDevice>) -> ConnectionInfo {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(Connection::new(stream), device.clone()));
        }
    });
    ConnectionInfo::from(addr)
}

#[tokio::test]
async fn consumer_loop_against_simulated_frames() {
    let (hw, device) = sim_device(4);
    device.init(stamped()).unwrap();
    device.start().unwrap();

    let cancel = CancellationToken::new();
    let source = SimFrameSource::new(hw.clone(), device.interrupt_line(), 200).spawn(cancel.clone());

    let mut last_id = 0;
    for _ in 0..10 {
        let reason = tokio::time::timeout(Duration::from_secs(5), device.wait_event())
            .await
            .unwrap();
        assert_eq!(reason, WakeReason::SlotDone);

        let desc = device.fetch_done_descriptor().unwrap();
        assert_eq!(desc.base, POOL_BASE + desc.slot_id as u64 * SLOT);
        assert_eq!(desc.crop_frame_id, desc.scale_frame_id);
        assert!(desc.crop_frame_id > last_id);
        last_id = desc.crop_frame_id;
        device.acknowledge(desc.slot_id).unwrap();
    }

    device.stop();
    assert_eq!(device.wait_event().await, WakeReason::Shutdown);
    assert_eq!(
        device.status().counts,
        SlotCounts {
            free: 4,
            busy: 0,
            done: 0
        }
    );

    cancel.cancel();
    source.await.unwrap();
    device.shutdown().await;
}

#[tokio::test]
async fn unconsumed_slots_apply_backpressure() {
    let (hw, device) = sim_device(3);
    device.init(Configuration::hd_default()).unwrap();
    device.start().unwrap();

    let cancel = CancellationToken::new();
    let source = SimFrameSource::new(hw, device.interrupt_line(), 500).spawn(cancel.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = device.status();
    assert_eq!(status.counts.free, 0);
    assert!(status.counts.done >= 2);
    assert!(status.stats.overruns > 0);

    cancel.cancel();
    source.await.unwrap();
    device.shutdown().await;
}

#[tokio::test]
async fn dropped_frames_surface_as_errors() {
    let (hw, device) = sim_device(4);
    device.init(Configuration::hd_default()).unwrap();
    device.start().unwrap();

    let cancel = CancellationToken::new();
    let source = SimFrameSource::new(hw, device.interrupt_line(), 200)
        .with_drop_every(1)
        .spawn(cancel.clone());

    let reason = tokio::time::timeout(Duration::from_secs(5), device.wait_event())
        .await
        .unwrap();
    assert_eq!(reason, WakeReason::Error(EventMask::PYM_DS_FRAME_DROP));
    assert_eq!(device.fetch_error_status(), EventMask::PYM_DS_FRAME_DROP);
    assert!(device.fetch_done_descriptor().is_none());

    cancel.cancel();
    source.await.unwrap();
    device.shutdown().await;
}

#[tokio::test]
async fn remote_control_round_trip() {
    let (hw, device) = sim_device(4);
    let info = spawn_server(device.clone()).await;
    let client = ControlClient::connect(&info).await.unwrap();

    client.ping().await.unwrap();
    assert!(matches!(client.start().await, Err(IpuError::Remote(_))));

    client.init(stamped()).await.unwrap();
    let geometry = client.mem_info().await.unwrap();
    assert_eq!(geometry.slot_count, 4);
    let table = client.region_table().await.unwrap().unwrap();
    assert_eq!(table, device.region_table().unwrap());

    client.start().await.unwrap();
    assert_eq!(client.status().await.unwrap().phase, PipelinePhase::Running);

    let registers = client.dump_registers().await.unwrap();
    let paths = u64::from(DdrPaths::for_config(&stamped()).bits());
    assert!(registers.contains(&("ddr_paths".to_string(), paths)));
    assert!(registers.contains(&("irq_enable".to_string(), 1)));
    let crop_y = table.crop.y_offset + POOL_BASE;
    assert!(registers.contains(&("crop_y_addr".to_string(), crop_y)));

    // A blocked wait must not stall other calls on the same connection.
    let client = Arc::new(client);
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_event().await })
    };
    assert_eq!(client.poll_event().await.unwrap(), None);

    hw.stamp_frame_id(0x0a0b).unwrap();
    device
        .interrupt_line()
        .raise(EventMask::FRAME_START | EventMask::PYM_FRAME_DONE);
    let reason = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, WakeReason::SlotDone);

    let desc = client.fetch_done_descriptor().await.unwrap().unwrap();
    assert_eq!(desc.crop_frame_id, 0x0a0b);

    // The crop luma plane is larger than one reply, so this spans chunks.
    let luma = client
        .read_plane(desc.slot_id, RegionId::Crop, Plane::Luma)
        .await
        .unwrap();
    assert!(table.crop.y_size > ipu_core::protocol::MAX_READ_CHUNK as u64);
    assert_eq!(luma.len() as u64, table.crop.y_size);
    assert_eq!(&luma[..2], &[0x0a, 0x0b]);
    let chroma = client
        .read_plane(desc.slot_id, RegionId::Scale, Plane::Chroma)
        .await
        .unwrap();
    assert_eq!(chroma.len() as u64, table.scale.c_size);
    let head = client
        .read_region(desc.slot_id, RegionId::Scale, Plane::Luma, 0, 2)
        .await
        .unwrap();
    assert_eq!(head, vec![0x0a, 0x0b]);

    client.acknowledge(desc.slot_id).await.unwrap();
    assert!(matches!(
        client
            .read_region(desc.slot_id, RegionId::Crop, Plane::Luma, 0, 2)
            .await,
        Err(IpuError::Remote(_))
    ));
    assert!(matches!(
        client.acknowledge(desc.slot_id).await,
        Err(IpuError::Remote(_))
    ));
    assert!(client.fetch_error_status().await.unwrap().is_empty());

    let mut bigger = stamped();
    bigger.scale.target = Size::new(1920, 1080);
    assert!(client.reconfigure(bigger).await.is_err());
    let mut smaller = stamped();
    smaller.scale.target = Size::new(320, 180);
    client.reconfigure(smaller).await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_event().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.stop().await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, WakeReason::Shutdown);

    device.shutdown().await;
}
