//! Example: encode against the simulated device
//!
//! Runs a 320x240 stream through a two-core simulated encoder with two-pass
//! look-ahead and adaptive GOP. The content model has a scene cut at picture
//! 40 and a busy stretch after picture 70.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use vpuflow::hal::sim::{Content, SimulatedHal};
use vpuflow::hal::BusAddress;
use vpuflow::{
    CodingType, ColorFormat, Dimensions, EncodeConfig, GopConfig, Picture, RateControlConfig,
    Session, VpuError,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const PICTURES: u64 = 100;
const TARGET_BITRATE: u32 = 400_000;

/// Caller frames live below the simulated device's allocations.
const FRAME_BASE: u64 = 0x0100_0000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .init();

    println!("vpuflow simulated encode\n");

    let hal = Arc::new(SimulatedHal::new(2).with_content(|picture| Content {
        complexity: if picture >= 70 { 1.6 } else { 1.0 },
        scene_cut: picture == 40,
    }));

    let config = EncodeConfig::new(WIDTH, HEIGHT)
        .with_frame_rate(30, 1)
        .with_cores(2)
        .with_partitions(2)
        .with_lookahead(8)
        .with_gop(GopConfig::default().with_gop_size(0))
        .with_rate_control(
            RateControlConfig::default()
                .with_target_bitrate(TARGET_BITRATE)
                .with_inter_qp(10, 45),
        );
    println!(
        "Config: {}x{}, {} kbps, look-ahead {}, {} cores x {} partitions\n",
        WIDTH,
        HEIGHT,
        TARGET_BITRATE / 1000,
        config.lookahead_depth,
        config.cores,
        config.partitions
    );

    let mut session = Session::open(config, hal.clone())?;

    let (packets_tx, packets_rx) = crossbeam_channel::unbounded();
    session.set_packet_callback(move |packet, progress| {
        let _ = packets_tx.send((packet, progress));
    });
    let (stats_tx, stats_rx) = crossbeam_channel::unbounded();
    session.set_statistics_callback(move |stats| {
        let _ = stats_tx.send(stats.clone());
    });

    let dims = Dimensions {
        width: WIDTH,
        height: HEIGHT,
    };
    let frame_size = ColorFormat::Yuv420Planar.frame_size(WIDTH, HEIGHT) as u64;
    for i in 0..PICTURES {
        let picture = Picture::contiguous(
            BusAddress(FRAME_BASE + i * frame_size),
            dims,
            ColorFormat::Yuv420Planar,
            i as i64,
            1000 + i,
        );
        loop {
            match session.encode(picture.clone()) {
                Err(VpuError::BufferFull { .. }) => {
                    session.wait_for_capacity()?;
                }
                result => {
                    result?;
                    break;
                }
            }
        }
    }
    session.flush()?;

    let mut total_bytes = 0;
    let mut intra = Vec::new();
    for (packet, progress) in packets_rx.try_iter() {
        total_bytes += packet.size();
        if packet.coding_type == CodingType::Intra {
            intra.push(packet.picture_order);
        }
        if packet.picture_order % 10 == 0 {
            println!(
                "  #{:3} {:?} qp {:2} {:6} bytes in {} partitions",
                packet.picture_order,
                packet.coding_type,
                packet.qp,
                progress.cumulative_size,
                packet.partitions.len()
            );
        }
    }
    let average = stats_rx
        .try_iter()
        .last()
        .map(|s| s.average_bitrate)
        .unwrap_or_default();

    let report = session.close()?;
    println!("\nIntra pictures: {intra:?}");
    println!(
        "{} packets, {} bytes, moving average {:.0} kbps",
        report.packets_delivered,
        total_bytes,
        average / 1000.0
    );
    println!(
        "{} statistics records produced, {} outstanding, {} buffers live",
        report.records_produced, report.records_outstanding, report.live_buffers
    );
    println!("Device allocations after close: {}", hal.live_allocations());

    Ok(())
}
