use std::time::Duration;

use splicecast_core::splice::{encode_timestamp, locate_timestamps, TS_PACKET_SIZE};
use splicecast_core::{
    HandoverSink, Passthrough, ReaderFeed, Source, SplicingSink, Switch, SwitchOutcome,
    SwitchSettings, WriterSink,
};
use tokio::io::AsyncWriteExt;

fn video_packet(pts: u64, continuity: u8) -> Vec<u8> {
    let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
    packet[..4].copy_from_slice(&[0x47, 0x41, 0x00, 0x10 | (continuity & 0x0F)]);
    packet[4..13].copy_from_slice(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05]);
    packet[13..18].copy_from_slice(&encode_timestamp(pts, 0x20));
    packet
}

fn continuation_packet() -> Vec<u8> {
    let mut packet = vec![0xAAu8; TS_PACKET_SIZE];
    packet[..4].copy_from_slice(&[0x47, 0x01, 0x00, 0x10]);
    packet
}

fn settings() -> SwitchSettings {
    SwitchSettings {
        chunk_size: TS_PACKET_SIZE * 4,
        switch_grace: Duration::ZERO,
        watchdog: Duration::from_millis(100),
        terminate_grace: Duration::from_millis(200),
    }
}

fn timestamps(stream: &[u8]) -> Vec<u64> {
    stream
        .chunks(TS_PACKET_SIZE)
        .filter_map(|packet| locate_timestamps(packet).ok().flatten())
        .map(|found| found.pts)
        .collect()
}

#[tokio::test]
async fn spliced_timeline_never_goes_backwards() {
    let (mut placeholder_tx, placeholder_rx) = tokio::io::duplex(64 * 1024);
    let (mut live_tx, live_rx) = tokio::io::duplex(64 * 1024);
    let mut placeholder = ReaderFeed::new(placeholder_rx);
    let mut live = ReaderFeed::new(live_rx);

    let producer = tokio::spawn(async move {
        for step in 0..=30u64 {
            placeholder_tx
                .write_all(&video_packet(step * 3_000, step as u8))
                .await
                .unwrap();
            placeholder_tx.write_all(&continuation_packet()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // live restarts its clock near zero
        for step in 0..10u64 {
            live_tx
                .write_all(&video_packet(1_800 + step * 3_000, step as u8))
                .await
                .unwrap();
            live_tx.write_all(&continuation_packet()).await.unwrap();
        }
        drop(live_tx);
        placeholder_tx
    });

    let mut sink = SplicingSink::new(WriterSink::new(Vec::new()));
    let outcome = Switch::new(settings())
        .run(&mut placeholder, &mut live, &mut sink)
        .await
        .unwrap();
    let _keep_open = producer.await.unwrap();
    assert!(matches!(outcome, SwitchOutcome::Completed { .. }));

    let state = *sink.splicer().state();
    assert_eq!(state.placeholder_last_pts, Some(90_000));
    assert_eq!(state.first_live_pts, Some(1_800));
    assert_eq!(state.pts_offset, Some(88_200));

    let output = sink.into_inner().into_inner();
    assert_eq!(output.len() % TS_PACKET_SIZE, 0);
    let pts = timestamps(&output);
    assert_eq!(pts.len(), 31 + 10);
    assert!(pts.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(pts[31], 90_000);
    assert_eq!(*pts.last().unwrap(), 90_000 + 9 * 3_000);
}

#[tokio::test]
async fn handover_mid_packet_keeps_output_aligned() {
    let (mut placeholder_tx, placeholder_rx) = tokio::io::duplex(64 * 1024);
    let (mut live_tx, live_rx) = tokio::io::duplex(64 * 1024);
    let filler = [video_packet(45_000, 0), video_packet(48_000, 1)].concat();
    placeholder_tx
        .write_all(&filler[..TS_PACKET_SIZE + 100])
        .await
        .unwrap();

    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        live_tx.write_all(&video_packet(0, 0)).await.unwrap();
        drop(live_tx);
        placeholder_tx
    });

    let mut sink = SplicingSink::new(WriterSink::new(Vec::new()));
    Switch::new(settings())
        .run(
            &mut ReaderFeed::new(placeholder_rx),
            &mut ReaderFeed::new(live_rx),
            &mut sink,
        )
        .await
        .unwrap();
    let _keep_open = producer.await.unwrap();
    assert_eq!(sink.discarded_bytes(), 100);

    let output = sink.into_inner().into_inner();
    assert_eq!(output.len() % TS_PACKET_SIZE, 0);
    assert_eq!(output[TS_PACKET_SIZE], 0x47);
    assert_eq!(timestamps(&output), vec![45_000, 45_000]);
}

#[tokio::test]
async fn passthrough_keeps_bytes_intact() {
    let (mut placeholder_tx, placeholder_rx) = tokio::io::duplex(1024);
    let (mut live_tx, live_rx) = tokio::io::duplex(1024);
    placeholder_tx.write_all(b"filler").await.unwrap();

    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        live_tx.write_all(b"live-data").await.unwrap();
        placeholder_tx
    });

    let mut sink = Passthrough(WriterSink::new(Vec::new()));
    Switch::new(settings())
        .run(
            &mut ReaderFeed::new(placeholder_rx),
            &mut ReaderFeed::new(live_rx),
            &mut sink,
        )
        .await
        .unwrap();
    let _keep_open = producer.await.unwrap();
    assert_eq!(sink.0.into_inner(), b"fillerlive-data");
}

#[tokio::test]
async fn splicing_sink_accepts_direct_writes() {
    let mut sink = SplicingSink::new(WriterSink::new(Vec::new()));
    sink.write(Source::Placeholder, &video_packet(45_000, 0))
        .await
        .unwrap();
    sink.write(Source::Live, &video_packet(0, 0)).await.unwrap();
    sink.finish().await.unwrap();
    let output = sink.into_inner().into_inner();
    assert_eq!(timestamps(&output), vec![45_000, 45_000]);
}

#[cfg(unix)]
mod processes {
    use super::*;
    use splicecast_core::process::group_alive;
    use splicecast_core::{CommandDescriptor, ProcessChain};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn process_feeds_hand_over_and_placeholder_dies() {
        let mut placeholder = ProcessChain::spawn(
            "placeholder",
            &[CommandDescriptor::shell(
                "while true; do printf P; sleep 0.02; done",
            )],
            None,
        )
        .unwrap();
        let placeholder_pgid = placeholder.pgid().unwrap();
        let mut live = ProcessChain::spawn(
            "live",
            &[
                CommandDescriptor::shell("sleep 0.3; printf LIVE"),
                CommandDescriptor::new("cat", Vec::new()),
            ],
            None,
        )
        .unwrap();

        let mut sink = Passthrough(WriterSink::new(Vec::new()));
        let outcome = Switch::new(settings())
            .run(&mut placeholder, &mut live, &mut sink)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SwitchOutcome::Completed { live_bytes: 4, .. }
        ));
        assert!(live.wait().await.unwrap().success());

        let output = sink.0.into_inner();
        assert!(output.ends_with(b"LIVE"));
        assert!(output[..output.len() - 4].iter().all(|byte| *byte == b'P'));
        assert!(!group_alive(placeholder_pgid));
    }
}
