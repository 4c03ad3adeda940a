use bytes::Bytes;
use chanmux_frame::{Frame, FrameCodec, FrameConfig, FrameError, FrameType, HEADER_SIZE};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::test]
async fn frames_cross_a_duplex_stream_in_order() {
    let (client, server) = tokio::io::duplex(64);
    let mut sink = FramedWrite::new(client, FrameCodec::new());
    let mut stream = FramedRead::new(server, FrameCodec::new());

    let writer = tokio::spawn(async move {
        for i in 0..32u32 {
            let payload = format!("chunk-{i}");
            sink.send(Frame::data(i + 1, 0, Bytes::from(payload), i == 31))
                .await
                .unwrap();
        }
        sink.send(Frame::go_away()).await.unwrap();
    });

    for i in 0..32u32 {
        let frame = stream.next().await.unwrap().unwrap();
        assert_eq!(frame.src_channel_id, i + 1);
        assert_eq!(frame.payload.as_ref(), format!("chunk-{i}").as_bytes());
        assert_eq!(frame.is_end_stream(), i == 31);
    }
    let last = stream.next().await.unwrap().unwrap();
    assert_eq!(last.frame_type, FrameType::GoAway);

    writer.await.unwrap();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn truncated_stream_surfaces_error() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut stream = FramedRead::new(server, FrameCodec::new());

    client.write_all(&[0x00, 0x00, 0x00, 0x00]).await.unwrap();
    drop(client);

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, FrameError::TruncatedHeader { available: 4 }));
}

#[tokio::test]
async fn oversized_frame_rejected_by_reader() {
    let (client, server) = tokio::io::duplex(4096);
    let mut sink = FramedWrite::new(client, FrameCodec::new());
    let mut stream = FramedRead::new(
        server,
        FrameCodec::with_config(FrameConfig {
            max_payload_size: 16,
        }),
    );

    sink.send(Frame::data(1, 0, vec![0xAB; 64], false))
        .await
        .unwrap();

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, FrameError::PayloadTooLarge { size: 64, max: 16 }));
}

#[tokio::test]
async fn unknown_frame_type_is_an_error() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut stream = FramedRead::new(server, FrameCodec::new());

    let mut wire = [0u8; HEADER_SIZE];
    wire[0] = 0x09;
    client.write_all(&wire).await.unwrap();

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, FrameError::UnknownFrameType(0x09)));
}
