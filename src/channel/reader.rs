//! Channel read loop.
//!
//! A strictly sequential cycle on the channel's task: frame the 24 byte
//! heading, validate it, frame the payload, verify its checksum, then parse
//! and dispatch. The first failure of any step is terminal for the channel.

use super::Channel;
use crate::error::NetworkError;
use crate::wire::{self, Heading, HEADING_SIZE};
use bitcoin::consensus::encode;
use bitcoin::p2p::message::RawNetworkMessage;
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Drive the read cycle until the channel stops.
pub(super) async fn run<R, W>(channel: Arc<Channel<R, W>>, mut reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // Heading and payload share one frame so the codec sees a contiguous
    // message. The capacity is fixed for the life of the channel; resizes
    // below never exceed it.
    let mut frame =
        Vec::with_capacity(HEADING_SIZE + wire::max_payload(channel.protocol_maximum));
    let mut shutdown = channel.shutdown.subscribe();

    loop {
        if channel.stopped() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            result = read_cycle(&channel, &mut reader, &mut frame) => {
                if let Err(ec) = result {
                    channel.stop(ec);
                    break;
                }
            }
        }
    }

    // Socket teardown. An in-flight send finishes with an error once the
    // write half shuts down; the read half closes on drop.
    if let Some(mut writer) = channel.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
}

/// One S0..S5 pass: heading, validation, payload, checksum, dispatch.
async fn read_cycle<R, W>(
    channel: &Channel<R, W>,
    reader: &mut R,
    frame: &mut Vec<u8>,
) -> Result<(), NetworkError>
where
    R: AsyncRead + Unpin + Send,
{
    frame.resize(HEADING_SIZE, 0);
    if let Err(err) = reader.read_exact(&mut frame[..]).await {
        debug!("Heading read failure [{}] {err}", channel.authority);
        return Err(err.into());
    }

    let mut heading_bytes = [0u8; HEADING_SIZE];
    heading_bytes.copy_from_slice(&frame[..]);
    let heading = match Heading::decode(&heading_bytes) {
        Ok(heading) => heading,
        Err(ec) => {
            warn!("Invalid heading from [{}]", channel.authority);
            return Err(ec);
        }
    };

    if heading.magic != channel.magic {
        warn!(
            "Invalid heading magic ({}) from [{}]",
            heading.magic, channel.authority
        );
        return Err(NetworkError::BadStream);
    }

    let payload_length = heading.payload_length as usize;
    if payload_length > wire::max_payload(channel.negotiated_version()) {
        warn!(
            "Oversized payload indicated by {} heading from [{}] ({payload_length} bytes)",
            heading.command, channel.authority
        );
        return Err(NetworkError::BadStream);
    }

    channel.activity();

    frame.resize(HEADING_SIZE + payload_length, 0);
    if let Err(err) = reader.read_exact(&mut frame[HEADING_SIZE..]).await {
        debug!("Payload read failure [{}] {err}", channel.authority);
        return Err(err.into());
    }

    if !heading.verify_checksum(&frame[HEADING_SIZE..]) {
        warn!(
            "Invalid {} payload from [{}] bad checksum",
            heading.command, channel.authority
        );
        return Err(NetworkError::BadStream);
    }

    let (message, consumed) = match encode::deserialize_partial::<RawNetworkMessage>(&frame[..]) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                "Invalid {} payload from [{}] {err}",
                heading.command, channel.authority
            );
            return Err(err.into());
        }
    };

    // The codec must account for every framed byte; a shortfall means the
    // payload carried trailing garbage.
    if consumed != frame.len() || wire::encoded_size(&message)? != frame.len() {
        warn!(
            "Invalid {} payload from [{}] trailing bytes",
            heading.command, channel.authority
        );
        return Err(NetworkError::BadStream);
    }

    debug!(
        "Valid {} payload from [{}] ({payload_length} bytes)",
        heading.command, channel.authority
    );

    if channel.stopped() {
        return Ok(());
    }
    channel.message_subscribers.dispatch(message.payload());
    channel.activity();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NetworkSettings;
    use crate::wire;
    use bitcoin::p2p::message::{CommandString, NetworkMessage};
    use bitcoin::p2p::Magic;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::{mpsc, oneshot};

    type TestChannel = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn test_authority() -> SocketAddr {
        "127.0.0.1:8333".parse().unwrap()
    }

    fn test_channel(buffer: usize) -> (Arc<TestChannel>, DuplexStream) {
        let (local, remote) = duplex(buffer);
        let (reader, writer) = split(local);
        let channel = Arc::new(Channel::new(
            &NetworkSettings::default(),
            test_authority(),
            42,
            reader,
            writer,
            None,
        ));
        (channel, remote)
    }

    fn raw_frame(magic: Magic, message: NetworkMessage) -> Vec<u8> {
        encode::serialize(&RawNetworkMessage::new(magic, message))
    }

    /// Frame with an arbitrary command and payload, checksummed correctly.
    fn custom_frame(magic: Magic, command: &str, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADING_SIZE + payload.len());
        frame.extend_from_slice(&magic.to_bytes());
        let mut name = [0u8; 12];
        name[..command.len()].copy_from_slice(command.as_bytes());
        frame.extend_from_slice(&name);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&wire::checksum(payload));
        frame.extend_from_slice(payload);
        frame
    }

    fn watch_stop(channel: &Arc<TestChannel>) -> oneshot::Receiver<NetworkError> {
        let (tx, rx) = oneshot::channel();
        channel.subscribe_stop(move |ec| {
            let _ = tx.send(ec);
        });
        rx
    }

    #[tokio::test]
    async fn test_subscriber_receives_parsed_message() {
        let (channel, mut remote) = test_channel(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel.subscribe(NetworkMessage::Ping(0).command(), move |result| {
            if let Ok(NetworkMessage::Ping(nonce)) = result {
                let _ = tx.send(*nonce);
            }
        });
        channel.start().unwrap();

        remote
            .write_all(&raw_frame(Magic::BITCOIN, NetworkMessage::Ping(7)))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(7));
        assert!(!channel.stopped());
    }

    #[tokio::test]
    async fn test_zero_length_payload() {
        let (channel, mut remote) = test_channel(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel.subscribe(NetworkMessage::Verack.command(), move |result| {
            if result.is_ok() {
                let _ = tx.send(());
            }
        });
        channel.start().unwrap();

        remote
            .write_all(&raw_frame(Magic::BITCOIN, NetworkMessage::Verack))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_heading_split_across_segments() {
        let frame = raw_frame(Magic::BITCOIN, NetworkMessage::Ping(9));

        // One byte per segment end to end.
        let mut builder = tokio_test::io::Builder::new();
        for index in 0..frame.len() {
            builder.read(&frame[index..index + 1]);
        }
        let reader = builder.build();

        let channel = Arc::new(Channel::new(
            &NetworkSettings::default(),
            test_authority(),
            42,
            reader,
            Vec::new(),
            None,
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(NetworkMessage::Ping(0).command(), move |result| {
            if let Ok(NetworkMessage::Ping(nonce)) = result {
                let _ = tx.send(*nonce);
            }
        });
        channel.start().unwrap();

        assert_eq!(rx.recv().await, Some(9));
    }

    #[tokio::test]
    async fn test_magic_mismatch_stops_channel() {
        let (channel, mut remote) = test_channel(1024);
        let messages = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&messages);
        channel.subscribe(NetworkMessage::Ping(0).command(), move |result| {
            if result.is_ok() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        remote
            .write_all(&raw_frame(Magic::REGTEST, NetworkMessage::Ping(7)))
            .await
            .unwrap();

        assert!(matches!(stop.await.unwrap(), NetworkError::BadStream));
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_before_payload_read() {
        let (channel, mut remote) = test_channel(1024);
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        let oversized = wire::max_payload(channel.negotiated_version()) + 1;
        let mut heading = Vec::with_capacity(HEADING_SIZE);
        heading.extend_from_slice(&Magic::BITCOIN.to_bytes());
        let mut name = [0u8; 12];
        name[..4].copy_from_slice(b"ping");
        heading.extend_from_slice(&name);
        heading.extend_from_slice(&(oversized as u32).to_le_bytes());
        heading.extend_from_slice(&[0u8; 4]);

        // Only the heading is written; the stop proves the payload read
        // was never attempted.
        remote.write_all(&heading).await.unwrap();

        assert!(matches!(stop.await.unwrap(), NetworkError::BadStream));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_stops_channel() {
        let (channel, mut remote) = test_channel(1024);
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        let mut frame = raw_frame(Magic::BITCOIN, NetworkMessage::Ping(7));
        frame[20..24].copy_from_slice(&[0u8; 4]);
        remote.write_all(&frame).await.unwrap();

        assert!(matches!(stop.await.unwrap(), NetworkError::BadStream));
    }

    #[tokio::test]
    async fn test_trailing_bytes_stop_channel() {
        let (channel, mut remote) = test_channel(1024);
        let messages = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&messages);
        channel.subscribe(NetworkMessage::Ping(0).command(), move |result| {
            if result.is_ok() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        // A ping payload is 8 bytes; declare and checksum 10 so the codec
        // leaves two behind.
        let mut payload = 7u64.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 2]);
        let frame = custom_frame(Magic::BITCOIN, "ping", &payload);
        remote.write_all(&frame).await.unwrap();

        assert!(matches!(stop.await.unwrap(), NetworkError::BadStream));
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_reaches_its_subscriber() {
        let (channel, mut remote) = test_channel(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let command = CommandString::try_from("bogus".to_owned()).unwrap();
        channel.subscribe(command, move |result| {
            if let Ok(NetworkMessage::Unknown { payload, .. }) = result {
                let _ = tx.send(payload.clone());
            }
        });
        channel.start().unwrap();

        let frame = custom_frame(Magic::BITCOIN, "bogus", &[1, 2, 3]);
        remote.write_all(&frame).await.unwrap();

        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_payload_at_negotiated_maximum() {
        // Narrowing the version shrinks the acceptable payload to the
        // pre-witness bound; a payload exactly that size passes.
        let (channel, mut remote) = test_channel(64 * 1024);
        channel.set_negotiated_version(70001);
        let limit = wire::max_payload(channel.negotiated_version());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = CommandString::try_from("bulk".to_owned()).unwrap();
        channel.subscribe(command, move |result| {
            if let Ok(NetworkMessage::Unknown { payload, .. }) = result {
                let _ = tx.send(payload.len());
            }
        });
        channel.start().unwrap();

        let payload = vec![0u8; limit];
        let frame = custom_frame(Magic::BITCOIN, "bulk", &payload);
        let writer = tokio::spawn(async move {
            remote.write_all(&frame).await.unwrap();
            remote
        });

        assert_eq!(rx.recv().await, Some(limit));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_payload_above_negotiated_maximum_rejected() {
        let (channel, mut remote) = test_channel(1024);
        channel.set_negotiated_version(70001);
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        let oversized = wire::max_payload(channel.negotiated_version()) + 1;
        let mut heading = Vec::with_capacity(HEADING_SIZE);
        heading.extend_from_slice(&Magic::BITCOIN.to_bytes());
        let mut name = [0u8; 12];
        name[..4].copy_from_slice(b"bulk");
        heading.extend_from_slice(&name);
        heading.extend_from_slice(&(oversized as u32).to_le_bytes());
        heading.extend_from_slice(&[0u8; 4]);
        remote.write_all(&heading).await.unwrap();

        assert!(matches!(stop.await.unwrap(), NetworkError::BadStream));
    }

    #[tokio::test]
    async fn test_remote_close_stops_with_translated_error() {
        let (channel, remote) = test_channel(1024);
        let stop = watch_stop(&channel);
        channel.start().unwrap();

        drop(remote);

        match stop.await.unwrap() {
            NetworkError::Io(err) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("Expected Io error, got {other:?}"),
        }
    }
}
