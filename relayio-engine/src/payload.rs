//! Long-poll payload codec.
//!
//! A polling response carries several engine packets in one body, joined by
//! the ASCII record separator. The encoder drains the session write buffer
//! but stops batching before `max_payload` would be exceeded: the remaining
//! packets stay buffered for the next polling request.

use tokio::sync::MutexGuard;

use crate::{errors::Error, packet::Packet, peekable::PeekableReceiver};

pub(crate) const PACKET_SEPARATOR: char = '\x1e';

/// Encodes the buffered packets into one polling body.
///
/// If the buffer is empty, waits for the next packet so the long-poll
/// request hangs until there is something to deliver.
pub(crate) async fn poll_encoder(
    mut rx: MutexGuard<'_, PeekableReceiver<Packet>>,
    max_payload: u64,
) -> Result<String, Error> {
    let mut data = String::new();

    while let Some(packet) = rx.try_peek() {
        let hint = packet.size_hint(true) as u64;
        if !data.is_empty() && data.len() as u64 + 1 + hint > max_payload {
            break;
        }
        let packet = match rx.try_recv() {
            Some(packet) => packet,
            None => break,
        };
        let packet: String = packet.try_into()?;
        if !data.is_empty() {
            data.push(PACKET_SEPARATOR);
        }
        data.push_str(&packet);
    }

    if data.is_empty() {
        let packet = rx.recv().await.ok_or(Error::Aborted)?;
        let packet: String = packet.try_into()?;
        data.push_str(&packet);
    }
    Ok(data)
}

/// Splits an inbound polling body into its packets.
pub(crate) fn poll_decoder(body: &str) -> impl Iterator<Item = Result<Packet, Error>> + '_ {
    body.split(PACKET_SEPARATOR).map(Packet::try_from)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::{mpsc, Mutex};

    use super::*;

    fn buffered(packets: Vec<Packet>) -> Mutex<PeekableReceiver<Packet>> {
        let (tx, rx) = mpsc::channel(64);
        for packet in packets {
            tx.try_send(packet).unwrap();
        }
        // keep the sender alive so the encoder never sees a closed channel
        std::mem::forget(tx);
        Mutex::new(PeekableReceiver::new(rx))
    }

    #[tokio::test]
    async fn encoder_batches_with_separator() {
        let rx = buffered(vec![
            Packet::Message("hello€".into()),
            Packet::Binary(Bytes::from_static(&[1, 2, 3, 4])),
            Packet::Message("hello€".into()),
        ]);
        let body = poll_encoder(rx.lock().await, 100_000).await.unwrap();
        assert_eq!(body, "4hello€\x1ebAQIDBA==\x1e4hello€");
    }

    #[tokio::test]
    async fn encoder_respects_max_payload() {
        let rx = buffered(vec![
            Packet::Message("aaaaaaaaaa".into()),
            Packet::Message("bbbbbbbbbb".into()),
        ]);
        // only the first packet fits under the limit
        let body = poll_encoder(rx.lock().await, 15).await.unwrap();
        assert_eq!(body, "4aaaaaaaaaa");

        // the second one is still buffered for the next poll
        let body = poll_encoder(rx.lock().await, 15).await.unwrap();
        assert_eq!(body, "4bbbbbbbbbb");
    }

    #[tokio::test]
    async fn encoder_never_splits_a_single_packet() {
        let rx = buffered(vec![Packet::Message("way too big for the limit".into())]);
        let body = poll_encoder(rx.lock().await, 4).await.unwrap();
        assert_eq!(body, "4way too big for the limit");
    }

    #[test]
    fn decoder_splits_packets() {
        let packets: Vec<_> = poll_decoder("4foo\x1e4€f\x1e4f")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            packets,
            vec![
                Packet::Message("foo".into()),
                Packet::Message("€f".into()),
                Packet::Message("f".into()),
            ]
        );
    }

    #[test]
    fn decoder_reports_malformed_frames() {
        let mut packets = poll_decoder("4foo\x1e9bad");
        assert!(packets.next().unwrap().is_ok());
        assert!(packets.next().unwrap().is_err());
    }
}
