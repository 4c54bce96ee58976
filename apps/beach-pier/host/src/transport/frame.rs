use beach_pier_core::{CoreError, MessageCodec, NetworkMessage, FRAME_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one length-prefixed message. `Ok(None)` means the peer closed the
/// stream cleanly on a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<NetworkMessage>, CoreError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(CoreError::ConnectionClosed)
            };
        }
        filled += n;
    }

    let len = MessageCodec::payload_len(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CoreError::ConnectionClosed
        } else {
            CoreError::Io(err)
        }
    })?;
    MessageCodec::decode_payload(&payload).map(Some)
}

pub async fn write_message<W>(writer: &mut W, message: &NetworkMessage) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let frame = MessageCodec::encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn messages_cross_a_pipe_in_order() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = vec![
            NetworkMessage::Ping { timestamp: 1 },
            NetworkMessage::input(Bytes::from(vec![b'x'; 500])),
            NetworkMessage::Close,
        ];
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                for message in &sent {
                    write_message(&mut client, message).await.unwrap();
                }
            })
        };

        for expected in sent {
            assert_eq!(read_message(&mut server).await.unwrap(), Some(expected));
        }
        writer.await.unwrap();
        assert_eq!(read_message(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = MessageCodec::encode(&NetworkMessage::Ping { timestamp: 9 }).unwrap();
        client.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(CoreError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_header_is_refused_before_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(CoreError::MessageTooLarge { .. })
        ));
    }
}
