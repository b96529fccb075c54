//! Async frame pumps between a channel context and its connection
//!
//! The writer drains the context's send queue whenever output is signalled;
//! the reader decodes provider responses and correlates them. Any I/O or
//! protocol failure on either side closes the context.

use crate::channel::context::AsyncChannelContext;
use crate::channel::message::{check_frame_len, ClassMessage, FRAME_HEADER_LEN};
use crate::core::error::{NetworkError, Result};
use crate::system::metrics;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Write one message as a length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, message: &ClassMessage, max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode_frame(max_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` when the peer closed the connection between frames
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<ClassMessage>>
where
    R: AsyncRead + Unpin,
{
    Ok(read_sized_frame(reader, max_size).await?.map(|(message, _)| message))
}

async fn read_sized_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<(ClassMessage, usize)>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_frame_len(len, max_size)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((ClassMessage::decode(&payload)?, len + FRAME_HEADER_LEN)))
}

/// Write queued request frames until the context closes
pub async fn write_outgoing<W>(ctx: &AsyncChannelContext, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        while let Some(frame) = ctx.next_outgoing() {
            if let Err(e) = writer.write_all(&frame).await {
                ctx.handle_exception(&e);
                return Err(e.into());
            }
            metrics::record(|m| {
                m.channel.frames_sent.inc();
                m.channel.bytes_sent.inc_by(frame.len() as u64);
            });
        }
        if let Err(e) = writer.flush().await {
            ctx.handle_exception(&e);
            return Err(e.into());
        }
        if ctx.is_closed() {
            debug!("Writer for {} stopping, context closed", ctx.channel());
            return Ok(());
        }
        ctx.output_ready().await;
    }
}

/// Read provider responses until the connection ends or fails
pub async fn read_incoming<R>(ctx: &AsyncChannelContext, reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_sized_frame(reader, ctx.max_message_size()).await {
            Ok(Some((ClassMessage::Response { key, id, definition }, len))) => {
                metrics::record(|m| {
                    m.channel.frames_received.inc();
                    m.channel.bytes_received.inc_by(len as u64);
                });
                if let Err(e) = ctx.deliver_response(&key, id, definition.map(Bytes::from)) {
                    warn!("Provider {}: {}", ctx.provider_uuid(), e);
                }
            }
            Ok(Some((ClassMessage::Request { key, .. }, _))) => {
                let error = NetworkError::Protocol(format!(
                    "provider sent a request for {}",
                    key
                ));
                ctx.handle_exception(&error);
                return Err(error.into());
            }
            Ok(None) => {
                ctx.handle_exception(&"connection closed by provider");
                return Ok(());
            }
            Err(e) => {
                ctx.handle_exception(&e);
                return Err(e);
            }
        }
        if ctx.is_closed() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::cache::MemoryResourceCache;
    use crate::channel::resource::{RequestFactory, RequestOutcome, ResourceKey};
    use crate::core::config::ChannelConfig;
    use crate::core::error::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const MAX: usize = 64 * 1024;

    /// Answers every request with the resource name as definition, except
    /// names starting with "Hang" which are never answered
    async fn fake_provider(stream: tokio::io::DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        while let Ok(Some(ClassMessage::Request { key, id })) = read_frame(&mut reader, MAX).await {
            if key.name.starts_with("Hang") {
                continue;
            }
            let definition = (!key.name.starts_with("Missing")).then(|| key.name.clone().into_bytes());
            let response = ClassMessage::Response { key, id, definition };
            if write_frame(&mut writer, &response, MAX).await.is_err() {
                break;
            }
        }
    }

    fn spawn_pumps(ctx: Arc<AsyncChannelContext>, stream: tokio::io::DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let writer_ctx = ctx.clone();
        tokio::spawn(async move { write_outgoing(&writer_ctx, &mut writer).await });
        tokio::spawn(async move { read_incoming(&ctx, &mut reader).await });
    }

    fn context() -> Arc<AsyncChannelContext> {
        Arc::new(AsyncChannelContext::new(
            "provider",
            Arc::new(MemoryResourceCache::new()),
            &ChannelConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_round_trip_through_provider() {
        let (driver_io, provider_io) = tokio::io::duplex(MAX);
        let ctx = context();
        spawn_pumps(ctx.clone(), driver_io);
        tokio::spawn(fake_provider(provider_io));

        let factory = RequestFactory::random();
        let (request, pending) = factory.request(ResourceKey::new("provider", "org/Task.class"));
        ctx.add_request(request).unwrap();
        let outcome = timeout(Duration::from_secs(5), pending.wait()).await.unwrap();
        assert_eq!(outcome, RequestOutcome::Resolved(Bytes::from_static(b"org/Task.class")));

        let (request, pending) = factory.request(ResourceKey::new("provider", "Missing.class"));
        ctx.add_request(request).unwrap();
        let outcome = timeout(Duration::from_secs(5), pending.wait()).await.unwrap();
        assert_eq!(outcome, RequestOutcome::NotFound);
        assert_eq!(ctx.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_disconnect_fails_pending_requests() {
        let (driver_io, provider_io) = tokio::io::duplex(MAX);
        let ctx = context();
        spawn_pumps(ctx.clone(), driver_io);
        let provider = tokio::spawn(fake_provider(provider_io));

        let factory = RequestFactory::random();
        let (request, pending) = factory.request(ResourceKey::new("provider", "HangForever.class"));
        ctx.add_request(request).unwrap();

        // let the request reach the provider, then kill it
        tokio::time::sleep(Duration::from_millis(50)).await;
        provider.abort();

        let outcome = timeout(Duration::from_secs(5), pending.wait()).await.unwrap();
        assert_eq!(outcome, RequestOutcome::ProviderError);
        assert!(ctx.is_closed());
        assert_eq!(ctx.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_context() {
        let (mut driver_io, mut provider_io) = tokio::io::duplex(MAX);
        let ctx = context();
        provider_io.write_u32_le(u32::MAX).await.unwrap();

        let result = read_incoming(&ctx, &mut driver_io).await;
        assert!(matches!(
            result,
            Err(Error::Network(NetworkError::MessageTooLarge { .. }))
        ));
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn test_writer_stops_when_context_closes() {
        let (mut driver_io, _provider_io) = tokio::io::duplex(MAX);
        let ctx = context();
        let writer_ctx = ctx.clone();
        let writer = tokio::spawn(async move { write_outgoing(&writer_ctx, &mut driver_io).await });

        ctx.handle_provider_error();
        let result = timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
